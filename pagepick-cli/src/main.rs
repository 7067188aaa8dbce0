use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use pagepick_core::{
    Bound, Command, Config, DocumentInfo, DocumentProvider, Effect, RenderImage, Selection,
    Surface, DEFAULT_SCALE,
};
use pagepick_render::{PdfiumProvider, Previewer};
use pagepick_submit::{Submission, Submitter, DEFAULT_ENDPOINT};
use png::{BitDepth, ColorType, Encoder};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};
use url::Url;

#[derive(Debug, Parser)]
#[command(
    name = "pagepick",
    version,
    about = "kitty-native PDF page-range picker"
)]
struct Args {
    /// Page to open on (1-based)
    #[arg(short = 'p', long = "page")]
    page: Option<usize>,

    /// Initial range start (1-based)
    #[arg(long)]
    start: Option<usize>,

    /// Initial range end (1-based, inclusive)
    #[arg(long)]
    end: Option<usize>,

    /// Processing endpoint receiving the confirmed range
    #[arg(long)]
    endpoint: Option<Url>,

    /// Render scale applied to every page
    #[arg(long)]
    scale: Option<f32>,

    /// Path to the PDF file
    file: PathBuf,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "pagepick", "pagepick")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = Config::load(&project_dirs)?;

    let endpoint = match args.endpoint {
        Some(endpoint) => endpoint,
        None => {
            let raw = config.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
            Url::parse(raw).with_context(|| format!("invalid endpoint {:?}", raw))?
        }
    };
    let scale = args.scale.or(config.scale).unwrap_or(DEFAULT_SCALE);

    let provider = PdfiumProvider::new()?;
    let backend = provider
        .open(&args.file)
        .await
        .with_context(|| format!("failed to open {:?}", args.file))?;
    let info = backend.info().clone();

    let mut selection = Selection::new(info.page_count);
    let mut startup = Vec::new();
    if args.start.is_some() || args.end.is_some() {
        if let Some(page) = args.start {
            startup.push(Command::SetBound {
                bound: Bound::Start,
                page,
            });
        }
        if let Some(page) = args.end {
            startup.push(Command::SetBound {
                bound: Bound::End,
                page,
            });
        }
        startup.push(Command::CommitRange);
    }
    if let Some(page) = args.page {
        startup.push(Command::GotoPage { page });
    }

    let submitter = Submitter::new(endpoint);

    let _raw = RawModeGuard::new()?;
    {
        let mut stdout = io::stdout();
        crossterm::execute!(stdout, cursor::Hide, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    }
    let surface = KittySurface::new(io::stdout());
    let previewer = Previewer::new(Arc::clone(&backend), surface, scale);

    let mut effects: Vec<Effect> = Vec::new();
    for command in startup {
        effects.extend(selection.apply(command));
    }
    if !selection.is_empty()
        && !effects
            .iter()
            .any(|effect| matches!(effect, Effect::PageChanged { .. }))
    {
        effects.push(Effect::PageChanged {
            page: selection.current(),
        });
    }
    run_effects(&effects, &selection, &info, &previewer, &submitter);

    let mut mapper = KeyMapper::new();
    draw_status(&format_status(&selection, &info, None))?;

    loop {
        if event::poll(Duration::from_millis(100))? {
            let ev = event::read()?;
            let command = match mapper.map_event(ev) {
                UiEvent::Command(command) => Some(command),
                UiEvent::StageBound { bound, page } => Some(Command::SetBound {
                    bound,
                    page: page.unwrap_or_else(|| selection.current()),
                }),
                UiEvent::Quit => break,
                UiEvent::None => None,
            };
            if let Some(command) = command {
                let effects = selection.apply(command);
                run_effects(&effects, &selection, &info, &previewer, &submitter);
            }
            draw_status(&format_status(
                &selection,
                &info,
                mapper.pending_input().as_deref(),
            ))?;
        }
    }

    previewer.close();
    {
        let mut stdout = io::stdout();
        crossterm::execute!(stdout, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    }
    Ok(())
}

fn run_effects(
    effects: &[Effect],
    selection: &Selection,
    info: &DocumentInfo,
    previewer: &Previewer<KittySurface<io::Stdout>>,
    submitter: &Submitter,
) {
    for effect in effects {
        match effect {
            Effect::PageChanged { page } => previewer.request(*page, selection.window()),
            Effect::RangeCommitted { .. } => {}
            Effect::Confirmed { start, end } => {
                match Submission::from_document(info, *start, *end) {
                    Ok(submission) => submitter.dispatch(submission),
                    Err(err) => warn!(error = %err, "failed to build submission"),
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
enum UiEvent {
    Command(Command),
    /// Stage a bound edit; `page: None` means "use the page on display".
    StageBound { bound: Bound, page: Option<usize> },
    Quit,
    None,
}

#[derive(Debug, Default)]
struct KeyMapper {
    pending_count: Option<usize>,
    pending_digits: String,
}

impl KeyMapper {
    fn new() -> Self {
        Self::default()
    }

    fn map_event(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                    if let Some(digit) = c.to_digit(10) {
                        self.push_digit(digit as usize);
                    }
                    UiEvent::None
                }
                (KeyCode::Char('j'), KeyModifiers::NONE) | (KeyCode::Down, KeyModifiers::NONE) => {
                    UiEvent::Command(Command::NextPage {
                        count: self.take_count(),
                    })
                }
                (KeyCode::Char('k'), KeyModifiers::NONE) | (KeyCode::Up, KeyModifiers::NONE) => {
                    UiEvent::Command(Command::PrevPage {
                        count: self.take_count(),
                    })
                }
                (KeyCode::Char('g'), KeyModifiers::NONE) => {
                    let page = self.take_page().unwrap_or(1);
                    UiEvent::Command(Command::GotoPage { page })
                }
                (KeyCode::Char('G'), modifiers)
                    if modifiers.is_empty() || modifiers == KeyModifiers::SHIFT =>
                {
                    self.reset_count();
                    UiEvent::Command(Command::GotoPage { page: usize::MAX })
                }
                (KeyCode::Char('['), _) => UiEvent::StageBound {
                    bound: Bound::Start,
                    page: self.take_page(),
                },
                (KeyCode::Char(']'), _) => UiEvent::StageBound {
                    bound: Bound::End,
                    page: self.take_page(),
                },
                (KeyCode::Enter, _) => {
                    self.reset_count();
                    UiEvent::Command(Command::CommitRange)
                }
                (KeyCode::Char('c'), KeyModifiers::NONE) => {
                    self.reset_count();
                    UiEvent::Command(Command::Confirm)
                }
                (KeyCode::Char('q'), _) => {
                    self.reset_count();
                    UiEvent::Quit
                }
                (KeyCode::Esc, _) => {
                    self.reset_count();
                    UiEvent::None
                }
                _ => {
                    self.reset_count();
                    UiEvent::None
                }
            },
            _ => UiEvent::None,
        }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn take_page(&mut self) -> Option<usize> {
        let page = self.pending_count.take().filter(|&page| page > 0);
        self.pending_digits.clear();
        page
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    fn pending_input(&self) -> Option<String> {
        if self.pending_digits.is_empty() {
            None
        } else {
            Some(self.pending_digits.clone())
        }
    }
}

struct KittySurface<W: Write + Send> {
    writer: W,
    image_id: u32,
    placement_id: u32,
    width: u32,
    height: u32,
}

impl<W: Write + Send> KittySurface<W> {
    fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            placement_id: 1,
            width: 0,
            height: 0,
        }
    }
}

impl<W: Write + Send> Surface for KittySurface<W> {
    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn draw(&mut self, image: &RenderImage) -> Result<()> {
        let window = terminal::window_size()?;
        let total_cols = u32::from(window.columns).max(1);
        let total_rows = u32::from(window.rows).max(1);
        let cell_width = if window.width > 0 {
            f32::from(window.width) / total_cols as f32
        } else {
            0.0
        };
        let cell_height = if window.height > 0 {
            f32::from(window.height) / total_rows as f32
        } else {
            0.0
        };
        // Bottom row stays free for the status line.
        let (columns, rows) = fit_cells(
            self.width,
            self.height,
            total_cols,
            total_rows.saturating_sub(1).max(1),
            cell_width,
            cell_height,
        );

        let mut buffer = Vec::new();
        let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut png_writer = encoder.write_header()?;
        png_writer.write_image_data(&image.pixels)?;
        png_writer.finish()?;

        crossterm::execute!(&mut self.writer, cursor::MoveTo(0, 0))?;

        let encoded = BASE64.encode(&buffer);
        let mut chunks = encoded.as_bytes().chunks(4096).peekable();
        let mut first = true;

        while let Some(chunk) = chunks.next() {
            let more = chunks.peek().is_some();
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},s={},v={},z=-1,m={}",
                    self.image_id,
                    self.placement_id,
                    columns,
                    rows,
                    image.width,
                    image.height,
                    if more { 1 } else { 0 }
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", if more { 1 } else { 0 })?;
            }
            if !chunk.is_empty() {
                self.writer.write_all(b";")?;
                self.writer.write_all(chunk)?;
            }
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }
}

/// Fits an image into the cell grid preserving its aspect ratio. Falls
/// back to the full area when the terminal reports no pixel dimensions.
fn fit_cells(
    image_width: u32,
    image_height: u32,
    max_cols: u32,
    max_rows: u32,
    cell_width: f32,
    cell_height: f32,
) -> (u32, u32) {
    let max_cols = max_cols.max(1);
    let max_rows = max_rows.max(1);
    if image_width == 0 || image_height == 0 || cell_width <= 0.0 || cell_height <= 0.0 {
        return (max_cols, max_rows);
    }

    let mut cols = (image_width as f32 / cell_width).ceil().max(1.0);
    let mut rows = (image_height as f32 / cell_height).ceil().max(1.0);
    let scale = (max_cols as f32 / cols).min(max_rows as f32 / rows).min(1.0);
    cols = (cols * scale).round().max(1.0);
    rows = (rows * scale).round().max(1.0);

    (
        cols.min(max_cols as f32) as u32,
        rows.min(max_rows as f32) as u32,
    )
}

fn format_status(selection: &Selection, info: &DocumentInfo, pending: Option<&str>) -> String {
    let name = info
        .path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("<unknown>");

    let mut status = if selection.is_empty() {
        format!("{} — empty document", name)
    } else {
        format!(
            "{} — page {}/{} — range {}..{} ({} pages)",
            name,
            selection.current(),
            info.page_count,
            selection.start(),
            selection.end(),
            selection.span()
        )
    };

    if let Some(pending) = pending.filter(|p| !p.is_empty()) {
        status.push_str(" | ");
        status.push_str(pending);
    }

    status
}

fn draw_status(status: &str) -> Result<()> {
    let window = terminal::window_size()?;
    let total_rows = u32::from(window.rows).max(1);
    let status_row = total_rows.saturating_sub(1);
    let mut stdout = io::stdout();
    crossterm::execute!(
        stdout,
        cursor::MoveTo(0, status_row as u16),
        Clear(ClearType::CurrentLine)
    )?;
    write!(stdout, "{}", status)?;
    stdout.flush()?;
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "pagepick.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crossterm::event::{KeyEventKind, KeyEventState};
    use pagepick_core::document_id_for_path;

    fn key_event(code: KeyCode) -> Event {
        key_event_with_modifiers(code, KeyModifiers::NONE)
    }

    fn key_event_with_modifiers(code: KeyCode, modifiers: KeyModifiers) -> Event {
        Event::Key(KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        })
    }

    #[test]
    fn mapper_uses_numeric_prefix_for_next_page() {
        let mut mapper = KeyMapper::new();
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('1'))),
            UiEvent::None
        ));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('2'))),
            UiEvent::None
        ));

        match mapper.map_event(key_event(KeyCode::Char('j'))) {
            UiEvent::Command(Command::NextPage { count }) => assert_eq!(count, 12),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn mapper_resets_prefix_after_use() {
        let mut mapper = KeyMapper::new();
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('3'))),
            UiEvent::None
        ));

        match mapper.map_event(key_event(KeyCode::Char('k'))) {
            UiEvent::Command(Command::PrevPage { count }) => assert_eq!(count, 3),
            other => panic!("unexpected event: {:?}", other),
        }

        match mapper.map_event(key_event(KeyCode::Char('k'))) {
            UiEvent::Command(Command::PrevPage { count }) => assert_eq!(count, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn mapper_maps_digits_and_g_to_goto() {
        let mut mapper = KeyMapper::new();
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('7'))),
            UiEvent::None
        ));

        match mapper.map_event(key_event(KeyCode::Char('g'))) {
            UiEvent::Command(Command::GotoPage { page }) => assert_eq!(page, 7),
            other => panic!("unexpected event: {:?}", other),
        }

        match mapper.map_event(key_event(KeyCode::Char('g'))) {
            UiEvent::Command(Command::GotoPage { page }) => assert_eq!(page, 1),
            other => panic!("unexpected event: {:?}", other),
        }

        match mapper.map_event(key_event_with_modifiers(
            KeyCode::Char('G'),
            KeyModifiers::SHIFT,
        )) {
            UiEvent::Command(Command::GotoPage { page }) => assert_eq!(page, usize::MAX),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn mapper_stages_bounds_with_and_without_digits() {
        let mut mapper = KeyMapper::new();
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('4'))),
            UiEvent::None
        ));

        match mapper.map_event(key_event(KeyCode::Char('['))) {
            UiEvent::StageBound {
                bound: Bound::Start,
                page,
            } => assert_eq!(page, Some(4)),
            other => panic!("unexpected event: {:?}", other),
        }

        match mapper.map_event(key_event(KeyCode::Char(']'))) {
            UiEvent::StageBound {
                bound: Bound::End,
                page,
            } => assert_eq!(page, None),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn mapper_maps_enter_to_commit_and_c_to_confirm() {
        let mut mapper = KeyMapper::new();
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Enter)),
            UiEvent::Command(Command::CommitRange)
        ));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('c'))),
            UiEvent::Command(Command::Confirm)
        ));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('q'))),
            UiEvent::Quit
        ));
    }

    #[test]
    fn mapper_pending_input_shows_digits_until_consumed() {
        let mut mapper = KeyMapper::new();
        assert!(mapper.pending_input().is_none());
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('1'))),
            UiEvent::None
        ));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('2'))),
            UiEvent::None
        ));
        assert_eq!(mapper.pending_input().as_deref(), Some("12"));

        let _ = mapper.map_event(key_event(KeyCode::Char('j')));
        assert!(mapper.pending_input().is_none());
    }

    #[test]
    fn mapper_escape_clears_pending_digits() {
        let mut mapper = KeyMapper::new();
        let _ = mapper.map_event(key_event(KeyCode::Char('9')));
        assert!(mapper.pending_input().is_some());
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Esc)),
            UiEvent::None
        ));
        assert!(mapper.pending_input().is_none());
    }

    #[test]
    fn fit_cells_preserves_aspect_within_grid() {
        // 1000x1000 px image, 100x40 cells of 10x20 px: height limits the
        // placement to 40 rows == 800 px, so width shrinks to 80 cols.
        let (cols, rows) = fit_cells(1000, 1000, 100, 40, 10.0, 20.0);
        assert_eq!(rows, 40);
        assert_eq!(cols, 80);
    }

    #[test]
    fn fit_cells_does_not_upscale_small_images() {
        let (cols, rows) = fit_cells(100, 40, 100, 40, 10.0, 20.0);
        assert_eq!((cols, rows), (10, 2));
    }

    #[test]
    fn fit_cells_falls_back_without_pixel_dimensions() {
        let (cols, rows) = fit_cells(1000, 1000, 80, 24, 0.0, 0.0);
        assert_eq!((cols, rows), (80, 24));
    }

    #[test]
    fn status_line_shows_page_range_and_pending_input() {
        let path = PathBuf::from("/tmp/paper.pdf");
        let info = DocumentInfo {
            id: document_id_for_path(&path),
            path,
            page_count: 10,
        };
        let mut selection = Selection::new(10);
        let _ = selection.apply(Command::SetBound {
            bound: Bound::Start,
            page: 3,
        });
        let _ = selection.apply(Command::SetBound {
            bound: Bound::End,
            page: 8,
        });
        let _ = selection.apply(Command::CommitRange);

        let status = format_status(&selection, &info, Some("42"));
        assert_eq!(status, "paper.pdf — page 3/10 — range 3..8 (6 pages) | 42");
    }

    #[test]
    fn status_line_marks_empty_documents() {
        let path = PathBuf::from("/tmp/empty.pdf");
        let info = DocumentInfo {
            id: document_id_for_path(&path),
            path,
            page_count: 0,
        };
        let selection = Selection::new(0);
        assert_eq!(
            format_status(&selection, &info, None),
            "empty.pdf — empty document"
        );
    }
}
