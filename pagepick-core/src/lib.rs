use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use once_cell::sync::Lazy;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

pub type DocumentId = Uuid;

pub const DEFAULT_SCALE: f32 = 1.5;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("9f1c6c1e-5a2b-5d4e-8c3a-2f7b1d9e4a61").expect("valid namespace UUID")
});

pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&DOCUMENT_NAMESPACE, rendered.as_bytes())
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub path: PathBuf,
    pub page_count: usize,
}

/// Backend-facing render parameters. `page_index` is 0-based here; the
/// selection model and everything user-facing counts pages from 1.
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    pub page_index: usize,
    pub scale: f32,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            page_index: 0,
            scale: DEFAULT_SCALE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// The committed range, as handed to the render guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeWindow {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Start,
    End,
}

#[derive(Debug, Clone)]
pub enum Command {
    NextPage { count: usize },
    PrevPage { count: usize },
    GotoPage { page: usize },
    SetBound { bound: Bound, page: usize },
    CommitRange,
    Confirm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// The displayed page changed; the caller should request a render.
    PageChanged { page: usize },
    /// A valid range was committed (possibly by the reset recovery).
    RangeCommitted { start: usize, end: usize },
    /// The user confirmed the selection; the caller should submit it.
    Confirmed { start: usize, end: usize },
}

#[derive(Debug, Clone, Copy)]
struct RangeDraft {
    start: usize,
    end: usize,
}

/// Single source of truth for the page count, the selected range and the
/// page on display. Pages are 1-based; whenever `page_count > 0` the
/// invariants `1 <= start <= end <= page_count` and
/// `start <= current <= end` hold after every operation returns.
///
/// `page_count == 0` is the degenerate empty-document state: every
/// operation is a no-op and no effects are emitted.
#[derive(Debug, Clone)]
pub struct Selection {
    page_count: usize,
    start: usize,
    end: usize,
    current: usize,
    draft: Option<RangeDraft>,
}

impl Selection {
    pub fn new(page_count: usize) -> Self {
        if page_count == 0 {
            return Self {
                page_count: 0,
                start: 0,
                end: 0,
                current: 0,
                draft: None,
            };
        }
        Self {
            page_count,
            start: 1,
            end: page_count,
            current: 1,
            draft: None,
        }
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// Number of pages in the committed range.
    pub fn span(&self) -> usize {
        if self.page_count == 0 {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn window(&self) -> RangeWindow {
        RangeWindow {
            start: self.start,
            end: self.end,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.page_count == 0
    }

    #[must_use]
    pub fn apply(&mut self, command: Command) -> Vec<Effect> {
        match command {
            Command::NextPage { count } => self.advance_by(count),
            Command::PrevPage { count } => self.retreat_by(count),
            Command::GotoPage { page } => self.set_current_page(page),
            Command::SetBound { bound, page } => self.set_bound(bound, page),
            Command::CommitRange => self.commit_range(),
            Command::Confirm => self.confirm(),
        }
    }

    /// Clamps into `[start, min(end, page_count)]` immediately; there is no
    /// transiently out-of-range current page.
    pub fn set_current_page(&mut self, page: usize) -> Vec<Effect> {
        if self.page_count == 0 {
            return Vec::new();
        }
        let clamped = page.clamp(self.start, self.end.min(self.page_count));
        if clamped == self.current {
            return Vec::new();
        }
        self.current = clamped;
        vec![Effect::PageChanged { page: clamped }]
    }

    pub fn advance(&mut self) -> Vec<Effect> {
        self.advance_by(1)
    }

    pub fn advance_by(&mut self, count: usize) -> Vec<Effect> {
        if self.page_count == 0 {
            return Vec::new();
        }
        self.set_current_page(self.current.saturating_add(count))
    }

    pub fn retreat(&mut self) -> Vec<Effect> {
        self.retreat_by(1)
    }

    pub fn retreat_by(&mut self, count: usize) -> Vec<Effect> {
        if self.page_count == 0 {
            return Vec::new();
        }
        self.set_current_page(self.current.saturating_sub(count))
    }

    /// Stages a bound edit without validating it. Nothing takes effect
    /// until `commit_range`.
    pub fn set_bound(&mut self, bound: Bound, page: usize) -> Vec<Effect> {
        if self.page_count == 0 {
            return Vec::new();
        }
        let mut draft = self.draft.unwrap_or(RangeDraft {
            start: self.start,
            end: self.end,
        });
        match bound {
            Bound::Start => draft.start = page,
            Bound::End => draft.end = page,
        }
        self.draft = Some(draft);
        Vec::new()
    }

    /// Validates the staged bounds. A valid draft is committed and the
    /// current page clamped into it. An invalid draft resets the whole
    /// range to `{1, page_count}` and the current page to 1; the recovery
    /// is silent apart from a debug log line.
    pub fn commit_range(&mut self) -> Vec<Effect> {
        if self.page_count == 0 {
            return Vec::new();
        }
        let Some(draft) = self.draft.take() else {
            return Vec::new();
        };

        let mut effects = Vec::new();
        if draft.start >= 1 && draft.start <= draft.end && draft.end <= self.page_count {
            if draft.start != self.start || draft.end != self.end {
                self.start = draft.start;
                self.end = draft.end;
                effects.push(Effect::RangeCommitted {
                    start: self.start,
                    end: self.end,
                });
            }
            let clamped = self.current.clamp(self.start, self.end);
            if clamped != self.current {
                self.current = clamped;
                effects.push(Effect::PageChanged { page: clamped });
            }
        } else {
            debug!(
                start = draft.start,
                end = draft.end,
                page_count = self.page_count,
                "invalid range commit, resetting to full document"
            );
            if self.start != 1 || self.end != self.page_count {
                self.start = 1;
                self.end = self.page_count;
                effects.push(Effect::RangeCommitted {
                    start: self.start,
                    end: self.end,
                });
            }
            if self.current != 1 {
                self.current = 1;
                effects.push(Effect::PageChanged { page: 1 });
            }
        }
        effects
    }

    /// Commits any staged bounds first, so a confirmation always ships the
    /// range the user last saw applied (or the reset recovery of an invalid
    /// edit), never a stale one.
    pub fn confirm(&mut self) -> Vec<Effect> {
        if self.page_count == 0 {
            return Vec::new();
        }
        let mut effects = self.commit_range();
        effects.push(Effect::Confirmed {
            start: self.start,
            end: self.end,
        });
        effects
    }
}

pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>>;
}

/// Display boundary. `resize` is called with the frame's natural
/// dimensions before every `draw`; drawing into an unsized surface would
/// clip.
pub trait Surface: Send {
    fn resize(&mut self, width: u32, height: u32) -> Result<()>;
    fn draw(&mut self, image: &RenderImage) -> Result<()>;
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub endpoint: Option<String>,
    pub scale: Option<f32>,
}

impl Config {
    pub fn load(dirs: &ProjectDirs) -> Result<Self> {
        Self::load_from(&dirs.config_dir().join("config.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        Ok(config)
    }
}
