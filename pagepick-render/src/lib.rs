use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use pagepick_core::{DocumentBackend, RangeWindow, RenderImage, RenderRequest, Surface};

#[cfg(feature = "pdf")]
mod pdfium_backend;
#[cfg(feature = "pdf")]
pub use pdfium_backend::PdfiumProvider;

/// Asynchronous single-page preview pipeline.
///
/// Every accepted request gets a token from a monotonically increasing
/// counter; a completion only touches the surface while its token is still
/// the most recently issued one. A slow render for an old page can
/// therefore never overwrite the frame of a newer one, regardless of
/// completion order.
pub struct Previewer<S: Surface> {
    backend: Arc<dyn DocumentBackend>,
    scale: f32,
    latest: Arc<AtomicU64>,
    slot: Arc<Mutex<Option<S>>>,
}

impl<S: Surface + 'static> Previewer<S> {
    pub fn new(backend: Arc<dyn DocumentBackend>, surface: S, scale: f32) -> Self {
        Self {
            backend,
            scale,
            latest: Arc::new(AtomicU64::new(0)),
            slot: Arc::new(Mutex::new(Some(surface))),
        }
    }

    /// Requests a render of `page` (1-based). Returns immediately; the
    /// render runs on the blocking pool and presents itself when done.
    ///
    /// Pages outside the committed window are skipped, so transiently
    /// inconsistent selection states never reach the backend.
    pub fn request(&self, page: usize, window: RangeWindow) {
        let page_count = self.backend.info().page_count;
        if page < 1 || page < window.start || page > window.end || window.end > page_count {
            debug!(
                page,
                start = window.start,
                end = window.end,
                page_count,
                "skipping render outside the committed range"
            );
            return;
        }

        let token = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        let backend = Arc::clone(&self.backend);
        let latest = Arc::clone(&self.latest);
        let slot = Arc::clone(&self.slot);
        let request = RenderRequest {
            page_index: page - 1,
            scale: self.scale,
        };

        tokio::spawn(async move {
            let rendered = tokio::task::spawn_blocking(move || backend.render_page(request)).await;
            let image = match rendered {
                Ok(Ok(image)) => image,
                Ok(Err(err)) => {
                    warn!(page, error = %err, "page render failed, keeping previous frame");
                    return;
                }
                Err(err) => {
                    warn!(page, error = %err, "render task aborted");
                    return;
                }
            };
            present(&slot, &latest, token, page, &image);
        });
    }

    /// Tears the surface down. Completions arriving afterwards find an
    /// empty slot and drop their frame.
    pub fn close(&self) {
        self.slot.lock().take();
    }
}

fn present<S: Surface>(
    slot: &Mutex<Option<S>>,
    latest: &AtomicU64,
    token: u64,
    page: usize,
    image: &RenderImage,
) {
    let mut guard = slot.lock();
    if latest.load(Ordering::SeqCst) != token {
        debug!(page, token, "discarding superseded render");
        return;
    }
    let Some(surface) = guard.as_mut() else {
        debug!(page, "render completed after teardown");
        return;
    };
    // Size the surface to the frame first; drawing into a stale-sized
    // surface clips.
    let drawn = surface
        .resize(image.width, image.height)
        .and_then(|()| surface.draw(image));
    if let Err(err) = drawn {
        warn!(page, error = %err, "failed to present rendered page");
    }
}
