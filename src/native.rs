//! Native rasterizer backend
//!
//! Renders isolated layer documents in-process with `resvg`. The system font
//! database is the expensive part of start-up; it is loaded once per renderer
//! and shared by every handle.

use crate::{Canvas, EngineConfig, Error, RenderHandle, Renderer, Result};
use image::RgbaImage;
use log::debug;
use resvg::tiny_skia::{Pixmap, Transform};
use resvg::usvg;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-process renderer backed by `resvg`.
pub struct NativeRenderer {
    fontdb: Arc<usvg::fontdb::Database>,
    block_auxiliary_resources: bool,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl NativeRenderer {
    pub fn new(config: &EngineConfig) -> Self {
        let mut db = usvg::fontdb::Database::new();
        db.load_system_fonts();
        debug!("native renderer loaded {} font faces", db.len());
        Self::with_fontdb(Arc::new(db), config)
    }

    /// Use an already populated font database.
    pub fn with_fontdb(fontdb: Arc<usvg::fontdb::Database>, config: &EngineConfig) -> Self {
        Self {
            fontdb,
            block_auxiliary_resources: config.block_auxiliary_resources,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn options(&self) -> usvg::Options<'static> {
        let mut options = usvg::Options {
            fontdb: Arc::clone(&self.fontdb),
            resources_dir: None,
            ..Default::default()
        };
        if self.block_auxiliary_resources {
            // Inline data: images stay; anything that names a file or URL is refused.
            options.image_href_resolver = usvg::ImageHrefResolver {
                resolve_data: usvg::ImageHrefResolver::default_data_resolver(),
                resolve_string: Box::new(|href, _| {
                    debug!("blocked external image reference {:?}", href);
                    None
                }),
            };
        }
        options
    }
}

impl Renderer for NativeRenderer {
    type Handle = NativeHandle;

    fn create_handle(&self) -> Result<NativeHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::HandleCreationError("native renderer is shut down".into()));
        }
        Ok(NativeHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            options: self.options(),
        })
    }

    fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// One parse-and-render context. Holds no per-document state between renders.
pub struct NativeHandle {
    id: u64,
    options: usvg::Options<'static>,
}

impl RenderHandle for NativeHandle {
    fn id(&self) -> u64 {
        self.id
    }

    // resvg has no cancellation point; the caller enforces the timeout.
    fn render(&mut self, document: &str, canvas: Canvas, _timeout: Duration) -> Result<RgbaImage> {
        let tree = usvg::Tree::from_str(document, &self.options)
            .map_err(|e| Error::RenderError(format!("Failed to parse layer document: {}", e)))?;

        let mut pixmap = Pixmap::new(canvas.width, canvas.height).ok_or_else(|| {
            Error::RenderError(format!(
                "Failed to allocate {}x{} pixmap",
                canvas.width, canvas.height
            ))
        })?;

        let size = tree.size();
        let sx = canvas.width as f32 / size.width();
        let sy = canvas.height as f32 / size.height();
        resvg::render(&tree, Transform::from_scale(sx, sy), &mut pixmap.as_mut());

        // tiny-skia stores premultiplied colour; layers carry straight alpha.
        let data = pixmap
            .pixels()
            .iter()
            .flat_map(|px| {
                let c = px.demultiply();
                [c.red(), c.green(), c.blue(), c.alpha()]
            })
            .collect();
        RgbaImage::from_raw(canvas.width, canvas.height, data)
            .ok_or_else(|| Error::RenderError("pixmap size does not match canvas".into()))
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}
