//! Single-layer rasterization
//!
//! Each layer is rendered alone: its fragment is wrapped in a minimal standalone
//! SVG carrying the shared definitions, then handed to a leased rendering handle.

use crate::document::{escape_attr, SharedDefinitions, SVG_NS, XLINK_NS};
use crate::extract::LayerDescriptor;
use crate::pool::Lease;
use crate::{Canvas, Error, RenderHandle, Result};
use image::RgbaImage;
use log::{debug, warn};
use std::time::Duration;

/// Rendered pixels for one layer, straight (non-premultiplied) RGBA.
#[derive(Debug, Clone)]
pub struct RasterLayer {
    pub name: String,
    pub pixels: RgbaImage,
}

impl RasterLayer {
    pub fn new(name: impl Into<String>, pixels: RgbaImage) -> Self {
        Self {
            name: name.into(),
            pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Bounding box `(left, top, right, bottom)` of pixels with non-zero alpha,
    /// right/bottom exclusive. `None` for a fully transparent layer.
    pub fn opaque_bounds(&self) -> Option<(u32, u32, u32, u32)> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (x, y, px) in self.pixels.enumerate_pixels() {
            if px[3] == 0 {
                continue;
            }
            bounds = Some(match bounds {
                None => (x, y, x + 1, y + 1),
                Some((l, t, r, b)) => (l.min(x), t.min(y), r.max(x + 1), b.max(y + 1)),
            });
        }
        bounds
    }
}

/// Renders layer descriptors on leased handles under a per-layer timeout.
#[derive(Debug, Clone)]
pub struct LayerRasterizer {
    timeout: Duration,
}

impl LayerRasterizer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build the standalone document for one layer.
    pub fn isolate(layer: &LayerDescriptor, shared: &SharedDefinitions, canvas: Canvas) -> String {
        let fragment = strip_prolog(&layer.markup_fragment);
        let mut doc = String::with_capacity(fragment.len() + shared.definitions.len() + 256);
        doc.push_str(&format!(
            r#"<svg xmlns="{}" xmlns:xlink="{}" width="{}" height="{}""#,
            SVG_NS, XLINK_NS, canvas.width, canvas.height
        ));
        for (name, value) in &shared.root_attributes {
            doc.push_str(&format!(r#" {}="{}""#, name, escape_attr(value)));
        }
        doc.push('>');
        doc.push_str(&shared.definitions);
        doc.push_str(fragment);
        doc.push_str("</svg>");
        doc
    }

    /// Render `layer` on the leased handle.
    ///
    /// The render runs on a blocking thread. If it outlives the timeout the
    /// handle is abandoned with it and the lease comes back empty. The pool
    /// slot stays taken until the abandoned render returns, so engine work
    /// never exceeds the pool's ceiling.
    pub async fn rasterize<H: RenderHandle>(
        &self,
        layer: &LayerDescriptor,
        shared: &SharedDefinitions,
        canvas: Canvas,
        lease: &mut Lease<H>,
    ) -> Result<RasterLayer> {
        let document = Self::isolate(layer, shared, canvas);
        let mut detached = lease
            .detach()
            .ok_or_else(|| Error::RenderError("lease holds no rendering handle".into()))?;

        let timeout = self.timeout;
        let job = tokio::task::spawn_blocking(move || {
            let res = detached.handle.render(&document, canvas, timeout);
            (detached, res)
        });

        let pixels = match tokio::time::timeout(timeout, job).await {
            Err(_) => {
                warn!("layer '{}' timed out after {}ms", layer.name, timeout.as_millis());
                return Err(Error::Timeout(timeout.as_millis() as u64));
            }
            Ok(Err(e)) => return Err(Error::RenderError(format!("render task failed: {}", e))),
            Ok(Ok((detached, res))) => {
                lease.reattach(detached);
                res?
            }
        };

        let pixels = fit_to_canvas(pixels, canvas)?;
        debug!("rasterized layer '{}' ({}x{})", layer.name, canvas.width, canvas.height);
        Ok(RasterLayer::new(layer.name.clone(), pixels))
    }
}

/// Crop a capture to exactly the canvas. Captures smaller than the canvas are
/// an engine failure.
fn fit_to_canvas(pixels: RgbaImage, canvas: Canvas) -> Result<RgbaImage> {
    let (w, h) = pixels.dimensions();
    if (w, h) == (canvas.width, canvas.height) {
        return Ok(pixels);
    }
    if w < canvas.width || h < canvas.height {
        return Err(Error::RenderError(format!(
            "capture is {}x{}, expected {}x{}",
            w, h, canvas.width, canvas.height
        )));
    }
    Ok(image::imageops::crop_imm(&pixels, 0, 0, canvas.width, canvas.height).to_image())
}

/// Drop a leading XML declaration, doctype and comments so the fragment can be
/// nested inside another `<svg>`.
fn strip_prolog(fragment: &str) -> &str {
    let mut rest = fragment.trim_start();
    loop {
        let end = if rest.starts_with("<?") {
            rest.find("?>").map(|i| i + 2)
        } else if rest.starts_with("<!--") {
            rest.find("-->").map(|i| i + 3)
        } else if rest.get(..9).is_some_and(|p| p.eq_ignore_ascii_case("<!doctype")) {
            match (rest.find('['), rest.find('>')) {
                (Some(open), Some(close)) if open < close => rest.find("]>").map(|i| i + 2),
                (_, close) => close.map(|i| i + 1),
            }
        } else {
            None
        };
        match end {
            Some(end) => rest = rest[end..].trim_start(),
            None => return rest,
        }
    }
}
