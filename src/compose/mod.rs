//! Layered document composition
//!
//! Rasterized layers are stacked into a [`LayeredDocument`] and serialized as a
//! PSD file. The document keeps its layers top-most first, the way a layers
//! panel lists them; paint order from extraction is the reverse.

pub mod inspect;
pub mod packbits;
mod psd;

use crate::document::MAX_CANVAS_EDGE;
use crate::rasterize::RasterLayer;
use crate::{Error, Result};
use image::{Rgba, RgbaImage};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Channel data compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Uncompressed planes
    Raw,
    /// PackBits run-length encoding
    #[default]
    Rle,
}

impl Compression {
    /// Compression code stored in the container.
    pub fn code(self) -> u16 {
        match self {
            Compression::Raw => 0,
            Compression::Rle => 1,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Compression::Raw),
            1 => Some(Compression::Rle),
            _ => None,
        }
    }
}

/// Colour model of the composed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ColorModel {
    Rgb,
}

/// A stack of equally sized raster layers.
#[derive(Debug, Clone)]
pub struct LayeredDocument {
    width: u32,
    height: u32,
    color_model: ColorModel,
    layers: Vec<RasterLayer>,
    background: Option<Rgba<u8>>,
}

impl LayeredDocument {
    /// Build from layers in paint order (first = bottom-most).
    pub fn from_paint_order(width: u32, height: u32, mut layers: Vec<RasterLayer>) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::CompositionError("no layers to compose".into()));
        }
        if width == 0 || height == 0 || width > MAX_CANVAS_EDGE || height > MAX_CANVAS_EDGE {
            return Err(Error::CompositionError(format!(
                "canvas {}x{} is outside 1..={} pixels",
                width, height, MAX_CANVAS_EDGE
            )));
        }
        if let Some(bad) = layers
            .iter()
            .find(|l| l.width() != width || l.height() != height)
        {
            return Err(Error::CompositionError(format!(
                "layer '{}' is {}x{}, canvas is {}x{}",
                bad.name,
                bad.width(),
                bad.height(),
                width,
                height
            )));
        }
        layers.reverse();
        Ok(Self {
            width,
            height,
            color_model: ColorModel::Rgb,
            layers,
            background: None,
        })
    }

    /// Fill the merged composite with `color` under all layers.
    pub fn with_background(mut self, color: Option<Rgba<u8>>) -> Self {
        self.background = color;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn color_model(&self) -> ColorModel {
        self.color_model
    }

    /// Layers, top-most first.
    pub fn layers(&self) -> &[RasterLayer] {
        &self.layers
    }

    /// Flatten all layers bottom-up with source-over onto the background.
    pub fn composite(&self) -> RgbaImage {
        let fill = self.background.unwrap_or(Rgba([0, 0, 0, 0]));
        let mut out = RgbaImage::from_pixel(self.width, self.height, fill);
        for layer in self.layers.iter().rev() {
            for (dst, src) in out.pixels_mut().zip(layer.pixels.pixels()) {
                *dst = source_over(*src, *dst);
            }
        }
        out
    }
}

fn source_over(src: Rgba<u8>, dst: Rgba<u8>) -> Rgba<u8> {
    let sa = src[3] as f32 / 255.0;
    if sa >= 1.0 {
        return src;
    }
    if sa <= 0.0 {
        return dst;
    }
    let da = dst[3] as f32 / 255.0;
    let out_a = sa + da * (1.0 - sa);
    let mut px = [0u8; 4];
    for c in 0..3 {
        let v = (src[c] as f32 * sa + dst[c] as f32 * da * (1.0 - sa)) / out_a;
        px[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    px[3] = (out_a * 255.0).round() as u8;
    Rgba(px)
}

/// Parse a background colour. `transparent` (or nothing) means no fill.
pub fn parse_color(raw: &str) -> Result<Option<Rgba<u8>>> {
    let s = raw.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("transparent") || s.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let invalid = || Error::ConfigError(format!("unsupported background colour {:?}", raw));
    let hex = s.strip_prefix('#').ok_or_else(invalid)?;
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let digit = |i: usize| u8::from_str_radix(&hex[i..i + 1], 16).map(|v| v * 17);
    let pair = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16);
    let rgba = match hex.len() {
        3 => [digit(0), digit(1), digit(2), Ok(255)],
        6 => [pair(0), pair(2), pair(4), Ok(255)],
        8 => [pair(0), pair(2), pair(4), pair(6)],
        _ => return Err(invalid()),
    };
    let mut px = [0u8; 4];
    for (dst, v) in px.iter_mut().zip(rgba) {
        *dst = v.map_err(|_| invalid())?;
    }
    Ok(Some(Rgba(px)))
}

/// Serializes layered documents and writes them to disk.
#[derive(Debug, Clone)]
pub struct Composer {
    compression: Compression,
    temp_dir: PathBuf,
}

impl Composer {
    pub fn new(compression: Compression, temp_dir: Option<PathBuf>) -> Self {
        Self {
            compression,
            temp_dir: temp_dir.unwrap_or_else(std::env::temp_dir),
        }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Serialize to PSD bytes.
    pub fn compose(&self, doc: &LayeredDocument) -> Result<Vec<u8>> {
        let bytes = psd::write(doc, self.compression)?;
        debug!(
            "composed {}x{} document with {} layers ({} bytes)",
            doc.width(),
            doc.height(),
            doc.layers().len(),
            bytes.len()
        );
        Ok(bytes)
    }

    /// Serialize and write to a new, uniquely named file. The caller owns the
    /// returned path.
    pub async fn write_temp(&self, doc: &LayeredDocument) -> Result<PathBuf> {
        let bytes = self.compose(doc)?;
        let path = self
            .temp_dir
            .join(format!("layerforge-{}.psd", uuid::Uuid::new_v4()));
        if let Err(e) = write_new_file(&path, &bytes).await {
            if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove partial output {}: {}", path.display(), cleanup);
                }
            }
            return Err(e.into());
        }
        Ok(path)
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(name: &str, w: u32, h: u32, px: [u8; 4]) -> RasterLayer {
        RasterLayer::new(name, RgbaImage::from_pixel(w, h, Rgba(px)))
    }

    #[test]
    fn layers_are_stored_top_most_first() {
        let doc = LayeredDocument::from_paint_order(
            2,
            2,
            vec![solid("bottom", 2, 2, [0; 4]), solid("top", 2, 2, [0; 4])],
        )
        .unwrap();
        let names: Vec<_> = doc.layers().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["top", "bottom"]);
    }

    #[test]
    fn empty_or_mismatched_layers_are_rejected() {
        assert!(matches!(
            LayeredDocument::from_paint_order(2, 2, vec![]),
            Err(Error::CompositionError(_))
        ));
        assert!(LayeredDocument::from_paint_order(2, 2, vec![solid("x", 3, 2, [0; 4])]).is_err());
        assert!(LayeredDocument::from_paint_order(40_000, 2, vec![solid("x", 40_000, 2, [0; 4])]).is_err());
    }

    #[test]
    fn composite_paints_top_layer_last() {
        let doc = LayeredDocument::from_paint_order(
            1,
            1,
            vec![solid("blue", 1, 1, [0, 0, 255, 255]), solid("red", 1, 1, [255, 0, 0, 255])],
        )
        .unwrap();
        assert_eq!(doc.composite().get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn composite_blends_translucent_layers_over_background() {
        let doc = LayeredDocument::from_paint_order(1, 1, vec![solid("half", 1, 1, [255, 255, 255, 128])])
            .unwrap()
            .with_background(Some(Rgba([0, 0, 0, 255])));
        let px = doc.composite().get_pixel(0, 0).0;
        assert_eq!(px[3], 255);
        assert!((127..=129).contains(&px[0]));
    }

    #[test]
    fn parses_background_colours() {
        assert_eq!(parse_color("#fff").unwrap(), Some(Rgba([255, 255, 255, 255])));
        assert_eq!(parse_color("#102030").unwrap(), Some(Rgba([16, 32, 48, 255])));
        assert_eq!(parse_color("#10203040").unwrap(), Some(Rgba([16, 32, 48, 64])));
        assert_eq!(parse_color("transparent").unwrap(), None);
        assert!(parse_color("red").is_err());
        assert!(parse_color("#12").is_err());
        assert!(parse_color("#ééé").is_err());
    }

    #[tokio::test]
    async fn write_temp_creates_unique_files() {
        let dir = std::env::temp_dir().join(format!("layerforge-compose-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let composer = Composer::new(Compression::Rle, Some(dir.clone()));
        let doc = LayeredDocument::from_paint_order(2, 2, vec![solid("a", 2, 2, [1, 2, 3, 255])]).unwrap();

        let first = composer.write_temp(&doc).await.unwrap();
        let second = composer.write_temp(&doc).await.unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with(&dir));
        assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
