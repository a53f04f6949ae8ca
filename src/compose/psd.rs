//! PSD (version 1) serialization
//!
//! Layout: file header, empty colour-mode and image-resource sections, the
//! layer-and-mask section (records, then channel data), and finally the merged
//! composite image. Layer records are stored bottom-most first.

use super::{packbits, Compression, LayeredDocument};
use crate::rasterize::RasterLayer;
use crate::{Error, Result};
use image::RgbaImage;

pub(crate) const SIGNATURE: &[u8; 4] = b"8BPS";
pub(crate) const RESOURCE_SIGNATURE: &[u8; 4] = b"8BIM";
pub(crate) const BLEND_NORMAL: &[u8; 4] = b"norm";
pub(crate) const UNICODE_NAME_KEY: &[u8; 4] = b"luni";

/// Channel ids in the order they are written, with their RGBA component index.
pub(crate) const CHANNELS: [(i16, usize); 4] = [(0, 0), (1, 1), (2, 2), (-1, 3)];

const COLOR_MODE_RGB: u16 = 3;
const DEPTH: u16 = 8;

/// Big-endian byte sink with back-patched length fields.
struct PsdWriter {
    buf: Vec<u8>,
}

impl PsdWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn pad_to(&mut self, start: usize, multiple: usize) {
        while (self.buf.len() - start) % multiple != 0 {
            self.buf.push(0);
        }
    }

    /// Reserve a u32 length; returns the position to patch.
    fn begin_length(&mut self) -> usize {
        let at = self.buf.len();
        self.u32(0);
        at
    }

    /// Patch the length reserved at `at` with the number of bytes written since.
    fn end_length(&mut self, at: usize) -> Result<()> {
        let len = u32::try_from(self.buf.len() - at - 4)
            .map_err(|_| Error::CompositionError("section exceeds 4 GiB".into()))?;
        self.buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }
}

/// One encoded channel: compression marker plus payload.
struct EncodedChannel {
    id: i16,
    data: Vec<u8>,
}

struct EncodedLayer<'a> {
    layer: &'a RasterLayer,
    bounds: (u32, u32, u32, u32),
    channels: Vec<EncodedChannel>,
}

pub(crate) fn write(doc: &LayeredDocument, compression: Compression) -> Result<Vec<u8>> {
    let layer_count = i16::try_from(doc.layers().len())
        .map_err(|_| Error::CompositionError(format!("too many layers: {}", doc.layers().len())))?;

    let mut w = PsdWriter::new();

    w.bytes(SIGNATURE);
    w.u16(1);
    w.bytes(&[0; 6]);
    w.u16(CHANNELS.len() as u16);
    w.u32(doc.height());
    w.u32(doc.width());
    w.u16(DEPTH);
    w.u16(COLOR_MODE_RGB);

    // Colour mode data, image resources.
    w.u32(0);
    w.u32(0);

    let encoded: Vec<EncodedLayer<'_>> = doc
        .layers()
        .iter()
        .rev()
        .map(|layer| encode_layer(layer, compression))
        .collect();

    let section = w.begin_length();
    let info = w.begin_length();
    let info_start = w.buf.len();
    // A negative count marks the composite's fourth channel as transparency.
    w.i16(-layer_count);
    for layer in &encoded {
        write_record(&mut w, layer)?;
    }
    for layer in &encoded {
        for channel in &layer.channels {
            w.bytes(&channel.data);
        }
    }
    w.pad_to(info_start, 2);
    w.end_length(info)?;
    // Global layer mask info.
    w.u32(0);
    w.end_length(section)?;

    write_composite(&mut w, &doc.composite(), compression);
    Ok(w.buf)
}

fn encode_layer(layer: &RasterLayer, compression: Compression) -> EncodedLayer<'_> {
    let bounds = layer.opaque_bounds().unwrap_or((0, 0, 0, 0));
    let channels = CHANNELS
        .iter()
        .map(|&(id, component)| EncodedChannel {
            id,
            data: encode_plane(&layer.pixels, bounds, component, compression),
        })
        .collect();
    EncodedLayer {
        layer,
        bounds,
        channels,
    }
}

fn write_record(w: &mut PsdWriter, layer: &EncodedLayer<'_>) -> Result<()> {
    let (left, top, right, bottom) = layer.bounds;
    w.i32(top as i32);
    w.i32(left as i32);
    w.i32(bottom as i32);
    w.i32(right as i32);

    w.u16(layer.channels.len() as u16);
    for channel in &layer.channels {
        w.i16(channel.id);
        let len = u32::try_from(channel.data.len())
            .map_err(|_| Error::CompositionError("channel data exceeds 4 GiB".into()))?;
        w.u32(len);
    }

    w.bytes(RESOURCE_SIGNATURE);
    w.bytes(BLEND_NORMAL);
    w.u8(255); // opacity
    w.u8(0); // clipping: base
    w.u8(0); // flags: visible
    w.u8(0); // filler

    let extra = w.begin_length();
    w.u32(0); // layer mask data
    w.u32(0); // blending ranges

    let name_start = w.buf.len();
    let legacy = legacy_name(&layer.layer.name);
    w.u8(legacy.len() as u8);
    w.bytes(&legacy);
    w.pad_to(name_start, 4);

    let units: Vec<u16> = layer.layer.name.encode_utf16().collect();
    w.bytes(RESOURCE_SIGNATURE);
    w.bytes(UNICODE_NAME_KEY);
    w.u32(4 + 2 * units.len() as u32);
    w.u32(units.len() as u32);
    for unit in units {
        w.u16(unit);
    }

    w.end_length(extra)
}

/// Pascal-string name: printable ASCII only, at most 255 bytes.
fn legacy_name(name: &str) -> Vec<u8> {
    name.chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c as u8 } else { b'_' })
        .take(255)
        .collect()
}

fn plane_rows(
    pixels: &RgbaImage,
    (left, top, right, bottom): (u32, u32, u32, u32),
    component: usize,
) -> impl Iterator<Item = Vec<u8>> + '_ {
    (top..bottom).map(move |y| {
        (left..right)
            .map(|x| pixels.get_pixel(x, y)[component])
            .collect()
    })
}

fn encode_plane(
    pixels: &RgbaImage,
    bounds: (u32, u32, u32, u32),
    component: usize,
    compression: Compression,
) -> Vec<u8> {
    let (left, top, right, bottom) = bounds;
    let mut out = Vec::new();
    if right <= left || bottom <= top {
        out.extend_from_slice(&Compression::Raw.code().to_be_bytes());
        return out;
    }

    out.extend_from_slice(&compression.code().to_be_bytes());
    match compression {
        Compression::Raw => {
            for row in plane_rows(pixels, bounds, component) {
                out.extend_from_slice(&row);
            }
        }
        Compression::Rle => {
            let packed: Vec<Vec<u8>> = plane_rows(pixels, bounds, component)
                .map(|row| packbits::encode(&row))
                .collect();
            for row in &packed {
                out.extend_from_slice(&(row.len() as u16).to_be_bytes());
            }
            for row in packed {
                out.extend_from_slice(&row);
            }
        }
    }
    out
}

/// Merged image: one compression marker, then all four planes. RLE row counts
/// for every plane precede the packed data.
fn write_composite(w: &mut PsdWriter, composite: &RgbaImage, compression: Compression) {
    let bounds = (0, 0, composite.width(), composite.height());
    w.u16(compression.code());
    match compression {
        Compression::Raw => {
            for &(_, component) in &CHANNELS {
                for row in plane_rows(composite, bounds, component) {
                    w.bytes(&row);
                }
            }
        }
        Compression::Rle => {
            let packed: Vec<Vec<u8>> = CHANNELS
                .iter()
                .flat_map(|&(_, component)| plane_rows(composite, bounds, component))
                .map(|row| packbits::encode(&row))
                .collect();
            for row in &packed {
                w.u16(row.len() as u16);
            }
            for row in &packed {
                w.bytes(row);
            }
        }
    }
}
