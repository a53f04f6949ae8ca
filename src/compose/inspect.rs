//! Reading layered documents back
//!
//! Decodes the subset of PSD written by this crate (8-bit RGB, raw or PackBits
//! channels) and tolerates extra sections written by other tools.

use super::psd::{CHANNELS, RESOURCE_SIGNATURE, SIGNATURE, UNICODE_NAME_KEY};
use super::{packbits, Compression};
use crate::document::MAX_CANVAS_EDGE;
use crate::{Error, Result};
use image::{Rgba, RgbaImage};
use serde::Serialize;

/// One decoded layer.
#[derive(Debug, Clone, Serialize)]
pub struct PsdLayer {
    pub name: String,
    pub top: i32,
    pub left: i32,
    pub bottom: i32,
    pub right: i32,
    pub opacity: u8,
    pub blend_mode: String,
    pub visible: bool,
    /// Pixels inside the layer bounds
    #[serde(skip)]
    pub pixels: RgbaImage,
}

/// A decoded layered document.
#[derive(Debug, Clone, Serialize)]
pub struct PsdDocument {
    pub width: u32,
    pub height: u32,
    pub channels: u16,
    pub depth: u16,
    pub color_mode: u16,
    /// Layers, top-most first
    pub layers: Vec<PsdLayer>,
    #[serde(skip)]
    pub composite: Option<RgbaImage>,
}

impl PsdDocument {
    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name.as_str()).collect()
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.data.len()).ok_or_else(|| {
            Error::DecodeError(format!("unexpected end of data at offset {} (wanted {} bytes)", self.pos, n))
        })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    /// Length-prefixed block as its own cursor.
    fn block(&mut self) -> Result<Cursor<'a>> {
        let len = self.u32()? as usize;
        Ok(Cursor::new(self.bytes(len)?))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Channel limit of the version 1 format.
const MAX_CHANNELS: u16 = 56;

/// Upper bound on the bytes PackBits can expand one input byte into.
const PACKBITS_EXPANSION: usize = 128;

struct Record {
    name: String,
    top: i32,
    left: i32,
    bottom: i32,
    right: i32,
    channels: Vec<(i16, usize)>,
    opacity: u8,
    blend_mode: String,
    flags: u8,
}

/// Decode a layered document.
pub fn read_layered_document(data: &[u8]) -> Result<PsdDocument> {
    let mut c = Cursor::new(data);
    if &c.array::<4>()? != SIGNATURE {
        return Err(Error::DecodeError("missing 8BPS signature".into()));
    }
    let version = c.u16()?;
    if version != 1 {
        return Err(Error::DecodeError(format!("unsupported version {}", version)));
    }
    c.skip(6)?;
    let channels = c.u16()?;
    let height = c.u32()?;
    let width = c.u32()?;
    let depth = c.u16()?;
    let color_mode = c.u16()?;
    if depth != 8 {
        return Err(Error::DecodeError(format!("unsupported depth {}", depth)));
    }
    if width > MAX_CANVAS_EDGE || height > MAX_CANVAS_EDGE {
        return Err(Error::DecodeError(format!("canvas {}x{} exceeds {}px", width, height, MAX_CANVAS_EDGE)));
    }
    if channels == 0 || channels > MAX_CHANNELS {
        return Err(Error::DecodeError(format!("{} channels (expected 1..={})", channels, MAX_CHANNELS)));
    }

    c.block()?; // colour mode data
    c.block()?; // image resources

    let mut section = c.block()?;
    let layers = if section.remaining() > 0 {
        read_layer_info(&mut section.block()?)?
    } else {
        Vec::new()
    };

    let composite = if c.remaining() >= 2 {
        Some(read_composite(&mut c, width, height, channels)?)
    } else {
        None
    };

    Ok(PsdDocument {
        width,
        height,
        channels,
        depth,
        color_mode,
        layers,
        composite,
    })
}

fn read_layer_info(c: &mut Cursor<'_>) -> Result<Vec<PsdLayer>> {
    if c.remaining() == 0 {
        return Ok(Vec::new());
    }
    let count = c.i16()?.unsigned_abs() as usize;
    let records = (0..count)
        .map(|_| read_record(c))
        .collect::<Result<Vec<_>>>()?;

    let mut layers = Vec::with_capacity(count);
    for record in records {
        let w = extent(record.left, record.right, &record.name)?;
        let h = extent(record.top, record.bottom, &record.name)?;

        let mut planes = Vec::with_capacity(CHANNELS.len());
        for &(id, len) in &record.channels {
            let data = c.bytes(len)?;
            let component = CHANNELS.iter().find(|(cid, _)| *cid == id).map(|&(_, comp)| comp);
            if let Some(component) = component {
                planes.push((component, decode_channel(data, w, h)?));
            }
        }
        if w > 0 && h > 0 && planes.is_empty() {
            return Err(Error::DecodeError(format!("layer '{}' has no colour channels", record.name)));
        }

        let mut pixels = RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 255]));
        for (component, plane) in planes {
            for (px, v) in pixels.pixels_mut().zip(plane) {
                px[component] = v;
            }
        }
        layers.push(PsdLayer {
            name: record.name,
            top: record.top,
            left: record.left,
            bottom: record.bottom,
            right: record.right,
            opacity: record.opacity,
            blend_mode: record.blend_mode,
            visible: record.flags & 0x02 == 0,
            pixels,
        });
    }
    layers.reverse();
    Ok(layers)
}

/// Width of `start..end`, or zero when the range is empty.
fn extent(start: i32, end: i32, layer: &str) -> Result<u32> {
    let len = (i64::from(end) - i64::from(start)).max(0);
    u32::try_from(len)
        .ok()
        .filter(|&len| len <= MAX_CANVAS_EDGE)
        .ok_or_else(|| Error::DecodeError(format!("layer '{}' spans {}px (at most {})", layer, len, MAX_CANVAS_EDGE)))
}

fn read_record(c: &mut Cursor<'_>) -> Result<Record> {
    let top = c.i32()?;
    let left = c.i32()?;
    let bottom = c.i32()?;
    let right = c.i32()?;
    let channel_count = c.u16()? as usize;
    let channels = (0..channel_count)
        .map(|_| -> Result<(i16, usize)> { Ok((c.i16()?, c.u32()? as usize)) })
        .collect::<Result<Vec<_>>>()?;

    if &c.array::<4>()? != RESOURCE_SIGNATURE {
        return Err(Error::DecodeError("layer record missing blend signature".into()));
    }
    let blend_mode = String::from_utf8_lossy(&c.array::<4>()?).into_owned();
    let opacity = c.u8()?;
    let _clipping = c.u8()?;
    let flags = c.u8()?;
    let _filler = c.u8()?;

    let mut extra = c.block()?;
    extra.block()?; // layer mask
    extra.block()?; // blending ranges
    let name_len = extra.u8()? as usize;
    let mut name = String::from_utf8_lossy(extra.bytes(name_len)?).into_owned();
    let padded = (1 + name_len + 3) / 4 * 4;
    extra.skip(padded - 1 - name_len)?;

    while extra.remaining() >= 12 {
        let signature = extra.array::<4>()?;
        if &signature != RESOURCE_SIGNATURE && &signature != b"8B64" {
            break;
        }
        let key = extra.array::<4>()?;
        let mut data = extra.block()?;
        if &key == UNICODE_NAME_KEY {
            let units = data.u32()? as usize;
            let utf16 = (0..units).map(|_| data.u16()).collect::<Result<Vec<_>>>()?;
            name = String::from_utf16_lossy(&utf16);
        }
    }

    Ok(Record {
        name,
        top,
        left,
        bottom,
        right,
        channels,
        opacity,
        blend_mode,
        flags,
    })
}

fn compression(code: u16) -> Result<Compression> {
    Compression::from_code(code)
        .ok_or_else(|| Error::DecodeError(format!("unsupported compression {}", code)))
}

fn decode_channel(data: &[u8], w: u32, h: u32) -> Result<Vec<u8>> {
    let mut c = Cursor::new(data);
    let method = compression(c.u16()?)?;
    if w == 0 || h == 0 {
        return Ok(Vec::new());
    }
    decode_planes(&mut c, method, w, h, 1)
}

fn read_composite(c: &mut Cursor<'_>, width: u32, height: u32, channels: u16) -> Result<RgbaImage> {
    let method = compression(c.u16()?)?;
    let planes = decode_planes(c, method, width, height, channels as usize)?;
    let plane_len = width as usize * height as usize;

    let mut image = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255]));
    for (&(_, component), plane) in CHANNELS.iter().zip(planes.chunks(plane_len.max(1))) {
        for (px, v) in image.pixels_mut().zip(plane) {
            px[component] = *v;
        }
    }
    Ok(image)
}

/// Decode `planes` consecutive planes of `w` × `h` bytes.
fn decode_planes(c: &mut Cursor<'_>, method: Compression, w: u32, h: u32, planes: usize) -> Result<Vec<u8>> {
    let overflow = || Error::DecodeError(format!("{} planes of {}x{} overflow", planes, w, h));
    let rows = (h as usize).checked_mul(planes).ok_or_else(overflow)?;
    let row_len = w as usize;
    let total = rows.checked_mul(row_len).ok_or_else(overflow)?;
    match method {
        Compression::Raw => Ok(c.bytes(total)?.to_vec()),
        Compression::Rle => {
            if rows.saturating_mul(2) > c.remaining() {
                return Err(Error::DecodeError(format!("truncated row table ({} rows)", rows)));
            }
            let counts = (0..rows)
                .map(|_| c.u16().map(usize::from))
                .collect::<Result<Vec<_>>>()?;
            let mut out = Vec::with_capacity(total.min(c.remaining().saturating_mul(PACKBITS_EXPANSION)));
            for count in counts {
                out.extend(packbits::decode(c.bytes(count)?, row_len)?);
            }
            Ok(out)
        }
    }
}
