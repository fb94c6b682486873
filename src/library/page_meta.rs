//! Page dimensions and page entry sanitizing
//!
//! Dimensions are read straight from image headers (PNG, JPEG, WEBP, GIF) in the
//! first bytes of the plaintext, so no decoder is needed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Largest width or height accepted for a page
pub const MAX_DIMENSION_PX: u32 = 100_000;

/// Page metadata schema version written into index records
pub const PAGE_META_VERSION: u32 = 2;

/// Width and height in pixels
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDimensions {
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
}

/// One page in an index record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PageEntry {
    /// File name inside the item directory (e.g., `001.jpg.enc`)
    pub file: String,
    /// Width in pixels
    pub w: Option<u32>,
    /// Height in pixels
    pub h: Option<u32>,
    /// Plaintext size
    pub bytes: Option<u64>,
    /// Modification time of the source file, Unix milliseconds
    pub source_mtime_ms: Option<i64>,
    /// Size of the source file
    pub source_size: Option<u64>,
}

impl PageEntry {
    /// Entry with only a file name
    pub fn bare(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            w: None,
            h: None,
            bytes: None,
            source_mtime_ms: None,
            source_size: None,
        }
    }
}

/// Clamp a dimension to `1..=MAX_DIMENSION_PX`
pub fn safe_dimension(value: f64) -> Option<u32> {
    if !value.is_finite() {
        return None;
    }
    let value = value.floor();
    if value < 1.0 || value > MAX_DIMENSION_PX as f64 {
        return None;
    }
    Some(value as u32)
}

/// Read image dimensions from the head of a file
pub fn image_dimensions(buf: &[u8]) -> Option<ImageDimensions> {
    if buf.len() < 8 {
        return None;
    }
    let (width, height) = parse_png(buf)
        .or_else(|| parse_jpeg(buf))
        .or_else(|| parse_webp(buf))
        .or_else(|| parse_gif(buf))?;
    Some(ImageDimensions {
        width: safe_dimension(width as f64)?,
        height: safe_dimension(height as f64)?,
    })
}

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

fn be_u16(buf: &[u8], at: usize) -> u32 {
    u16::from_be_bytes([buf[at], buf[at + 1]]) as u32
}

fn le_u16(buf: &[u8], at: usize) -> u32 {
    u16::from_le_bytes([buf[at], buf[at + 1]]) as u32
}

fn le_u24(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], 0])
}

fn parse_png(buf: &[u8]) -> Option<(u32, u32)> {
    if buf.len() < 24 || buf[..8] != PNG_SIGNATURE {
        return None;
    }
    let width = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
    let height = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);
    Some((width, height))
}

fn parse_gif(buf: &[u8]) -> Option<(u32, u32)> {
    if buf.len() < 10 || !(buf.starts_with(b"GIF87a") || buf.starts_with(b"GIF89a")) {
        return None;
    }
    Some((le_u16(buf, 6), le_u16(buf, 8)))
}

fn is_sof(marker: u8) -> bool {
    matches!(marker, 0xc0..=0xc3 | 0xc5..=0xc7 | 0xc9..=0xcb | 0xcd..=0xcf)
}

fn parse_jpeg(buf: &[u8]) -> Option<(u32, u32)> {
    if buf.len() < 4 || buf[0] != 0xff || buf[1] != 0xd8 {
        return None;
    }
    let mut offset = 2;
    while offset + 8 < buf.len() {
        if buf[offset] != 0xff {
            offset += 1;
            continue;
        }
        while offset < buf.len() && buf[offset] == 0xff {
            offset += 1;
        }
        if offset >= buf.len() {
            break;
        }
        let marker = buf[offset];
        offset += 1;
        if marker == 0xd8 || marker == 0xd9 {
            continue;
        }
        if offset + 2 > buf.len() {
            break;
        }
        let segment_len = be_u16(buf, offset) as usize;
        offset += 2;
        if segment_len < 2 || offset + segment_len - 2 > buf.len() {
            break;
        }
        if is_sof(marker) && segment_len >= 7 {
            let height = be_u16(buf, offset + 1);
            let width = be_u16(buf, offset + 3);
            return Some((width, height));
        }
        offset += segment_len - 2;
    }
    None
}

fn parse_webp(buf: &[u8]) -> Option<(u32, u32)> {
    if buf.len() < 30 || &buf[..4] != b"RIFF" || &buf[8..12] != b"WEBP" {
        return None;
    }
    match &buf[12..16] {
        b"VP8X" => Some((1 + le_u24(buf, 24), 1 + le_u24(buf, 27))),
        b"VP8 " => Some((le_u16(buf, 26) & 0x3fff, le_u16(buf, 28) & 0x3fff)),
        b"VP8L" => {
            let bits = u32::from_le_bytes([buf[21], buf[22], buf[23], buf[24]]);
            Some(((bits & 0x3fff) + 1, ((bits >> 14) & 0x3fff) + 1))
        }
        _ => None,
    }
}

fn as_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

/// Normalize an externally supplied page entry
///
/// Numeric fields outside their valid range become `None`. Entries with an
/// empty file name are rejected.
pub fn sanitize_page_entry(entry: &Value) -> Option<PageEntry> {
    let file = entry.get("file")?.as_str()?.trim().to_string();
    if file.is_empty() {
        return None;
    }

    let positive = |key: &str| {
        as_number(entry.get(key))
            .filter(|n| *n > 0.0)
            .map(|n| n.floor() as u64)
    };
    let dimension = |key: &str| as_number(entry.get(key)).and_then(safe_dimension);

    Some(PageEntry {
        file,
        w: dimension("w"),
        h: dimension("h"),
        bytes: positive("bytes"),
        source_mtime_ms: as_number(entry.get("source_mtime_ms"))
            .filter(|n| *n >= 0.0)
            .map(|n| n.floor() as i64),
        source_size: positive("source_size"),
    })
}
