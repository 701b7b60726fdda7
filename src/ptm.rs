//! PTM 1.2 file decoding.
//!
//! A PTM file is five newline-terminated ASCII header lines followed by a
//! binary payload of quantized polynomial coefficients. Two payload layouts
//! exist:
//! - `PTM_FORMAT_LRGB`: one luminance polynomial per pixel plus a captured
//!   RGB color.
//! - `PTM_FORMAT_RGB`: one polynomial per color channel, no separate color.
//!
//! Scanlines are stored bottom-to-top. Decoded planes are always top-to-bottom
//! so pixel `y * width + x` has row 0 at the visual top.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

pub const PTM_VERSION: &str = "PTM_1.2";

/// Number of polynomial terms per pixel and channel.
pub const COEFFICIENT_COUNT: usize = 6;

const LUMINANCE_RGB_TOKEN: &str = "PTM_FORMAT_LRGB";
const PER_CHANNEL_RGB_TOKEN: &str = "PTM_FORMAT_RGB";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PtmFormat {
    LuminanceRgb,
    PerChannelRgb,
}

impl PtmFormat {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            LUMINANCE_RGB_TOKEN => Some(Self::LuminanceRgb),
            PER_CHANNEL_RGB_TOKEN => Some(Self::PerChannelRgb),
            _ => None,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Self::LuminanceRgb => LUMINANCE_RGB_TOKEN,
            Self::PerChannelRgb => PER_CHANNEL_RGB_TOKEN,
        }
    }

    /// Coefficient planes produced by the decoder for this format.
    pub fn plane_count(self) -> usize {
        match self {
            Self::LuminanceRgb => COEFFICIENT_COUNT,
            Self::PerChannelRgb => COEFFICIENT_COUNT * 3,
        }
    }
}

impl Display for PtmFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PtmHeader {
    pub version: String,
    pub format: PtmFormat,
    pub width: u32,
    pub height: u32,
    pub scale: [f32; COEFFICIENT_COUNT],
    pub bias: [i32; COEFFICIENT_COUNT],
}

impl PtmHeader {
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// `(raw - bias[c]) * scale[c]`
    #[inline(always)]
    pub fn dequantize(&self, coefficient: usize, raw: u8) -> f32 {
        (i64::from(raw) - i64::from(self.bias[coefficient])) as f32 * self.scale[coefficient]
    }
}

/// Decoded coefficient data, one variant per payload layout.
#[derive(Debug, Clone, PartialEq)]
pub enum PtmPayload {
    /// Six luminance planes plus `pixel_count * 3` bytes of RGB color.
    LuminanceRgb {
        coefficients: Vec<Vec<f32>>,
        color: Vec<u8>,
    },
    /// Eighteen planes indexed `coefficient * 3 + channel`.
    PerChannelRgb { coefficients: Vec<Vec<f32>> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PtmFile {
    pub header: PtmHeader,
    pub payload: PtmPayload,
}

impl PtmFile {
    pub fn width(&self) -> u32 {
        self.header.width
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn format(&self) -> PtmFormat {
        self.header.format
    }

    pub fn pixel_count(&self) -> usize {
        self.header.pixel_count()
    }

    pub fn coefficient_planes(&self) -> &[Vec<f32>] {
        match &self.payload {
            PtmPayload::LuminanceRgb { coefficients, .. } => coefficients,
            PtmPayload::PerChannelRgb { coefficients } => coefficients,
        }
    }

    /// Captured base color, present only for the luminance layout.
    pub fn base_color(&self) -> Option<&[u8]> {
        match &self.payload {
            PtmPayload::LuminanceRgb { color, .. } => Some(color),
            PtmPayload::PerChannelRgb { .. } => None,
        }
    }

    /// Coefficient `index` at pixel index `pixel` as an RGB triple. Luminance
    /// files replicate their single value across the three channels.
    #[inline]
    pub fn coefficient_rgb(&self, index: usize, pixel: usize) -> [f32; 3] {
        match &self.payload {
            PtmPayload::LuminanceRgb { coefficients, .. } => {
                let value = coefficients[index][pixel];
                [value, value, value]
            }
            PtmPayload::PerChannelRgb { coefficients } => [
                coefficients[index * 3][pixel],
                coefficients[index * 3 + 1][pixel],
                coefficients[index * 3 + 2][pixel],
            ],
        }
    }

    pub fn coefficient_at(&self, index: usize, x: u32, y: u32) -> [f32; 3] {
        let pixel = y as usize * self.header.width as usize + x as usize;
        self.coefficient_rgb(index, pixel)
    }
}

/// Header section whose bytes ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtmSection {
    Header,
    Coefficients,
    Color,
}

impl Display for PtmSection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Header => f.write_str("header"),
            Self::Coefficients => f.write_str("coefficient data"),
            Self::Color => f.write_str("color data"),
        }
    }
}

/// Decode failures. Nothing is returned when any of these occur.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    UnsupportedVersion(String),
    UnsupportedFormat(String),
    MalformedDimensions(String),
    MalformedScale { line: String },
    MalformedBias { line: String },
    UnexpectedEndOfData {
        section: PtmSection,
        expected: usize,
        available: usize,
    },
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported PTM version '{version}', expected '{PTM_VERSION}'")
            }
            Self::UnsupportedFormat(format) => write!(f, "unsupported PTM format '{format}'"),
            Self::MalformedDimensions(line) => write!(f, "malformed PTM dimensions '{line}'"),
            Self::MalformedScale { line } => write!(
                f,
                "expected {COEFFICIENT_COUNT} scale values, got '{line}'"
            ),
            Self::MalformedBias { line } => write!(
                f,
                "expected {COEFFICIENT_COUNT} integer bias values, got '{line}'"
            ),
            Self::UnexpectedEndOfData {
                section,
                expected,
                available,
            } => write!(
                f,
                "unexpected end of PTM {section}: needed {expected} bytes, {available} available"
            ),
        }
    }
}

impl Error for DecodeError {}

pub fn read_file(path: &Path) -> Result<PtmFile> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let file = decode(&bytes).with_context(|| format!("failed to decode {}", path.display()))?;
    log::info!(
        "decoded {} ({}x{}, {})",
        path.display(),
        file.width(),
        file.height(),
        file.format()
    );
    Ok(file)
}

pub fn decode(bytes: &[u8]) -> Result<PtmFile, DecodeError> {
    let mut cursor = ByteCursor::new(bytes);
    let header = read_header(&mut cursor)?;
    log::debug!(
        "PTM header: {} {}x{} scale={:?} bias={:?}",
        header.format,
        header.width,
        header.height,
        header.scale,
        header.bias
    );

    let payload = match header.format {
        PtmFormat::LuminanceRgb => read_luminance_rgb(&mut cursor, &header)?,
        PtmFormat::PerChannelRgb => read_per_channel_rgb(&mut cursor, &header)?,
    };

    Ok(PtmFile { header, payload })
}

fn read_header(cursor: &mut ByteCursor<'_>) -> Result<PtmHeader, DecodeError> {
    let version = cursor.read_line()?;
    if version != PTM_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let format_line = cursor.read_line()?;
    let format = PtmFormat::from_token(&format_line)
        .ok_or_else(|| DecodeError::UnsupportedFormat(format_line.clone()))?;

    // Width and height share one line in most files; some writers split them.
    let dimension_line = cursor.read_line()?;
    let tokens = dimension_line.split_whitespace().collect::<Vec<_>>();
    let (width, height) = match tokens.as_slice() {
        [] => return Err(DecodeError::MalformedDimensions(dimension_line)),
        [width] => {
            let width = parse_dimension(width, &dimension_line)?;
            let height_line = cursor.read_line()?;
            let height = parse_dimension(height_line.trim(), &height_line)?;
            (width, height)
        }
        [width, height, ..] => (
            parse_dimension(width, &dimension_line)?,
            parse_dimension(height, &dimension_line)?,
        ),
    };
    let payload_len = (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(format.plane_count() * 3));
    if payload_len.is_none() {
        return Err(DecodeError::MalformedDimensions(dimension_line));
    }

    let scale_line = cursor.read_line()?;
    let scale = parse_six::<f32>(&scale_line)
        .ok_or_else(|| DecodeError::MalformedScale { line: scale_line.clone() })?;

    let bias_line = cursor.read_line()?;
    let bias = parse_six::<i32>(&bias_line)
        .ok_or_else(|| DecodeError::MalformedBias { line: bias_line.clone() })?;

    Ok(PtmHeader {
        version,
        format,
        width,
        height,
        scale,
        bias,
    })
}

fn parse_dimension(token: &str, line: &str) -> Result<u32, DecodeError> {
    match token.parse::<u32>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(DecodeError::MalformedDimensions(line.to_owned())),
    }
}

/// First six whitespace-separated values of `line`. Extra tokens are ignored.
fn parse_six<T: std::str::FromStr + Copy + Default>(line: &str) -> Option<[T; COEFFICIENT_COUNT]> {
    let mut values = [T::default(); COEFFICIENT_COUNT];
    let mut tokens = line.split_whitespace();
    for value in &mut values {
        *value = tokens.next()?.parse().ok()?;
    }
    Some(values)
}

fn read_luminance_rgb(
    cursor: &mut ByteCursor<'_>,
    header: &PtmHeader,
) -> Result<PtmPayload, DecodeError> {
    let pixel_count = header.pixel_count();
    let raw_coefficients = cursor.take(pixel_count * COEFFICIENT_COUNT, PtmSection::Coefficients)?;
    let raw_color = cursor.take(pixel_count * 3, PtmSection::Color)?;

    let mut coefficients = vec![vec![0.0_f32; pixel_count]; COEFFICIENT_COUNT];
    let mut color = vec![0_u8; pixel_count * 3];

    for_each_flipped_pixel(header, |src, dst| {
        let raw = &raw_coefficients[src * COEFFICIENT_COUNT..(src + 1) * COEFFICIENT_COUNT];
        for (index, &value) in raw.iter().enumerate() {
            coefficients[index][dst] = header.dequantize(index, value);
        }
        color[dst * 3..dst * 3 + 3].copy_from_slice(&raw_color[src * 3..src * 3 + 3]);
    });

    Ok(PtmPayload::LuminanceRgb {
        coefficients,
        color,
    })
}

fn read_per_channel_rgb(
    cursor: &mut ByteCursor<'_>,
    header: &PtmHeader,
) -> Result<PtmPayload, DecodeError> {
    let pixel_count = header.pixel_count();
    let block_len = pixel_count * COEFFICIENT_COUNT;
    let raw = cursor.take(block_len * 3, PtmSection::Coefficients)?;

    let mut coefficients = vec![vec![0.0_f32; pixel_count]; COEFFICIENT_COUNT * 3];

    // Channel blocks are stored R, G, B; each block uses the luminance layout.
    for (channel, block) in raw.chunks_exact(block_len).enumerate() {
        for_each_flipped_pixel(header, |src, dst| {
            let pixel = &block[src * COEFFICIENT_COUNT..(src + 1) * COEFFICIENT_COUNT];
            for (index, &value) in pixel.iter().enumerate() {
                coefficients[index * 3 + channel][dst] = header.dequantize(index, value);
            }
        });
    }

    Ok(PtmPayload::PerChannelRgb { coefficients })
}

/// Calls `visit(source_index, destination_index)` for every pixel, mapping the
/// file's bottom-up row order onto top-down storage.
fn for_each_flipped_pixel(header: &PtmHeader, mut visit: impl FnMut(usize, usize)) {
    let width = header.width as usize;
    let height = header.height as usize;
    for src_y in 0..height {
        let dst_y = height - 1 - src_y;
        for x in 0..width {
            visit(src_y * width + x, dst_y * width + x);
        }
    }
}

struct ByteCursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    /// Reads through the next `\n`, dropping it and a trailing `\r`.
    fn read_line(&mut self) -> Result<String, DecodeError> {
        let rest = &self.bytes[self.position..];
        let Some(end) = rest.iter().position(|&byte| byte == b'\n') else {
            return Err(DecodeError::UnexpectedEndOfData {
                section: PtmSection::Header,
                expected: rest.len() + 1,
                available: rest.len(),
            });
        };
        self.position += end + 1;

        let line = rest[..end].strip_suffix(b"\r").unwrap_or(&rest[..end]);
        Ok(line.iter().map(|&byte| char::from(byte)).collect())
    }

    fn take(&mut self, len: usize, section: PtmSection) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEndOfData {
                section,
                expected: len,
                available: self.remaining(),
            });
        }
        let bytes = &self.bytes[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }
}
