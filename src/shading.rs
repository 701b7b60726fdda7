//! Relighting math shared by the WGSL evaluator and the CPU reference path.
//!
//! Everything here is a pure function of its inputs. The fragment shader in
//! `shaders/ptm_relight.wgsl` mirrors these formulas line for line.

use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use serde::{de::Error as DeError, Deserialize, Deserializer};

use crate::ptm::{PtmFile, COEFFICIENT_COUNT};

pub const DEFAULT_SPECULAR_EXPONENT: f32 = 32.0;
pub const DEFAULT_DIFFUSE_GAIN: f32 = 1.0;

/// Color written for unrecognized mode indices.
pub const UNKNOWN_MODE_COLOR: [f32; 4] = [1.0, 0.0, 1.0, 1.0];

const SPECULAR_DIFFUSE_WEIGHT: f32 = 0.8;
const SPECULAR_HIGHLIGHT_WEIGHT: f32 = 0.5;
const VIEW_DIRECTION: [f32; 3] = [0.0, 0.0, 1.0];

/// Light direction projected onto the unit disc. The third component is
/// implied: `sqrt(max(1 - u² - v², 0))`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LightDirection {
    pub u: f32,
    pub v: f32,
}

impl LightDirection {
    pub const OVERHEAD: Self = Self { u: 0.0, v: 0.0 };

    /// Scales `(u, v)` back onto the unit circle when it lies outside.
    pub fn clamped(u: f32, v: f32) -> Self {
        let light = Self { u, v };
        if light.is_within_disc() {
            return light;
        }
        // Rounding can leave the quotient a hair outside the disc.
        let mut scale = 1.0 / (u * u + v * v).sqrt();
        let mut clamped = Self {
            u: u * scale,
            v: v * scale,
        };
        while !clamped.is_within_disc() && scale > 0.0 {
            scale *= 1.0 - f32::EPSILON;
            clamped = Self {
                u: u * scale,
                v: v * scale,
            };
        }
        clamped
    }

    /// Maps a pointer inside a square light widget to a direction. Screen y
    /// grows downward while `v` grows upward.
    pub fn from_pointer(x: f32, y: f32, center: (f32, f32), radius: f32) -> Self {
        if radius <= 0.0 {
            return Self::OVERHEAD;
        }
        Self::clamped((x - center.0) / radius, -(y - center.1) / radius)
    }

    pub fn z(self) -> f32 {
        (1.0 - self.u * self.u - self.v * self.v).max(0.0).sqrt()
    }

    pub fn is_within_disc(self) -> bool {
        self.u * self.u + self.v * self.v <= 1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    #[default]
    Default,
    SpecularEnhancement,
    DiffuseGain,
    NormalMap,
    /// Any other index. Renders as solid magenta.
    Unrecognized(u32),
}

impl RenderMode {
    pub fn from_index(index: u32) -> Self {
        match index {
            0 => Self::Default,
            1 => Self::SpecularEnhancement,
            2 => Self::DiffuseGain,
            3 => Self::NormalMap,
            other => Self::Unrecognized(other),
        }
    }

    pub fn index(self) -> u32 {
        match self {
            Self::Default => 0,
            Self::SpecularEnhancement => 1,
            Self::DiffuseGain => 2,
            Self::NormalMap => 3,
            Self::Unrecognized(index) => index,
        }
    }
}

impl FromStr for RenderMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "default" => Ok(Self::Default),
            "specular" | "specular_enhancement" => Ok(Self::SpecularEnhancement),
            "diffuse" | "diffuse_gain" => Ok(Self::DiffuseGain),
            "normal" | "normals" | "normal_map" => Ok(Self::NormalMap),
            other => other.parse::<u32>().map(Self::from_index).map_err(|_| {
                anyhow!(
                    "unknown render mode '{value}' (expected default, specular, diffuse, normal_map or an index)"
                )
            }),
        }
    }
}

impl<'de> Deserialize<'de> for RenderMode {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawMode {
            Index(u32),
            Name(String),
        }

        match RawMode::deserialize(deserializer)? {
            RawMode::Index(index) => Ok(Self::from_index(index)),
            RawMode::Name(name) => name.parse().map_err(D::Error::custom),
        }
    }
}

/// Everything one draw needs besides the packed textures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameParams {
    pub light: LightDirection,
    pub mode: RenderMode,
    pub specular_exponent: f32,
    pub diffuse_gain: f32,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            light: LightDirection::OVERHEAD,
            mode: RenderMode::Default,
            specular_exponent: DEFAULT_SPECULAR_EXPONENT,
            diffuse_gain: DEFAULT_DIFFUSE_GAIN,
        }
    }
}

impl FrameParams {
    pub fn validate(&self) -> Result<()> {
        if !self.light.u.is_finite() || !self.light.v.is_finite() {
            bail!("light direction must be finite");
        }
        if !self.light.is_within_disc() {
            bail!(
                "light direction ({}, {}) lies outside the unit disc",
                self.light.u,
                self.light.v
            );
        }
        if !(self.specular_exponent.is_finite() && self.specular_exponent > 0.0) {
            bail!(
                "specular exponent must be > 0, got {}",
                self.specular_exponent
            );
        }
        if !(self.diffuse_gain.is_finite() && self.diffuse_gain > 0.0) {
            bail!("diffuse gain must be > 0, got {}", self.diffuse_gain);
        }
        Ok(())
    }
}

/// The six coefficient triples and base color sampled at one pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelSample {
    pub coefficients: [[f32; 3]; COEFFICIENT_COUNT],
    /// Base color in `[0, 1]`. White for per-channel files.
    pub base_color: [f32; 3],
    pub is_luminance: bool,
}

/// `a0·u² + a1·v² + a2·u·v + a3·u + a4·v + a5`, per channel.
pub fn evaluate_polynomial(coefficients: &[[f32; 3]; COEFFICIENT_COUNT], u: f32, v: f32) -> [f32; 3] {
    let [a0, a1, a2, a3, a4, a5] = coefficients;
    std::array::from_fn(|c| {
        a0[c] * u * u + a1[c] * v * v + a2[c] * u * v + a3[c] * u + a4[c] * v + a5[c]
    })
}

/// Surface normal from the partial derivatives of the first-channel
/// polynomial at `(u, v)`. Takes `a0..a4`; the constant term drops out.
pub fn reconstruct_normal(a: [f32; 5], u: f32, v: f32) -> [f32; 3] {
    let [a0, a1, a2, a3, a4] = a;
    let dl_du = 2.0 * a0 * u + a2 * v + a3;
    let dl_dv = 2.0 * a1 * v + a2 * u + a4;
    normalize([-dl_du, -dl_dv, 1.0])
}

/// Normal-map visualization: the reconstructed normal remapped from
/// `[-1, 1]` to `[0, 1]` per axis.
pub fn normal_map_color(a: [f32; 5], u: f32, v: f32) -> [f32; 3] {
    reconstruct_normal(a, u, v).map(|n| n * 0.5 + 0.5)
}

/// Polynomial response scaled to `[0, 1]`, tinted by the base color for
/// luminance files.
pub fn diffuse_color(sample: &PixelSample, u: f32, v: f32) -> [f32; 3] {
    let raw = evaluate_polynomial(&sample.coefficients, u, v);
    std::array::from_fn(|c| {
        let value = (raw[c] / 255.0).clamp(0.0, 1.0);
        if sample.is_luminance {
            value * sample.base_color[c]
        } else {
            value
        }
    })
}

pub fn specular_term(normal: [f32; 3], light: LightDirection, exponent: f32) -> f32 {
    let light_dir = normalize([light.u, light.v, light.z()]);
    let half = normalize([
        light_dir[0] + VIEW_DIRECTION[0],
        light_dir[1] + VIEW_DIRECTION[1],
        light_dir[2] + VIEW_DIRECTION[2],
    ]);
    dot(normal, half).max(0.0).powf(exponent)
}

/// Final RGBA for one pixel under `params`.
pub fn shade(sample: &PixelSample, params: &FrameParams) -> [f32; 4] {
    let LightDirection { u, v } = params.light;
    let rgb = match params.mode {
        RenderMode::Default => diffuse_color(sample, u, v),
        RenderMode::SpecularEnhancement => {
            let diffuse = diffuse_color(sample, u, v);
            let normal = reconstruct_normal(first_channel(sample), u, v);
            let spec = specular_term(normal, params.light, params.specular_exponent);
            diffuse.map(|c| {
                (c * SPECULAR_DIFFUSE_WEIGHT + spec * SPECULAR_HIGHLIGHT_WEIGHT).clamp(0.0, 1.0)
            })
        }
        RenderMode::DiffuseGain => {
            let gain = params.diffuse_gain;
            diffuse_color(sample, u * gain, v * gain)
        }
        RenderMode::NormalMap => normal_map_color(first_channel(sample), u, v),
        RenderMode::Unrecognized(_) => return UNKNOWN_MODE_COLOR,
    };
    [rgb[0], rgb[1], rgb[2], 1.0]
}

/// CPU rendering of `file` into a `width × height` RGBA8 buffer using
/// nearest sampling for both coefficients and color.
pub fn render_reference(
    file: &PtmFile,
    params: &FrameParams,
    width: u32,
    height: u32,
) -> Result<Vec<u8>> {
    if width == 0 || height == 0 {
        bail!("output size must be positive, got {}x{}", width, height);
    }
    params.validate()?;

    let source_width = file.width() as usize;
    let source_height = file.height() as usize;
    let mut rgba = Vec::with_capacity(width as usize * height as usize * 4);

    for y in 0..height as usize {
        let src_y = nearest_texel(y, height as usize, source_height);
        for x in 0..width as usize {
            let src_x = nearest_texel(x, width as usize, source_width);
            let sample = sample_pixel(file, src_y * source_width + src_x);
            let color = shade(&sample, params);
            rgba.extend(color.map(unorm_to_u8));
        }
    }

    Ok(rgba)
}

pub fn sample_pixel(file: &PtmFile, pixel: usize) -> PixelSample {
    let coefficients = std::array::from_fn(|index| file.coefficient_rgb(index, pixel));
    let (base_color, is_luminance) = match file.base_color() {
        Some(color) => (
            std::array::from_fn(|c| f32::from(color[pixel * 3 + c]) / 255.0),
            true,
        ),
        None => ([1.0; 3], false),
    };
    PixelSample {
        coefficients,
        base_color,
        is_luminance,
    }
}

pub fn unorm_to_u8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

fn nearest_texel(target: usize, target_len: usize, source_len: usize) -> usize {
    let center = (target as f64 + 0.5) / target_len as f64;
    ((center * source_len as f64) as usize).min(source_len - 1)
}

fn first_channel(sample: &PixelSample) -> [f32; 5] {
    std::array::from_fn(|index| sample.coefficients[index][0])
}

fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn normalize(v: [f32; 3]) -> [f32; 3] {
    let length = dot(v, v).sqrt();
    if length == 0.0 {
        return v;
    }
    v.map(|c| c / length)
}
