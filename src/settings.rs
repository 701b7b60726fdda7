use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::shading::{
    FrameParams, LightDirection, RenderMode, DEFAULT_DIFFUSE_GAIN, DEFAULT_SPECULAR_EXPONENT,
};

/// Render preset read from YAML. Command-line flags override its values.
///
/// ```yaml
/// light: { u: 0.4, v: 0.3 }
/// mode: specular
/// specular_exponent: 48
/// output: { width: 1024, height: 768 }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderSettings {
    #[serde(default)]
    pub light: LightSetting,
    #[serde(default)]
    pub mode: RenderMode,
    #[serde(default = "default_specular_exponent")]
    pub specular_exponent: f32,
    #[serde(default = "default_diffuse_gain")]
    pub diffuse_gain: f32,
    #[serde(default)]
    pub output: Option<OutputSize>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            light: LightSetting::default(),
            mode: RenderMode::Default,
            specular_exponent: DEFAULT_SPECULAR_EXPONENT,
            diffuse_gain: DEFAULT_DIFFUSE_GAIN,
            output: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LightSetting {
    #[serde(default)]
    pub u: f32,
    #[serde(default)]
    pub v: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSize {
    pub width: u32,
    pub height: u32,
}

fn default_specular_exponent() -> f32 {
    DEFAULT_SPECULAR_EXPONENT
}

fn default_diffuse_gain() -> f32 {
    DEFAULT_DIFFUSE_GAIN
}

impl RenderSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.light.u.is_finite() || !self.light.v.is_finite() {
            bail!("light.u and light.v must be finite");
        }
        if !(self.specular_exponent.is_finite() && self.specular_exponent > 0.0) {
            bail!(
                "specular_exponent must be > 0, got {}",
                self.specular_exponent
            );
        }
        if !(self.diffuse_gain.is_finite() && self.diffuse_gain > 0.0) {
            bail!("diffuse_gain must be > 0, got {}", self.diffuse_gain);
        }
        if let Some(output) = self.output {
            if output.width == 0 || output.height == 0 {
                bail!(
                    "output size must be positive, got {}x{}",
                    output.width,
                    output.height
                );
            }
        }
        Ok(())
    }

    /// Per-frame parameters with the light pulled onto the unit disc.
    pub fn frame_params(&self) -> FrameParams {
        FrameParams {
            light: LightDirection::clamped(self.light.u, self.light.v),
            mode: self.mode,
            specular_exponent: self.specular_exponent,
            diffuse_gain: self.diffuse_gain,
        }
    }
}

pub fn load_settings(path: &Path) -> Result<RenderSettings> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings {}", path.display()))?;
    let settings = parse_settings(&contents)
        .with_context(|| format!("invalid settings in {}", path.display()))?;
    Ok(settings)
}

pub fn parse_settings(contents: &str) -> Result<RenderSettings> {
    let settings: RenderSettings = serde_yaml::from_str(contents).map_err(|error| {
        let location = error
            .location()
            .map(|location| format!("line {}, column {}", location.line(), location.column()))
            .unwrap_or_else(|| "unknown location".to_owned());
        anyhow!("failed to parse yaml at {}: {}", location, error)
    })?;
    settings.validate()?;
    Ok(settings)
}
