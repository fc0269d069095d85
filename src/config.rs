use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::frame::PixelFormat;
use crate::pipeline::Mode;

const DEFAULT_SOURCE_URL: &str = "stub://camera";
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_TINT: [u8; 3] = [0, 160, 255];
const DEFAULT_TINT_STRENGTH: f32 = 0.5;
const DEFAULT_BLUR_RADIUS: u32 = 6;
/// Largest blur radius accepted from config; `Blur` clamps to it.
pub const MAX_BLUR_RADIUS: u32 = 64;
const DEFAULT_KEY_COLOR: [u8; 3] = [0, 255, 0];
const DEFAULT_KEY_TOLERANCE: u16 = 96;
const DEFAULT_DETECTION_BACKEND: &str = "stub";
const DEFAULT_MODEL_INPUT: u32 = 224;

#[derive(Debug, Deserialize, Default)]
struct SegdConfigFile {
    source: Option<SourceConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    color_mask: Option<ColorMaskConfigFile>,
    blur: Option<BlurConfigFile>,
    composite: Option<CompositeConfigFile>,
    detection: Option<DetectionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    pixel_format: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    initial_mode: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ColorMaskConfigFile {
    tint: Option<[u8; 3]>,
    strength: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct BlurConfigFile {
    radius: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CompositeConfigFile {
    reference_path: Option<PathBuf>,
    key_color: Option<[u8; 3]>,
    tolerance: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
}

/// Configuration for the `segd` preview daemon.
#[derive(Debug, Clone)]
pub struct SegdConfig {
    pub source: SourceSettings,
    pub initial_mode: Mode,
    pub strategies: StrategySettings,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_SOURCE_URL.to_string(),
            target_fps: DEFAULT_TARGET_FPS,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            pixel_format: PixelFormat::default(),
        }
    }
}

/// Per-strategy parameters handed to the strategy factory.
#[derive(Debug, Clone, Default)]
pub struct StrategySettings {
    pub color_mask: ColorMaskSettings,
    pub blur: BlurSettings,
    pub composite: CompositeSettings,
    pub detection: DetectionSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorMaskSettings {
    /// Target colour every pixel is pulled towards.
    pub tint: [u8; 3],
    /// Blend weight in `0.0..=1.0`; 0 leaves the frame unchanged.
    pub strength: f32,
}

impl Default for ColorMaskSettings {
    fn default() -> Self {
        Self {
            tint: DEFAULT_TINT,
            strength: DEFAULT_TINT_STRENGTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlurSettings {
    /// Box kernel radius in pixels.
    pub radius: u32,
}

impl Default for BlurSettings {
    fn default() -> Self {
        Self {
            radius: DEFAULT_BLUR_RADIUS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeSettings {
    /// Reference image loaded at startup, if any.
    pub reference_path: Option<PathBuf>,
    /// Key colour treated as background.
    pub key_color: [u8; 3],
    /// Maximum summed channel distance from the key colour.
    pub tolerance: u16,
}

impl Default for CompositeSettings {
    fn default() -> Self {
        Self {
            reference_path: None,
            key_color: DEFAULT_KEY_COLOR,
            tolerance: DEFAULT_KEY_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionSettings {
    /// Classifier backend name: `stub`, `cpu` or `tract`.
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTION_BACKEND.to_string(),
            model_path: None,
            labels_path: None,
            input_width: DEFAULT_MODEL_INPUT,
            input_height: DEFAULT_MODEL_INPUT,
        }
    }
}

impl SegdConfig {
    /// Load from the file named by `LIVESEG_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LIVESEG_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, but with an explicit config file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SegdConfigFile) -> Result<Self> {
        let defaults = SourceSettings::default();
        let source_file = file.source.unwrap_or_default();
        let pixel_format = match source_file.pixel_format.as_deref() {
            Some(value) => PixelFormat::parse(value)?,
            None => defaults.pixel_format,
        };
        let source = SourceSettings {
            url: source_file.url.unwrap_or(defaults.url),
            target_fps: source_file.target_fps.unwrap_or(defaults.target_fps),
            width: source_file.width.unwrap_or(defaults.width),
            height: source_file.height.unwrap_or(defaults.height),
            pixel_format,
        };

        let initial_mode = match file.pipeline.and_then(|p| p.initial_mode) {
            Some(value) => Mode::parse(&value)?,
            None => Mode::Bypass,
        };

        let color_mask = file.color_mask.unwrap_or_default();
        let blur = file.blur.unwrap_or_default();
        let composite = file.composite.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let strategies = StrategySettings {
            color_mask: ColorMaskSettings {
                tint: color_mask.tint.unwrap_or(DEFAULT_TINT),
                strength: color_mask.strength.unwrap_or(DEFAULT_TINT_STRENGTH),
            },
            blur: BlurSettings {
                radius: blur.radius.unwrap_or(DEFAULT_BLUR_RADIUS),
            },
            composite: CompositeSettings {
                reference_path: composite.reference_path,
                key_color: composite.key_color.unwrap_or(DEFAULT_KEY_COLOR),
                tolerance: composite.tolerance.unwrap_or(DEFAULT_KEY_TOLERANCE),
            },
            detection: DetectionSettings {
                backend: detection
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTION_BACKEND.to_string()),
                model_path: detection.model_path,
                labels_path: detection.labels_path,
                input_width: detection.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
                input_height: detection.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
            },
        };

        Ok(Self {
            source,
            initial_mode,
            strategies,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("LIVESEG_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Ok(fps) = std::env::var("LIVESEG_TARGET_FPS") {
            self.source.target_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("LIVESEG_TARGET_FPS must be an integer"))?;
        }
        if let Ok(mode) = std::env::var("LIVESEG_MODE") {
            if !mode.trim().is_empty() {
                self.initial_mode = Mode::parse(&mode)?;
            }
        }
        if let Ok(radius) = std::env::var("LIVESEG_BLUR_RADIUS") {
            self.strategies.blur.radius = radius
                .trim()
                .parse()
                .map_err(|_| anyhow!("LIVESEG_BLUR_RADIUS must be an integer number of pixels"))?;
        }
        if let Ok(backend) = std::env::var("LIVESEG_DETECTION_BACKEND") {
            if !backend.trim().is_empty() {
                self.strategies.detection.backend = backend.trim().to_string();
            }
        }
        if let Ok(path) = std::env::var("LIVESEG_REFERENCE_IMAGE") {
            if !path.trim().is_empty() {
                self.strategies.composite.reference_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.source.url.trim().is_empty() {
            return Err(anyhow!("source url must not be empty"));
        }
        if self.source.target_fps == 0 {
            return Err(anyhow!("target_fps must be greater than zero"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source width and height must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.strategies.color_mask.strength) {
            return Err(anyhow!("color_mask.strength must be within 0.0..=1.0"));
        }
        if self.strategies.blur.radius > MAX_BLUR_RADIUS {
            return Err(anyhow!(
                "blur.radius must be at most {} pixels",
                MAX_BLUR_RADIUS
            ));
        }
        if self.strategies.detection.input_width == 0 || self.strategies.detection.input_height == 0
        {
            return Err(anyhow!("detection input size must be greater than zero"));
        }
        self.strategies.detection.backend = self.strategies.detection.backend.to_lowercase();
        Ok(())
    }
}

impl Default for SegdConfig {
    fn default() -> Self {
        Self {
            source: SourceSettings::default(),
            initial_mode: Mode::Bypass,
            strategies: StrategySettings::default(),
        }
    }
}

fn read_config_file(path: &Path) -> Result<SegdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
