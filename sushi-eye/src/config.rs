//! Configuration for sushi-eye

use crate::camera::{CameraSelector, FacingMode};
use crate::error::VisionError;
use crate::labels::{ClassIndexBase, LabelTable, SUSHI_LABELS};
use crate::processing::{OutputLayout, OverlayStyle, TensorEncoding};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "SUSHI_EYE_";

const MAX_WIDTH: u32 = 7680;
const MAX_HEIGHT: u32 = 4320;

/// Drawing surface dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SurfaceConfig {
    /// Fixed pixel size regardless of the camera.
    Fixed { width: u32, height: u32 },
    /// Fixed width; height follows the active stream's native aspect ratio.
    AspectLocked { width: u32 },
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        SurfaceConfig::Fixed {
            width: 640,
            height: 480,
        }
    }
}

impl SurfaceConfig {
    /// Resolve to concrete dimensions, given the stream's native size if known.
    pub fn resolve(&self, native: Option<(u32, u32)>) -> (u32, u32) {
        match *self {
            SurfaceConfig::Fixed { width, height } => (width, height),
            SurfaceConfig::AspectLocked { width } => match native {
                Some((nw, nh)) if nw > 0 && nh > 0 => {
                    let height = ((width as u64 * nh as u64) as f64 / nw as f64).round() as u32;
                    (width, height.clamp(1, MAX_HEIGHT))
                }
                // 4:3 until the stream reports its size
                _ => (width, (width * 3 / 4).max(1)),
            },
        }
    }
}

/// Detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Model path, or `stub://` for the scripted model
    pub model_source: String,
    /// Scheduler period in milliseconds
    pub interval_ms: u64,
    /// Minimum score (exclusive) for a slot to become a detection
    pub score_threshold: f32,
    /// Category names in training-time class order
    pub labels: Vec<String>,
    /// Class index convention of the model
    pub class_index_base: ClassIndexBase,
    /// Positions of the class/box/score tensors in the model output
    pub output_layout: OutputLayout,
    /// Drawing surface dimensions
    pub surface: SurfaceConfig,
    /// Initial camera selection
    pub camera: CameraSelector,
    /// Element type of the input tensor
    pub tensor_encoding: TensorEncoding,
    /// Box and label styling
    pub overlay: OverlayStyle,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_source: "models/sushi_ssd_mobilenet.onnx".to_string(),
            interval_ms: 100,
            score_threshold: 0.5,
            labels: SUSHI_LABELS.iter().map(|s| s.to_string()).collect(),
            class_index_base: ClassIndexBase::Zero,
            output_layout: OutputLayout::default(),
            surface: SurfaceConfig::default(),
            camera: CameraSelector::Default,
            tensor_encoding: TensorEncoding::Uint8,
            overlay: OverlayStyle::default(),
        }
    }
}

impl DetectorConfig {
    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, VisionError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| VisionError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, VisionError> {
        toml::from_str(content).map_err(|e| VisionError::Config(e.to_string()))
    }

    /// Apply `SUSHI_EYE_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), VisionError> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply overrides from `(name, value)` pairs; unknown names are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<(), VisionError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match name {
                "MODEL" => self.model_source = value.to_string(),
                "INTERVAL_MS" => {
                    self.interval_ms = value.parse().map_err(|_| {
                        VisionError::Config(format!("invalid {}INTERVAL_MS: {}", ENV_PREFIX, value))
                    })?
                }
                "SCORE_THRESHOLD" => {
                    self.score_threshold = value.parse().map_err(|_| {
                        VisionError::Config(format!(
                            "invalid {}SCORE_THRESHOLD: {}",
                            ENV_PREFIX, value
                        ))
                    })?
                }
                "DEVICE_ID" => {
                    self.camera = CameraSelector::DeviceId {
                        id: value.to_string(),
                    }
                }
                "FACING" => {
                    self.camera = CameraSelector::Facing {
                        mode: FacingMode::parse(value)?,
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn label_table(&self) -> Result<LabelTable, VisionError> {
        LabelTable::new(self.labels.clone(), self.class_index_base)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), VisionError> {
        if self.interval_ms == 0 || self.interval_ms > 10_000 {
            return Err(VisionError::Config(
                "Interval must be between 1 and 10000 ms".to_string(),
            ));
        }

        if !self.score_threshold.is_finite() || !(0.0..=1.0).contains(&self.score_threshold) {
            return Err(VisionError::Config(
                "Score threshold must be within [0, 1]".to_string(),
            ));
        }

        let (width, height) = match self.surface {
            SurfaceConfig::Fixed { width, height } => (width, height),
            SurfaceConfig::AspectLocked { width } => (width, 1),
        };
        if width == 0 || height == 0 {
            return Err(VisionError::Config("Surface size must be non-zero".to_string()));
        }
        if width > MAX_WIDTH || height > MAX_HEIGHT {
            return Err(VisionError::Config("Surface too large (max 8K)".to_string()));
        }

        self.label_table()?;
        self.output_layout.validate()?;
        self.overlay.validate()?;

        if self.model_source.trim().is_empty() {
            return Err(VisionError::Config("Model source must not be empty".to_string()));
        }

        Ok(())
    }
}
