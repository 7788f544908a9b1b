//! Camera selection and stream lifecycle
//!
//! [`CameraManager`] owns the single active stream. Platform capture APIs are
//! reached through the [`MediaDevices`] trait; see [`synthetic`] for the
//! built-in test-pattern platform and `webcam` (feature `opencv`) for USB
//! webcams.

#[cfg(feature = "opencv")]
pub mod webcam;
pub mod selection;
pub mod synthetic;

pub use selection::{CameraRoleClassifier, LabelHeuristic};
pub use synthetic::{SyntheticCamera, SyntheticMediaDevices};

use crate::error::VisionError;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Physical camera role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacingMode {
    /// Front-facing ("selfie") camera
    User,
    /// Rear-facing camera
    Environment,
}

impl FacingMode {
    pub fn parse(value: &str) -> Result<Self, VisionError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" | "front" => Ok(FacingMode::User),
            "environment" | "back" | "rear" => Ok(FacingMode::Environment),
            other => Err(VisionError::Config(format!("unknown facing mode '{}'", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FacingMode::User => "user",
            FacingMode::Environment => "environment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    VideoInput,
    AudioInput,
    AudioOutput,
}

/// A media device as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDevice {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
}

impl CameraDevice {
    pub fn video(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: DeviceKind::VideoInput,
        }
    }
}

/// How the caller wants a camera picked.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CameraSelector {
    /// Platform default camera
    #[default]
    Default,
    /// Exact facing-mode constraint, resolved by the platform
    Facing { mode: FacingMode },
    /// Explicit device identifier
    DeviceId { id: String },
    /// Facing mode guessed from device labels
    LabelHeuristic { mode: FacingMode },
}

/// Constraint request issued to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamConstraints {
    pub device_id: Option<String>,
    pub facing_mode: Option<FacingMode>,
}

impl StreamConstraints {
    pub fn unconstrained() -> Self {
        Self::default()
    }

    pub fn is_unconstrained(&self) -> bool {
        self.device_id.is_none() && self.facing_mode.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub kind: DeviceKind,
    pub state: TrackState,
}

/// An opened platform stream. Each live track holds a hardware handle.
pub trait MediaStream: Send {
    fn id(&self) -> &str;

    /// Identifier of the device backing this stream.
    fn device_id(&self) -> &str;

    fn tracks(&self) -> Vec<TrackInfo>;

    /// Stop every track, releasing the underlying hardware.
    fn stop_all_tracks(&mut self);

    /// Native frame size reported by the device.
    fn native_size(&self) -> (u32, u32);

    /// Latest frame, or `None` if the stream has nothing to show yet.
    fn read_frame(&mut self) -> Result<Option<RgbImage>, VisionError>;

    fn is_active(&self) -> bool {
        self.tracks().iter().any(|t| t.state == TrackState::Live)
    }
}

/// Platform media-capture API.
#[cfg_attr(test, mockall::automock)]
pub trait MediaDevices: Send + Sync {
    fn enumerate_devices(&self) -> Result<Vec<CameraDevice>, VisionError>;

    fn get_user_media(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn MediaStream>, VisionError>;
}

/// The currently opened stream plus how it was chosen.
pub struct ActiveStream {
    stream: Box<dyn MediaStream>,
    selector: CameraSelector,
}

impl ActiveStream {
    pub fn stream_id(&self) -> &str {
        self.stream.id()
    }

    pub fn device_id(&self) -> &str {
        self.stream.device_id()
    }

    pub fn selector(&self) -> &CameraSelector {
        &self.selector
    }

    pub fn tracks(&self) -> Vec<TrackInfo> {
        self.stream.tracks()
    }

    pub fn native_size(&self) -> (u32, u32) {
        self.stream.native_size()
    }
}

/// Camera manager: device listing, selection, and the single active stream
pub struct CameraManager {
    platform: Arc<dyn MediaDevices>,
    classifier: Box<dyn CameraRoleClassifier>,
    active: Option<ActiveStream>,
}

impl CameraManager {
    /// Create a camera manager using the label heuristic for role detection
    pub fn new(platform: Arc<dyn MediaDevices>) -> Self {
        Self::with_classifier(platform, Box::new(LabelHeuristic::default()))
    }

    pub fn with_classifier(
        platform: Arc<dyn MediaDevices>,
        classifier: Box<dyn CameraRoleClassifier>,
    ) -> Self {
        Self {
            platform,
            classifier,
            active: None,
        }
    }

    /// Video input devices. Empty when the platform refuses enumeration.
    pub fn list_devices(&self) -> Vec<CameraDevice> {
        match self.platform.enumerate_devices() {
            Ok(devices) => devices
                .into_iter()
                .filter(|d| d.kind == DeviceKind::VideoInput)
                .collect(),
            Err(e) => {
                warn!("Device enumeration failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Open a stream for `selector`, stopping any current stream first.
    pub fn open(&mut self, selector: CameraSelector) -> Result<&ActiveStream, VisionError> {
        if self.active.is_some() {
            self.stop();
        }

        let constraints = self.resolve(&selector);
        let stream = self.acquire(&constraints)?;
        info!(
            "Camera stream {} opened on device {} ({:?})",
            stream.id(),
            stream.device_id(),
            selector
        );

        Ok(self.active.insert(ActiveStream { stream, selector }))
    }

    /// Replace the active stream. The old stream's tracks are all stopped
    /// before the new one is requested.
    pub fn switch(&mut self, selector: CameraSelector) -> Result<&ActiveStream, VisionError> {
        debug!("Switching camera to {:?}", selector);
        self.stop();
        self.open(selector)
    }

    /// Stop the active stream, if any. Returns the number of tracks stopped.
    pub fn stop(&mut self) -> usize {
        let Some(mut active) = self.active.take() else {
            return 0;
        };

        let live = active
            .stream
            .tracks()
            .iter()
            .filter(|t| t.state == TrackState::Live)
            .count();
        active.stream.stop_all_tracks();
        if active.stream.is_active() {
            warn!("Stream {} still reports live tracks after stop", active.stream.id());
        }
        info!("Camera stream {} stopped ({} tracks)", active.stream.id(), live);
        live
    }

    pub fn active(&self) -> Option<&ActiveStream> {
        self.active.as_ref()
    }

    /// True when a stream with at least one live track is open.
    pub fn is_ready(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.stream.is_active())
    }

    pub fn native_size(&self) -> Option<(u32, u32)> {
        self.active.as_ref().map(ActiveStream::native_size)
    }

    /// Latest frame from the active stream.
    pub fn read_frame(&mut self) -> Result<Option<RgbImage>, VisionError> {
        match self.active.as_mut() {
            Some(active) => active.stream.read_frame(),
            None => Ok(None),
        }
    }

    fn resolve(&self, selector: &CameraSelector) -> StreamConstraints {
        match selector {
            CameraSelector::Default => StreamConstraints::unconstrained(),
            CameraSelector::Facing { mode } => StreamConstraints {
                device_id: None,
                facing_mode: Some(*mode),
            },
            CameraSelector::DeviceId { id } => {
                let devices = self.list_devices();
                if devices.iter().any(|d| &d.id == id) {
                    StreamConstraints {
                        device_id: Some(id.clone()),
                        facing_mode: None,
                    }
                } else {
                    warn!("Device {} not found, using default camera", id);
                    StreamConstraints::unconstrained()
                }
            }
            CameraSelector::LabelHeuristic { mode } => {
                let devices = self.list_devices();
                match selection::pick(self.classifier.as_ref(), &devices, *mode) {
                    Some(device) => {
                        debug!("Label heuristic chose {} ({})", device.id, device.label);
                        StreamConstraints {
                            device_id: Some(device.id.clone()),
                            facing_mode: None,
                        }
                    }
                    None => {
                        warn!(
                            "No device label matches facing mode {}, using default camera",
                            mode.as_str()
                        );
                        StreamConstraints::unconstrained()
                    }
                }
            }
        }
    }

    fn acquire(&self, constraints: &StreamConstraints) -> Result<Box<dyn MediaStream>, VisionError> {
        match self.platform.get_user_media(constraints) {
            Ok(stream) => Ok(stream),
            Err(e) if !constraints.is_unconstrained() => {
                warn!("Constrained open failed ({}), falling back to default camera", e);
                self.platform
                    .get_user_media(&StreamConstraints::unconstrained())
                    .map_err(into_camera_error)
            }
            Err(e) => Err(into_camera_error(e)),
        }
    }
}

fn into_camera_error(err: VisionError) -> VisionError {
    match err {
        VisionError::CameraAccess(_) => err,
        other => VisionError::CameraAccess(other.to_string()),
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.stop();
    }
}
