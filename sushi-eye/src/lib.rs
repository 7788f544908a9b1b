//! sushi-eye: real-time sushi detection from a live camera
//!
//! A fixed-interval loop samples the active camera, runs an object-detection
//! model on the frame, decodes the model's positional outputs into labelled
//! boxes and draws them over the video.
//!
//! The platform edges are traits: cameras come from a [`camera::MediaDevices`]
//! implementation and inference from a [`models::InferenceModel`]. Synthetic
//! and scripted implementations are always available; OpenCV capture and
//! ONNX Runtime inference sit behind the `opencv` and `onnx` features.

pub mod camera;
pub mod config;
pub mod detector;
pub mod error;
pub mod labels;
pub mod models;
pub mod processing;
pub mod scheduler;
pub mod tensor;

pub use camera::{CameraManager, CameraSelector, FacingMode, MediaDevices};
pub use config::{DetectorConfig, SurfaceConfig};
pub use detector::{DetectionFrame, DetectionSystem, DetectorState, SystemStats};
pub use error::VisionError;
pub use labels::{ClassIndexBase, LabelTable, SUSHI_LABELS};
pub use models::{InferenceModel, ModelSlot, ModelSource};
pub use processing::{Detection, DetectionDecoder, FrameBuffer, PixelBox, Renderer};
pub use scheduler::{Scheduler, SchedulerState};
pub use tensor::{RawOutputSet, Tensor, TensorArena};
