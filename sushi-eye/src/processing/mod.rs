//! Per-cycle processing: sampling, decoding, rendering

pub mod decoder;
pub mod renderer;
pub mod sampler;
pub mod surface;

pub use decoder::{Detection, DetectionDecoder, OutputLayout};
pub use renderer::{format_label, OverlayStyle, Renderer};
pub use sampler::{FrameSampler, TensorEncoding};
pub use surface::{DrawingSurface, FrameBuffer, FrameDimensions, PixelBox, TextAnnotation};
