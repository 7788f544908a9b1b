//! Frame sampling into model input tensors

use super::surface::{DrawingSurface, FrameBuffer};
use crate::error::VisionError;
use crate::tensor::{Tensor, TensorArena};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Element type of the model input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TensorEncoding {
    /// Raw 0..=255 channel values
    #[default]
    Uint8,
    /// Channel values scaled to 0.0..=1.0
    Float32,
}

/// Turns the current video frame into a `[1, height, width, 3]` tensor.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameSampler {
    encoding: TensorEncoding,
}

impl FrameSampler {
    pub fn new(encoding: TensorEncoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> TensorEncoding {
        self.encoding
    }

    /// Copy `frame` into the buffer and encode the buffer's pixels.
    ///
    /// Encoding happens before anything else touches the buffer, so the
    /// tensor never contains overlay pixels.
    pub fn sample(
        &self,
        frame: &RgbImage,
        buffer: &mut FrameBuffer,
        arena: &TensorArena,
    ) -> Result<Tensor, VisionError> {
        buffer.draw_frame(frame);
        self.encode(buffer.image(), arena)
    }

    pub fn encode(&self, image: &RgbImage, arena: &TensorArena) -> Result<Tensor, VisionError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(VisionError::Inference("cannot sample an empty frame".to_string()));
        }
        let shape = [1, height as usize, width as usize, 3];
        match self.encoding {
            TensorEncoding::Uint8 => arena.tensor_u8(&shape, image.as_raw().clone()),
            TensorEncoding::Float32 => {
                let data = image.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
                arena.tensor_f32(&shape, data)
            }
        }
    }
}
