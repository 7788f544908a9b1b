//! Error types for sushi-eye

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Camera access error: {0}")]
    CameraAccess(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[cfg(feature = "onnx")]
    #[error("ONNX Runtime error: {0}")]
    Ort(String),

    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCv(String),
}

impl VisionError {
    /// True for failures that are contained at the cycle boundary.
    ///
    /// Everything else is either a startup failure or a camera/model
    /// lifecycle failure that is reported but handled outside the cycle.
    pub fn is_cycle_local(&self) -> bool {
        match self {
            VisionError::Inference(_) | VisionError::Decode(_) | VisionError::Render(_) => true,
            #[cfg(feature = "onnx")]
            VisionError::Ort(_) => true,
            _ => false,
        }
    }
}

#[cfg(feature = "opencv")]
impl From<opencv::Error> for VisionError {
    fn from(err: opencv::Error) -> Self {
        VisionError::OpenCv(err.message)
    }
}

#[cfg(feature = "onnx")]
impl From<ort::Error> for VisionError {
    fn from(err: ort::Error) -> Self {
        VisionError::Ort(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vision_error_display() {
        let err = VisionError::CameraAccess("permission denied".to_string());
        assert!(err.to_string().contains("Camera access error"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_vision_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let vision_err: VisionError = io_err.into();
        match vision_err {
            VisionError::Io(_) => {}
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_cycle_local_classification() {
        assert!(VisionError::Inference("x".to_string()).is_cycle_local());
        assert!(VisionError::Decode("x".to_string()).is_cycle_local());
        assert!(VisionError::Render("x".to_string()).is_cycle_local());
        assert!(!VisionError::ModelLoad("x".to_string()).is_cycle_local());
        assert!(!VisionError::CameraAccess("x".to_string()).is_cycle_local());
        assert!(!VisionError::Config("x".to_string()).is_cycle_local());
    }
}
