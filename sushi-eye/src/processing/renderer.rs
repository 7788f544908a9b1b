//! Overlay rendering

use super::decoder::Detection;
use super::surface::DrawingSurface;
use crate::error::VisionError;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Box and label styling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayStyle {
    pub color: [u8; 3],
    pub line_width: u32,
    pub font_size: f32,
    /// Distance of the label baseline above the box top
    pub text_offset: f32,
    /// Font for rasterized labels; labels are only recorded without one
    pub font_path: Option<PathBuf>,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            color: [255, 0, 0],
            line_width: 2,
            font_size: 16.0,
            text_offset: 10.0,
            font_path: None,
        }
    }
}

impl OverlayStyle {
    pub fn validate(&self) -> Result<(), VisionError> {
        if self.line_width == 0 || self.line_width > 32 {
            return Err(VisionError::Config(
                "Overlay line width must be between 1 and 32".to_string(),
            ));
        }
        if !self.font_size.is_finite() || self.font_size <= 0.0 {
            return Err(VisionError::Config(
                "Overlay font size must be positive".to_string(),
            ));
        }
        if !self.text_offset.is_finite() {
            return Err(VisionError::Config(
                "Overlay text offset must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// `"<label>, Score: <percent>%"` with the percentage to one decimal place.
pub fn format_label(label: &str, score: f32) -> String {
    format!("{}, Score: {:.1}%", label, score * 100.0)
}

/// Draws the latest frame and the current detections.
#[derive(Debug, Clone, Default)]
pub struct Renderer {
    style: OverlayStyle,
}

impl Renderer {
    pub fn new(style: OverlayStyle) -> Self {
        Self { style }
    }

    pub fn style(&self) -> &OverlayStyle {
        &self.style
    }

    /// Replace the surface contents with `video_frame`, then draw one box and
    /// one label per detection. Stale overlays never survive a call.
    pub fn render<S>(&self, surface: &mut S, video_frame: &RgbImage, detections: &[Detection])
    where
        S: DrawingSurface + ?Sized,
    {
        surface.draw_frame(video_frame);
        for det in detections {
            surface.stroke_rect(det.bbox, self.style.color, self.style.line_width);
            surface.fill_text(
                &format_label(&det.label, det.score),
                det.bbox.x,
                det.bbox.y - self.style.text_offset,
                self.style.color,
                self.style.font_size,
            );
        }
    }
}
