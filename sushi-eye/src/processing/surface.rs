//! Drawing surfaces

use crate::error::VisionError;
use ab_glyph::{FontArc, PxScale};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;

const MAX_LINE_WIDTH: u32 = 32;
/// Text origins are kept within this many pixels of zero.
const TEXT_SPAN: f32 = 1_048_576.0;

/// Pixel size of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDimensions {
    pub width: u32,
    pub height: u32,
}

impl FrameDimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl From<(u32, u32)> for FrameDimensions {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Axis-aligned rectangle in surface pixels. Top-left origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A label drawn onto a surface.
#[derive(Debug, Clone, PartialEq)]
pub struct TextAnnotation {
    pub text: String,
    pub x: f32,
    /// Baseline, in surface pixels
    pub y: f32,
}

/// What the renderer draws on.
pub trait DrawingSurface {
    fn dimensions(&self) -> FrameDimensions;

    /// Replace the contents with `frame`, scaled to the surface size.
    fn draw_frame(&mut self, frame: &RgbImage);

    fn stroke_rect(&mut self, rect: PixelBox, color: [u8; 3], line_width: u32);

    fn fill_text(&mut self, text: &str, x: f32, y: f32, color: [u8; 3], size: f32);
}

/// In-memory RGB surface.
///
/// Text is always recorded as a [`TextAnnotation`]; glyphs are rasterized
/// only when a font has been attached.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    image: RgbImage,
    font: Option<FontArc>,
    annotations: Vec<TextAnnotation>,
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32) -> Result<Self, VisionError> {
        if width == 0 || height == 0 {
            return Err(VisionError::Config(format!(
                "frame buffer must be non-empty, got {}x{}",
                width, height
            )));
        }
        Ok(Self {
            image: RgbImage::new(width, height),
            font: None,
            annotations: Vec::new(),
        })
    }

    pub fn set_font(&mut self, font: Option<FontArc>) {
        self.font = font;
    }

    /// Load a TrueType/OpenType font from disk.
    pub fn load_font(path: impl AsRef<Path>) -> Result<FontArc, VisionError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        FontArc::try_from_vec(bytes)
            .map_err(|e| VisionError::Render(format!("{}: {}", path.display(), e)))
    }

    /// Reallocate at a new size. Contents are cleared.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), VisionError> {
        if width == 0 || height == 0 {
            return Err(VisionError::Config(format!(
                "frame buffer must be non-empty, got {}x{}",
                width, height
            )));
        }
        if self.image.dimensions() != (width, height) {
            self.image = RgbImage::new(width, height);
        }
        self.annotations.clear();
        Ok(())
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn annotations(&self) -> &[TextAnnotation] {
        &self.annotations
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<(), VisionError> {
        self.image
            .save_with_format(path, image::ImageFormat::Png)
            .map_err(VisionError::from)
    }
}

impl DrawingSurface for FrameBuffer {
    fn dimensions(&self) -> FrameDimensions {
        self.image.dimensions().into()
    }

    fn draw_frame(&mut self, frame: &RgbImage) {
        let (width, height) = self.image.dimensions();
        if frame.dimensions() == (width, height) {
            self.image.clone_from(frame);
        } else {
            self.image = imageops::resize(frame, width, height, FilterType::Triangle);
        }
        self.annotations.clear();
    }

    fn stroke_rect(&mut self, rect: PixelBox, color: [u8; 3], line_width: u32) {
        if !(rect.x.is_finite() && rect.y.is_finite())
            || !(rect.width.is_finite() && rect.height.is_finite())
        {
            return;
        }
        let x = rect.x.round() as i32;
        let y = rect.y.round() as i32;
        let w = rect.width.round().max(1.0) as i32;
        let h = rect.height.round().max(1.0) as i32;

        // centre the stroke on the box edge
        let line_width = line_width.max(1) as i32;
        let start = -(line_width / 2);
        for offset in start..start + line_width {
            let ow = (w - 2 * offset).max(1) as u32;
            let oh = (h - 2 * offset).max(1) as u32;
            let r = Rect::at(x + offset, y + offset).of_size(ow, oh);
            draw_hollow_rect_mut(&mut self.image, r, Rgb(color));
        }
    }

    fn fill_text(&mut self, text: &str, x: f32, y: f32, color: [u8; 3], size: f32) {
        self.annotations.push(TextAnnotation {
            text: text.to_string(),
            x,
            y,
        });
        if let Some(font) = &self.font {
            let x = x.round().clamp(-TEXT_SPAN, TEXT_SPAN) as i32;
            let top = (y - size).round().clamp(-TEXT_SPAN, TEXT_SPAN) as i32;
            draw_text_mut(
                &mut self.image,
                Rgb(color),
                x,
                top,
                PxScale::from(size),
                font,
                text,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_buffer_rejects_empty() {
        assert!(FrameBuffer::new(0, 480).is_err());
        assert!(FrameBuffer::new(640, 0).is_err());
    }

    #[test]
    fn test_draw_frame_scales_to_surface() {
        let mut buffer = FrameBuffer::new(64, 48).unwrap();
        let frame = RgbImage::from_pixel(128, 96, Rgb([10, 20, 30]));
        buffer.draw_frame(&frame);
        assert_eq!(buffer.image().dimensions(), (64, 48));
        assert_eq!(buffer.image().get_pixel(10, 10), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_stroke_rect_draws_edges_only() {
        let mut buffer = FrameBuffer::new(100, 100).unwrap();
        let rect = PixelBox {
            x: 20.0,
            y: 20.0,
            width: 40.0,
            height: 40.0,
        };
        buffer.stroke_rect(rect, [255, 0, 0], 2);
        assert_eq!(buffer.image().get_pixel(20, 40), &Rgb([255, 0, 0]));
        assert_eq!(buffer.image().get_pixel(19, 40), &Rgb([255, 0, 0]));
        assert_eq!(buffer.image().get_pixel(40, 40), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_stroke_rect_clips_out_of_bounds() {
        let mut buffer = FrameBuffer::new(50, 50).unwrap();
        let rect = PixelBox {
            x: -10.0,
            y: 40.0,
            width: 100.0,
            height: 100.0,
        };
        buffer.stroke_rect(rect, [0, 255, 0], 2);
        assert_eq!(buffer.image().get_pixel(25, 40), &Rgb([0, 255, 0]));
    }

    #[test]
    fn test_stroke_rect_survives_huge_boxes() {
        let mut buffer = FrameBuffer::new(640, 480).unwrap();
        let red = [255, 0, 0];
        buffer.stroke_rect(
            PixelBox {
                x: 0.0,
                y: 0.0,
                width: 1e12,
                height: 10.0,
            },
            red,
            2,
        );
        // top edge runs across the whole image, the right edge is off it
        assert_eq!(buffer.image().get_pixel(639, 0), &Rgb(red));
        assert_eq!(buffer.image().get_pixel(320, 10), &Rgb(red));
        assert_eq!(buffer.image().get_pixel(320, 5), &Rgb([0, 0, 0]));

        for rect in [
            PixelBox { x: -1e12, y: -1e12, width: 2e12, height: 2e12 },
            PixelBox { x: 1e30, y: 1e30, width: 1e30, height: 1e30 },
            PixelBox { x: f32::MAX, y: 0.0, width: f32::MAX, height: 1.0 },
            PixelBox { x: 10.0, y: 10.0, width: -1e12, height: -1e12 },
        ] {
            buffer.stroke_rect(rect, red, u32::MAX);
        }
        buffer.fill_text("ebi", -1e20, 1e20, red, 16.0);
        assert_eq!(buffer.annotations().len(), 1);
    }

    #[test]
    fn test_text_recorded_without_font() {
        let mut buffer = FrameBuffer::new(64, 64).unwrap();
        buffer.fill_text("uni", 4.0, 20.0, [255, 0, 0], 16.0);
        assert!(!buffer.has_font());
        assert_eq!(buffer.annotations().len(), 1);
        assert_eq!(buffer.annotations()[0].text, "uni");
        // nothing rasterized
        assert!(buffer.image().pixels().all(|p| p == &Rgb([0, 0, 0])));

        buffer.draw_frame(&RgbImage::new(64, 64));
        assert!(buffer.annotations().is_empty());
    }

    #[test]
    fn test_save_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let buffer = FrameBuffer::new(8, 8).unwrap();
        buffer.save_png(&path).unwrap();
        let loaded = image::open(&path).unwrap();
        assert_eq!(loaded.width(), 8);
    }
}
