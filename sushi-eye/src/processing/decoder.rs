//! Detection decoding
//!
//! Reads the model's raw output set by position and turns every slot whose
//! score clears the threshold into a [`Detection`] in surface pixels.

use super::surface::{FrameDimensions, PixelBox};
use crate::error::VisionError;
use crate::labels::LabelTable;
use crate::tensor::{RawOutputSet, Tensor};
use serde::{Deserialize, Serialize};

/// Positions of the output tensors the decoder reads.
///
/// Outputs are identified by position, not by name. Other positions are
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputLayout {
    /// Per-slot class indices, shape `[1, N]`
    pub classes: usize,
    /// Per-slot boxes as normalized `[y1, x1, y2, x2]`, shape `[1, N, 4]`
    pub boxes: usize,
    /// Per-slot confidences, shape `[1, N]`
    pub scores: usize,
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self {
            classes: 0,
            boxes: 1,
            scores: 4,
        }
    }
}

impl OutputLayout {
    pub fn validate(&self) -> Result<(), VisionError> {
        if self.classes == self.boxes || self.classes == self.scores || self.boxes == self.scores {
            return Err(VisionError::Config(format!(
                "output layout positions must be distinct: {:?}",
                self
            )));
        }
        Ok(())
    }

    /// Number of outputs a model must produce for this layout.
    pub fn required_outputs(&self) -> usize {
        self.classes.max(self.boxes).max(self.scores) + 1
    }
}

/// One accepted detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Slot in the model output this came from
    pub slot: usize,
    /// Raw class index as emitted by the model
    pub class_id: usize,
    pub label: String,
    pub score: f32,
    pub bbox: PixelBox,
}

/// Converts raw model outputs into detections.
#[derive(Debug, Clone)]
pub struct DetectionDecoder {
    labels: LabelTable,
    layout: OutputLayout,
    threshold: f32,
}

impl DetectionDecoder {
    pub fn new(labels: LabelTable, layout: OutputLayout, threshold: f32) -> Self {
        Self {
            labels,
            layout,
            threshold,
        }
    }

    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Decode one cycle's outputs against a surface of `dims`.
    ///
    /// A slot is accepted only when its score is strictly greater than the
    /// threshold. Detections come back in ascending slot order. Boxes are not
    /// clamped to the surface.
    pub fn decode(
        &self,
        outputs: &RawOutputSet,
        dims: FrameDimensions,
    ) -> Result<Vec<Detection>, VisionError> {
        let scores = output(outputs, self.layout.scores, "scores")?;
        let classes = output(outputs, self.layout.classes, "classes")?;
        let boxes = output(outputs, self.layout.boxes, "boxes")?;

        let slots = scores.len();
        if classes.len() < slots {
            return Err(VisionError::Decode(format!(
                "classes tensor has {} entries for {} score slots",
                classes.len(),
                slots
            )));
        }
        if boxes.len() < slots.saturating_mul(4) {
            return Err(VisionError::Decode(format!(
                "boxes tensor has {} values for {} score slots",
                boxes.len(),
                slots
            )));
        }

        let width = dims.width as f32;
        let height = dims.height as f32;
        let mut detections = Vec::new();

        for slot in 0..slots {
            let score = scores.get_f32(slot).unwrap_or(f32::NAN);
            // NaN never passes
            if !(score > self.threshold) {
                continue;
            }

            let class_id = class_index(classes, slot)?;
            let label = self.labels.resolve(class_id).ok_or_else(|| {
                VisionError::Decode(format!(
                    "slot {}: class index {} outside label table ({} labels, {:?}-based)",
                    slot,
                    class_id,
                    self.labels.len(),
                    self.labels.base()
                ))
            })?;

            let [y1, x1, y2, x2] = box_coords(boxes, slot)?;
            detections.push(Detection {
                slot,
                class_id,
                label: label.to_string(),
                score,
                bbox: PixelBox {
                    x: x1 * width,
                    y: y1 * height,
                    width: (x2 - x1) * width,
                    height: (y2 - y1) * height,
                },
            });
        }

        Ok(detections)
    }
}

fn output<'a>(
    outputs: &'a RawOutputSet,
    position: usize,
    what: &str,
) -> Result<&'a Tensor, VisionError> {
    outputs.get(position).ok_or_else(|| {
        VisionError::Decode(format!(
            "model produced {} outputs, {} expected at position {}",
            outputs.len(),
            what,
            position
        ))
    })
}

fn class_index(classes: &Tensor, slot: usize) -> Result<usize, VisionError> {
    let raw = classes.get_f32(slot).unwrap_or(f32::NAN);
    if !raw.is_finite() || raw < 0.0 || raw.fract() != 0.0 {
        return Err(VisionError::Decode(format!(
            "slot {}: invalid class index {}",
            slot, raw
        )));
    }
    Ok(raw as usize)
}

fn box_coords(boxes: &Tensor, slot: usize) -> Result<[f32; 4], VisionError> {
    let mut coords = [0.0f32; 4];
    for (i, c) in coords.iter_mut().enumerate() {
        let v = boxes.get_f32(slot * 4 + i).unwrap_or(f32::NAN);
        if !v.is_finite() {
            return Err(VisionError::Decode(format!(
                "slot {}: non-finite box coordinate",
                slot
            )));
        }
        *c = v;
    }
    Ok(coords)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::ClassIndexBase;
    use crate::tensor::TensorArena;

    const VGA: FrameDimensions = FrameDimensions {
        width: 640,
        height: 480,
    };

    /// Outputs in the default layout with two unused filler positions.
    fn outputs(
        arena: &TensorArena,
        classes: Vec<f32>,
        boxes: Vec<f32>,
        scores: Vec<f32>,
    ) -> RawOutputSet {
        let n = scores.len();
        RawOutputSet::new(vec![
            arena.tensor_f32(&[1, classes.len()], classes).unwrap(),
            arena.tensor_f32(&[1, boxes.len() / 4, 4], boxes).unwrap(),
            arena.tensor_f32(&[1], vec![n as f32]).unwrap(),
            arena.tensor_f32(&[1], vec![0.0]).unwrap(),
            arena.tensor_f32(&[1, n], scores).unwrap(),
        ])
    }

    fn decoder() -> DetectionDecoder {
        DetectionDecoder::new(LabelTable::sushi(), OutputLayout::default(), 0.5)
    }

    #[test]
    fn test_box_converted_to_pixels() {
        let arena = TensorArena::new();
        let set = outputs(&arena, vec![2.0], vec![0.25, 0.1, 0.75, 0.6], vec![0.9]);
        let dets = decoder().decode(&set, VGA).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(
            dets[0].bbox,
            PixelBox {
                x: 64.0,
                y: 120.0,
                width: 320.0,
                height: 240.0
            }
        );
        assert_eq!(dets[0].label, "ika");
    }

    #[test]
    fn test_threshold_is_strict() {
        let arena = TensorArena::new();
        let set = outputs(&arena, vec![0.0], vec![0.0, 0.0, 1.0, 1.0], vec![0.5]);
        assert!(decoder().decode(&set, VGA).unwrap().is_empty());

        let set = outputs(&arena, vec![0.0], vec![0.0, 0.0, 1.0, 1.0], vec![0.500_001]);
        assert_eq!(decoder().decode(&set, VGA).unwrap().len(), 1);
    }

    #[test]
    fn test_slots_kept_in_order() {
        let arena = TensorArena::new();
        let set = outputs(
            &arena,
            vec![0.0, 1.0, 5.0],
            vec![0.0; 12],
            vec![0.9, 0.3, 0.6],
        );
        let dets = decoder().decode(&set, VGA).unwrap();
        assert_eq!(dets.iter().map(|d| d.slot).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(dets[0].label, "ikura");
        assert_eq!(dets[1].label, "ebi");
    }

    #[test]
    fn test_one_based_labels() {
        let arena = TensorArena::new();
        let labels = LabelTable::new(
            crate::labels::SUSHI_LABELS.iter().map(|s| s.to_string()).collect(),
            ClassIndexBase::One,
        )
        .unwrap();
        let decoder = DetectionDecoder::new(labels, OutputLayout::default(), 0.5);
        let set = outputs(&arena, vec![1.0, 6.0], vec![0.0; 8], vec![0.9, 0.9]);
        let dets = decoder.decode(&set, VGA).unwrap();
        assert_eq!(dets[0].label, "ikura");
        assert_eq!(dets[1].label, "ebi");

        let set = outputs(&arena, vec![0.0], vec![0.0; 4], vec![0.9]);
        assert!(matches!(
            decoder.decode(&set, VGA),
            Err(VisionError::Decode(_))
        ));
    }

    #[test]
    fn test_out_of_range_class_is_decode_error() {
        let arena = TensorArena::new();
        let set = outputs(&arena, vec![6.0], vec![0.0; 4], vec![0.9]);
        assert!(matches!(
            decoder().decode(&set, VGA),
            Err(VisionError::Decode(_))
        ));
    }

    #[test]
    fn test_rejected_slot_class_not_inspected() {
        let arena = TensorArena::new();
        let set = outputs(&arena, vec![99.0], vec![0.0; 4], vec![0.1]);
        assert!(decoder().decode(&set, VGA).unwrap().is_empty());
    }

    #[test]
    fn test_missing_output_is_decode_error() {
        let arena = TensorArena::new();
        let set = RawOutputSet::new(vec![
            arena.tensor_f32(&[1, 1], vec![0.0]).unwrap(),
            arena.tensor_f32(&[1, 1, 4], vec![0.0; 4]).unwrap(),
        ]);
        assert!(matches!(
            decoder().decode(&set, VGA),
            Err(VisionError::Decode(_))
        ));
    }

    #[test]
    fn test_short_boxes_is_decode_error() {
        let arena = TensorArena::new();
        let set = outputs(&arena, vec![0.0, 0.0], vec![0.0; 4], vec![0.9, 0.9]);
        assert!(decoder().decode(&set, VGA).is_err());
    }

    #[test]
    fn test_empty_outputs_decode_to_nothing() {
        let arena = TensorArena::new();
        let set = outputs(&arena, vec![], vec![], vec![]);
        assert!(decoder().decode(&set, VGA).unwrap().is_empty());
    }

    #[test]
    fn test_nan_score_rejected() {
        let arena = TensorArena::new();
        let set = outputs(&arena, vec![0.0], vec![0.0; 4], vec![f32::NAN]);
        assert!(decoder().decode(&set, VGA).unwrap().is_empty());
    }

    #[test]
    fn test_custom_layout() {
        let arena = TensorArena::new();
        let layout = OutputLayout {
            classes: 1,
            boxes: 2,
            scores: 0,
        };
        assert_eq!(layout.required_outputs(), 3);
        let set = RawOutputSet::new(vec![
            arena.tensor_f32(&[1, 1], vec![0.8]).unwrap(),
            arena.tensor_f32(&[1, 1], vec![3.0]).unwrap(),
            arena.tensor_f32(&[1, 1, 4], vec![0.0, 0.0, 0.5, 0.5]).unwrap(),
        ]);
        let dets = DetectionDecoder::new(LabelTable::sushi(), layout, 0.5)
            .decode(&set, VGA)
            .unwrap();
        assert_eq!(dets[0].label, "uni");
        assert_eq!(dets[0].bbox.width, 320.0);
    }

    #[test]
    fn test_layout_requires_distinct_positions() {
        let layout = OutputLayout {
            classes: 0,
            boxes: 0,
            scores: 4,
        };
        assert!(layout.validate().is_err());
        assert!(OutputLayout::default().validate().is_ok());
    }
}
