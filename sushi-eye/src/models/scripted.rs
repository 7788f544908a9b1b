//! Scripted model
//!
//! Plays back a fixed list of responses, one per call, wrapping around. Used
//! for `stub://` sources and anywhere a deterministic model is needed.

use super::InferenceModel;
use crate::error::VisionError;
use crate::processing::OutputLayout;
use crate::tensor::{RawOutputSet, Tensor, TensorArena};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One output slot: raw class index, score and normalized `[y1, x1, y2, x2]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotSpec {
    pub class_index: f32,
    pub score: f32,
    pub bbox: [f32; 4],
}

impl SlotSpec {
    pub fn new(class_index: usize, score: f32, bbox: [f32; 4]) -> Self {
        Self {
            class_index: class_index as f32,
            score,
            bbox,
        }
    }
}

/// What a single call returns.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedResponse {
    Slots(Vec<SlotSpec>),
    /// Fail the call with an inference error
    Fail(String),
}

#[derive(Debug, Default)]
struct CallStats {
    calls: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a CallStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a CallStats) -> Self {
        stats.calls.fetch_add(1, Ordering::AcqRel);
        let now = stats.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::AcqRel);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Deterministic [`InferenceModel`].
pub struct ScriptedModel {
    name: String,
    script: Vec<ScriptedResponse>,
    layout: OutputLayout,
    delay: Duration,
    cursor: AtomicUsize,
    stats: Arc<CallStats>,
    last_input_shape: Mutex<Option<Vec<usize>>>,
}

impl ScriptedModel {
    pub fn new(name: impl Into<String>, script: Vec<ScriptedResponse>) -> Self {
        Self {
            name: name.into(),
            script,
            layout: OutputLayout::default(),
            delay: Duration::ZERO,
            cursor: AtomicUsize::new(0),
            stats: Arc::new(CallStats::default()),
            last_input_shape: Mutex::new(None),
        }
    }

    /// Every call returns `slots`.
    pub fn constant(slots: Vec<SlotSpec>) -> Self {
        Self::new("scripted", vec![ScriptedResponse::Slots(slots)])
    }

    pub fn empty() -> Self {
        Self::new("stub://empty", vec![ScriptedResponse::Slots(Vec::new())])
    }

    /// A few plates drifting across the frame.
    pub fn demo() -> Self {
        let script = (0..8)
            .map(|step| {
                let t = step as f32 * 0.05;
                ScriptedResponse::Slots(vec![
                    SlotSpec::new(1, 0.91, [0.20, 0.10 + t, 0.55, 0.40 + t]),
                    SlotSpec::new(4, 0.32, [0.60, 0.60, 0.90, 0.90]),
                    SlotSpec::new(5, 0.67, [0.50, 0.55 - t, 0.85, 0.85 - t]),
                ])
            })
            .collect();
        Self::new("stub://demo", script)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_layout(mut self, layout: OutputLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn calls(&self) -> u64 {
        self.stats.calls.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of overlapping `execute` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.stats.max_in_flight.load(Ordering::Acquire)
    }

    pub fn last_input_shape(&self) -> Option<Vec<usize>> {
        self.last_input_shape.lock().clone()
    }

    fn next_response(&self) -> Option<&ScriptedResponse> {
        if self.script.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::AcqRel) % self.script.len();
        self.script.get(i)
    }

    fn build_outputs(
        &self,
        slots: &[SlotSpec],
        arena: &TensorArena,
    ) -> Result<RawOutputSet, VisionError> {
        let n = slots.len();
        let count = self.layout.required_outputs();
        let mut tensors = Vec::with_capacity(count);
        for position in 0..count {
            let tensor = if position == self.layout.classes {
                arena.tensor_f32(&[1, n], slots.iter().map(|s| s.class_index).collect())?
            } else if position == self.layout.boxes {
                arena.tensor_f32(&[1, n, 4], slots.iter().flat_map(|s| s.bbox).collect())?
            } else if position == self.layout.scores {
                arena.tensor_f32(&[1, n], slots.iter().map(|s| s.score).collect())?
            } else {
                // detection count, as SSD exports emit it
                arena.tensor_f32(&[1], vec![n as f32])?
            };
            tensors.push(tensor);
        }
        Ok(RawOutputSet::new(tensors))
    }
}

#[async_trait]
impl InferenceModel for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        input: &Tensor,
        arena: &TensorArena,
    ) -> Result<RawOutputSet, VisionError> {
        let _guard = InFlight::enter(&self.stats);
        *self.last_input_shape.lock() = Some(input.shape().to_vec());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.next_response() {
            Some(ScriptedResponse::Slots(slots)) => self.build_outputs(slots, arena),
            Some(ScriptedResponse::Fail(reason)) => Err(VisionError::Inference(reason.clone())),
            None => self.build_outputs(&[], arena),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(arena: &TensorArena) -> Tensor {
        arena.tensor_u8(&[1, 2, 2, 3], vec![0; 12]).unwrap()
    }

    #[tokio::test]
    async fn test_outputs_follow_layout() {
        let arena = TensorArena::new();
        let model = ScriptedModel::constant(vec![
            SlotSpec::new(0, 0.9, [0.0, 0.0, 0.5, 0.5]),
            SlotSpec::new(3, 0.4, [0.1, 0.1, 0.2, 0.2]),
        ]);
        let input = input(&arena);
        let outputs = model.execute(&input, &arena).await.unwrap();
        assert_eq!(outputs.len(), 5);
        assert_eq!(outputs.get(0).unwrap().shape(), &[1, 2]);
        assert_eq!(outputs.get(1).unwrap().shape(), &[1, 2, 4]);
        assert_eq!(outputs.get(4).unwrap().get_f32(1), Some(0.4));
        assert_eq!(model.last_input_shape(), Some(vec![1, 2, 2, 3]));
        drop(outputs);
        drop(input);
        assert_eq!(arena.live(), 0);
    }

    #[tokio::test]
    async fn test_script_wraps_and_fails() {
        let arena = TensorArena::new();
        let model = ScriptedModel::new(
            "flaky",
            vec![
                ScriptedResponse::Slots(vec![]),
                ScriptedResponse::Fail("boom".to_string()),
            ],
        );
        let input = input(&arena);
        assert!(model.execute(&input, &arena).await.is_ok());
        assert!(matches!(
            model.execute(&input, &arena).await,
            Err(VisionError::Inference(_))
        ));
        assert!(model.execute(&input, &arena).await.is_ok());
        assert_eq!(model.calls(), 3);
        assert_eq!(model.in_flight(), 0);
        drop(input);
        assert_eq!(arena.live(), 0);
    }

    #[tokio::test]
    async fn test_custom_layout_positions() {
        let arena = TensorArena::new();
        let layout = OutputLayout {
            classes: 2,
            boxes: 0,
            scores: 1,
        };
        let model = ScriptedModel::constant(vec![SlotSpec::new(2, 0.7, [0.0; 4])]).with_layout(layout);
        let input = input(&arena);
        let outputs = model.execute(&input, &arena).await.unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs.get(0).unwrap().shape(), &[1, 1, 4]);
        assert_eq!(outputs.get(2).unwrap().get_f32(0), Some(2.0));
    }

    #[tokio::test]
    async fn test_demo_script_is_decodable() {
        use crate::labels::LabelTable;
        use crate::processing::{DetectionDecoder, FrameDimensions};

        let arena = TensorArena::new();
        let model = ScriptedModel::demo();
        let decoder = DetectionDecoder::new(LabelTable::sushi(), OutputLayout::default(), 0.5);
        let input = input(&arena);
        for _ in 0..8 {
            let outputs = model.execute(&input, &arena).await.unwrap();
            let dets = decoder
                .decode(&outputs, FrameDimensions::new(640, 480))
                .unwrap();
            assert_eq!(dets.len(), 2);
            assert_eq!(dets[0].label, "maguro");
            assert_eq!(dets[1].label, "ebi");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_counts_overlap() {
        let arena = TensorArena::new();
        let model = Arc::new(ScriptedModel::empty().with_delay(Duration::from_millis(50)));
        let a = {
            let (model, arena) = (model.clone(), arena.clone());
            tokio::spawn(async move {
                let input = arena.tensor_u8(&[1], vec![0]).unwrap();
                model.execute(&input, &arena).await.map(|_| ())
            })
        };
        let b = {
            let (model, arena) = (model.clone(), arena.clone());
            tokio::spawn(async move {
                let input = arena.tensor_u8(&[1], vec![0]).unwrap();
                model.execute(&input, &arena).await.map(|_| ())
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(model.max_in_flight(), 2);
        assert_eq!(arena.live(), 0);
    }
}
