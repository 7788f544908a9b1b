//! Per-cycle tensors with live-count accounting
//!
//! Every tensor handed to or produced by a model is leased from a
//! [`TensorArena`]. The lease is returned when the tensor is dropped, so a
//! tensor is released exactly once no matter which path a cycle exits on.

use crate::error::VisionError;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Upper bound on elements in a single tensor (guards shape overflow).
const MAX_TENSOR_ELEMENTS: usize = 100_000_000;

#[derive(Debug, Default)]
struct ArenaCounters {
    live: AtomicUsize,
    allocated: AtomicU64,
}

/// Allocator and bookkeeper for cycle-scoped tensors.
#[derive(Debug, Clone, Default)]
pub struct TensorArena {
    counters: Arc<ArenaCounters>,
}

impl TensorArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tensors currently alive.
    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::Acquire)
    }

    /// Total tensors ever allocated from this arena.
    pub fn allocated(&self) -> u64 {
        self.counters.allocated.load(Ordering::Acquire)
    }

    pub fn tensor_u8(&self, shape: &[usize], data: Vec<u8>) -> Result<Tensor, VisionError> {
        self.lease(shape, TensorData::U8(data))
    }

    pub fn tensor_f32(&self, shape: &[usize], data: Vec<f32>) -> Result<Tensor, VisionError> {
        self.lease(shape, TensorData::F32(data))
    }

    fn lease(&self, shape: &[usize], data: TensorData) -> Result<Tensor, VisionError> {
        let expected = element_count(shape)?;
        if data.len() != expected {
            return Err(VisionError::Inference(format!(
                "tensor data has {} elements, shape {:?} needs {}",
                data.len(),
                shape,
                expected
            )));
        }

        self.counters.live.fetch_add(1, Ordering::AcqRel);
        self.counters.allocated.fetch_add(1, Ordering::AcqRel);

        Ok(Tensor {
            shape: shape.to_vec(),
            data,
            _lease: Lease {
                counters: self.counters.clone(),
            },
        })
    }
}

fn element_count(shape: &[usize]) -> Result<usize, VisionError> {
    let count = shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| VisionError::Inference(format!("tensor shape {:?} overflows", shape)))?;
    if count > MAX_TENSOR_ELEMENTS {
        return Err(VisionError::Inference(format!(
            "tensor shape {:?} too large (max {} elements)",
            shape, MAX_TENSOR_ELEMENTS
        )));
    }
    Ok(count)
}

#[derive(Debug)]
struct Lease {
    counters: Arc<ArenaCounters>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    U8(Vec<u8>),
    F32(Vec<f32>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::U8(v) => v.len(),
            TensorData::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A dense tensor leased from a [`TensorArena`]. Not `Clone`.
#[derive(Debug)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
    _lease: Lease,
}

impl Tensor {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element `index` of the flattened tensor, widened to f32.
    pub fn get_f32(&self, index: usize) -> Option<f32> {
        match &self.data {
            TensorData::U8(v) => v.get(index).map(|&b| b as f32),
            TensorData::F32(v) => v.get(index).copied(),
        }
    }

    /// Release the tensor now. Equivalent to dropping it.
    pub fn release(self) {}
}

/// The model's ordered outputs for one cycle.
///
/// Positions carry meaning (see [`crate::processing::OutputLayout`]); the set
/// owns its tensors and releases all of them when dropped.
#[derive(Debug, Default)]
pub struct RawOutputSet {
    tensors: Vec<Tensor>,
}

impl RawOutputSet {
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self { tensors }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Tensor> {
        self.tensors.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_released_on_drop() {
        let arena = TensorArena::new();
        let t = arena.tensor_u8(&[1, 2, 2, 3], vec![0; 12]).unwrap();
        assert_eq!(arena.live(), 1);
        drop(t);
        assert_eq!(arena.live(), 0);
        assert_eq!(arena.allocated(), 1);
    }

    #[test]
    fn test_output_set_releases_every_tensor() {
        let arena = TensorArena::new();
        let set = RawOutputSet::new(vec![
            arena.tensor_f32(&[1, 3], vec![0.0; 3]).unwrap(),
            arena.tensor_f32(&[1, 3, 4], vec![0.0; 12]).unwrap(),
        ]);
        assert_eq!(arena.live(), 2);
        drop(set);
        assert_eq!(arena.live(), 0);
    }

    #[test]
    fn test_shape_mismatch_rejected_without_leak() {
        let arena = TensorArena::new();
        assert!(arena.tensor_f32(&[2, 2], vec![0.0; 3]).is_err());
        assert_eq!(arena.live(), 0);
        assert_eq!(arena.allocated(), 0);
    }

    #[test]
    fn test_overflowing_shape_rejected() {
        let arena = TensorArena::new();
        assert!(arena.tensor_u8(&[usize::MAX, 2], Vec::new()).is_err());
    }

    #[test]
    fn test_get_f32_widens_u8() {
        let arena = TensorArena::new();
        let t = arena.tensor_u8(&[3], vec![0, 128, 255]).unwrap();
        assert_eq!(t.get_f32(2), Some(255.0));
        assert_eq!(t.get_f32(3), None);
        t.release();
        assert_eq!(arena.live(), 0);
    }
}
