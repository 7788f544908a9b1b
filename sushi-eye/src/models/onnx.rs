//! ONNX Runtime model

use super::InferenceModel;
use crate::error::VisionError;
use crate::tensor::{RawOutputSet, Tensor, TensorArena, TensorData};
use async_trait::async_trait;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{DynValue, Tensor as OrtTensor, TensorElementType, ValueType};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Detection graph executed by ONNX Runtime on a blocking thread.
pub struct OnnxModel {
    name: String,
    session: Arc<Mutex<Session>>,
    input_name: String,
    output_names: Vec<String>,
}

impl OnnxModel {
    pub fn from_file(path: &Path) -> Result<Self, VisionError> {
        if !path.exists() {
            return Err(VisionError::ModelLoad(format!(
                "model file {} not found",
                path.display()
            )));
        }
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(path)
            .map_err(|e| VisionError::ModelLoad(format!("{}: {}", path.display(), e)))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| VisionError::ModelLoad("model declares no inputs".to_string()))?;
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        info!(
            "ONNX model loaded from {:?} (input '{}', {} outputs)",
            path,
            input_name,
            output_names.len()
        );

        Ok(Self {
            name: path.display().to_string(),
            session: Arc::new(Mutex::new(session)),
            input_name,
            output_names,
        })
    }

    fn run_blocking(
        session: &Mutex<Session>,
        input_name: &str,
        output_names: &[String],
        shape: Vec<i64>,
        data: TensorData,
        arena: &TensorArena,
    ) -> Result<RawOutputSet, VisionError> {
        let input = match data {
            TensorData::U8(v) => OrtTensor::from_array((shape, v))?.into_dyn(),
            TensorData::F32(v) => OrtTensor::from_array((shape, v))?.into_dyn(),
        };

        let mut session = session.lock();
        let outputs = session.run(ort::inputs![input_name => input])?;

        let mut tensors = Vec::with_capacity(output_names.len());
        for name in output_names {
            let value = outputs.get(name.as_str()).ok_or_else(|| {
                VisionError::Inference(format!("output '{}' missing from run", name))
            })?;
            tensors.push(to_tensor(value, arena)?);
        }
        debug!("ONNX run produced {} outputs", tensors.len());
        Ok(RawOutputSet::new(tensors))
    }
}

/// Copy an ORT output into an arena tensor, widening to f32.
fn to_tensor(value: &DynValue, arena: &TensorArena) -> Result<Tensor, VisionError> {
    let element = match value.dtype() {
        ValueType::Tensor { ty, .. } => *ty,
        other => {
            return Err(VisionError::Inference(format!(
                "unsupported output type {:?}",
                other
            )))
        }
    };
    let (shape, data): (Vec<usize>, Vec<f32>) = match element {
        TensorElementType::Float32 => {
            let (shape, data) = value.try_extract_tensor::<f32>()?;
            (dims(shape), data.to_vec())
        }
        TensorElementType::Int64 => {
            let (shape, data) = value.try_extract_tensor::<i64>()?;
            (dims(shape), data.iter().map(|&v| v as f32).collect())
        }
        TensorElementType::Int32 => {
            let (shape, data) = value.try_extract_tensor::<i32>()?;
            (dims(shape), data.iter().map(|&v| v as f32).collect())
        }
        TensorElementType::Uint8 => {
            let (shape, data) = value.try_extract_tensor::<u8>()?;
            (dims(shape), data.iter().map(|&v| v as f32).collect())
        }
        other => {
            return Err(VisionError::Inference(format!(
                "unsupported output element type {:?}",
                other
            )))
        }
    };
    arena.tensor_f32(&shape, data)
}

fn dims(shape: &[i64]) -> Vec<usize> {
    shape.iter().map(|&d| d.max(0) as usize).collect()
}

#[async_trait]
impl InferenceModel for OnnxModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        input: &Tensor,
        arena: &TensorArena,
    ) -> Result<RawOutputSet, VisionError> {
        let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let data = input.data().clone();
        let session = self.session.clone();
        let input_name = self.input_name.clone();
        let output_names = self.output_names.clone();
        let arena = arena.clone();

        tokio::task::spawn_blocking(move || {
            Self::run_blocking(&session, &input_name, &output_names, shape, data, &arena)
        })
        .await
        .map_err(|e| VisionError::Inference(format!("inference task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_model_load_error() {
        let result = OnnxModel::from_file(Path::new("/nonexistent/sushi.onnx"));
        assert!(matches!(result, Err(VisionError::ModelLoad(_))));
    }

    #[test]
    fn test_dims_clamps_dynamic_axes() {
        assert_eq!(dims(&[1, -1, 4]), vec![1, 0, 4]);
    }
}
