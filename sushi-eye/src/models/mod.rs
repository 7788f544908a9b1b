//! Inference models
//!
//! [`InferenceModel`] is the only thing the detection loop knows about a
//! model: one tensor in, one positional [`RawOutputSet`] out. Models are
//! loaded once at startup into a [`ModelSlot`]; an empty slot keeps the loop
//! idle.

pub mod cache;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod scripted;

pub use cache::ModelCache;
#[cfg(feature = "onnx")]
pub use onnx::OnnxModel;
pub use scripted::{ScriptedModel, ScriptedResponse, SlotSpec};

use crate::error::VisionError;
use crate::tensor::{RawOutputSet, Tensor, TensorArena};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Scheme for built-in scripted models.
pub const STUB_SCHEME: &str = "stub://";

/// A loaded inference graph.
#[async_trait]
pub trait InferenceModel: Send + Sync {
    fn name(&self) -> &str;

    /// Run one inference. Output tensors are leased from `arena`.
    async fn execute(&self, input: &Tensor, arena: &TensorArena)
        -> Result<RawOutputSet, VisionError>;
}

/// Built-in scripted model variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    /// Cycles through a few plausible plates
    Demo,
    /// Never detects anything
    Empty,
}

/// Where a model comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// `stub://demo`, `stub://empty`, optionally `?delay_ms=N`
    Stub { kind: StubKind, delay: Duration },
    File(PathBuf),
    /// `https://` URL, downloaded into the model cache
    Remote(String),
}

impl ModelSource {
    pub fn parse(source: &str) -> Result<Self, VisionError> {
        let source = source.trim();
        if source.is_empty() {
            return Err(VisionError::ModelLoad("empty model source".to_string()));
        }
        if let Some(rest) = source.strip_prefix(STUB_SCHEME) {
            return parse_stub(rest);
        }
        if source.starts_with("https://") || source.starts_with("http://") {
            return Ok(ModelSource::Remote(source.to_string()));
        }
        Ok(ModelSource::File(PathBuf::from(source)))
    }
}

fn parse_stub(rest: &str) -> Result<ModelSource, VisionError> {
    let (name, query) = match rest.split_once('?') {
        Some((name, query)) => (name, Some(query)),
        None => (rest, None),
    };
    let kind = match name {
        "" | "demo" => StubKind::Demo,
        "empty" => StubKind::Empty,
        other => {
            return Err(VisionError::ModelLoad(format!(
                "unknown stub model '{}'",
                other
            )))
        }
    };

    let mut delay = Duration::ZERO;
    for pair in query.into_iter().flat_map(|q| q.split('&')) {
        match pair.split_once('=') {
            Some(("delay_ms", value)) => {
                let ms: u64 = value.parse().map_err(|_| {
                    VisionError::ModelLoad(format!("invalid stub delay '{}'", value))
                })?;
                delay = Duration::from_millis(ms);
            }
            _ => {
                return Err(VisionError::ModelLoad(format!(
                    "unknown stub parameter '{}'",
                    pair
                )))
            }
        }
    }
    Ok(ModelSource::Stub { kind, delay })
}

/// Shared, late-filled handle to the loaded model.
#[derive(Clone, Default)]
pub struct ModelSlot {
    inner: Arc<RwLock<Option<Arc<dyn InferenceModel>>>>,
}

impl ModelSlot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn loaded(model: Arc<dyn InferenceModel>) -> Self {
        let slot = Self::default();
        slot.set(model);
        slot
    }

    pub fn set(&self, model: Arc<dyn InferenceModel>) {
        *self.inner.write() = Some(model);
    }

    pub fn get(&self) -> Option<Arc<dyn InferenceModel>> {
        self.inner.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().is_some()
    }
}

impl std::fmt::Debug for ModelSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.get().map(|m| m.name().to_string());
        f.debug_struct("ModelSlot").field("model", &name).finish()
    }
}

/// Load a model from `source`. Remote models go through `cache`.
pub async fn load_model(
    source: &ModelSource,
    cache: &ModelCache,
) -> Result<Arc<dyn InferenceModel>, VisionError> {
    let model: Arc<dyn InferenceModel> = match source {
        ModelSource::Stub { kind, delay } => {
            let model = match kind {
                StubKind::Demo => ScriptedModel::demo(),
                StubKind::Empty => ScriptedModel::empty(),
            };
            Arc::new(model.with_delay(*delay))
        }
        ModelSource::File(path) => load_file(path.clone()).await?,
        ModelSource::Remote(url) => {
            let path = cache.fetch(url).await?;
            load_file(path).await?
        }
    };
    info!("Model '{}' loaded", model.name());
    Ok(model)
}

#[cfg(feature = "onnx")]
async fn load_file(path: PathBuf) -> Result<Arc<dyn InferenceModel>, VisionError> {
    let model = tokio::task::spawn_blocking(move || OnnxModel::from_file(&path))
        .await
        .map_err(|e| VisionError::ModelLoad(format!("model loader panicked: {}", e)))??;
    Ok(Arc::new(model))
}

#[cfg(not(feature = "onnx"))]
async fn load_file(path: PathBuf) -> Result<Arc<dyn InferenceModel>, VisionError> {
    if !path.exists() {
        return Err(VisionError::ModelLoad(format!(
            "model file {} not found",
            path.display()
        )));
    }
    tracing::warn!("Built without the `onnx` feature; cannot run {}", path.display());
    Err(VisionError::ModelLoad(format!(
        "{}: model files need the `onnx` feature",
        path.display()
    )))
}
