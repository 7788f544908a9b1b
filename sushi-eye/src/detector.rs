//! Detection system
//!
//! [`DetectorState`] holds everything that survives across ticks (camera,
//! surface, decoder, last detections). [`DetectionSystem`] owns that state,
//! the model slot, the tensor arena and the scheduler, and publishes one
//! [`DetectionFrame`] per completed cycle.

use crate::camera::{CameraDevice, CameraManager, CameraSelector, MediaDevices};
use crate::config::{DetectorConfig, SurfaceConfig};
use crate::error::VisionError;
use crate::models::{load_model, InferenceModel, ModelCache, ModelSlot, ModelSource};
use crate::processing::{
    Detection, DetectionDecoder, DrawingSurface, FrameBuffer, FrameDimensions, FrameSampler,
    Renderer,
};
use crate::scheduler::{CycleRunner, CycleToken, Scheduler, SchedulerState, SchedulerStats};
use crate::tensor::{RawOutputSet, Tensor, TensorArena};
use async_trait::async_trait;
use image::RgbImage;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const EVENT_CAPACITY: usize = 64;

/// Published after every completed cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionFrame {
    pub sequence: u64,
    pub dimensions: FrameDimensions,
    pub detections: Vec<Detection>,
}

/// Point-in-time system counters
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub scheduler_state: SchedulerState,
    pub scheduler: SchedulerStats,
    pub model: Option<String>,
    pub active_device: Option<String>,
    pub live_tensors: usize,
    pub tensors_allocated: u64,
    pub frames_published: u64,
}

/// State carried from one tick to the next.
pub struct DetectorState {
    camera: CameraManager,
    surface: SurfaceConfig,
    buffer: FrameBuffer,
    sampler: FrameSampler,
    decoder: DetectionDecoder,
    renderer: Renderer,
    last_frame: Option<RgbImage>,
    latest: Vec<Detection>,
}

impl DetectorState {
    pub fn new(config: &DetectorConfig, camera: CameraManager) -> Result<Self, VisionError> {
        config.validate()?;
        let (width, height) = config.surface.resolve(camera.native_size());
        let mut buffer = FrameBuffer::new(width, height)?;
        if let Some(path) = &config.overlay.font_path {
            match FrameBuffer::load_font(path) {
                Ok(font) => buffer.set_font(Some(font)),
                Err(e) => warn!("Label font unavailable, labels will not be rasterized: {}", e),
            }
        }

        Ok(Self {
            camera,
            surface: config.surface,
            buffer,
            sampler: FrameSampler::new(config.tensor_encoding),
            decoder: DetectionDecoder::new(
                config.label_table()?,
                config.output_layout,
                config.score_threshold,
            ),
            renderer: Renderer::new(config.overlay.clone()),
            last_frame: None,
            latest: Vec::new(),
        })
    }

    pub fn camera(&self) -> &CameraManager {
        &self.camera
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn latest(&self) -> &[Detection] {
        &self.latest
    }

    /// Grab the current frame into the buffer and encode it.
    ///
    /// The buffer now shows the bare frame, so the previous cycle's
    /// detections are dropped too; a cycle that fails after this point
    /// leaves none. `Ok(None)` when the stream has no frame to give.
    pub fn capture(&mut self, arena: &TensorArena) -> Result<Option<Tensor>, VisionError> {
        let Some(frame) = self.camera.read_frame()? else {
            return Ok(None);
        };
        self.fit_surface()?;
        self.latest.clear();
        let tensor = self.sampler.sample(&frame, &mut self.buffer, arena)?;
        self.last_frame = Some(frame);
        Ok(Some(tensor))
    }

    /// Decode `outputs`, redraw the overlay and remember the result.
    pub fn complete(&mut self, outputs: &RawOutputSet) -> Result<Vec<Detection>, VisionError> {
        let dims = self.buffer.dimensions();
        let detections = self.decoder.decode(outputs, dims)?;
        if let Some(frame) = &self.last_frame {
            self.renderer.render(&mut self.buffer, frame, &detections);
        }
        self.latest = detections.clone();
        Ok(detections)
    }

    fn fit_surface(&mut self) -> Result<(), VisionError> {
        let (width, height) = self.surface.resolve(self.camera.native_size());
        let current = self.buffer.dimensions();
        if (current.width, current.height) != (width, height) {
            debug!("Resizing surface to {}x{}", width, height);
            self.buffer.resize(width, height)?;
        }
        Ok(())
    }
}

/// Tensors owned by one cycle. Dropping the scope releases all of them.
#[derive(Default)]
struct CycleResources {
    input: Option<Tensor>,
    outputs: Option<RawOutputSet>,
}

impl CycleResources {
    fn release_input(&mut self) {
        if let Some(input) = self.input.take() {
            input.release();
        }
    }
}

impl Drop for CycleResources {
    fn drop(&mut self) {
        let held = self.input.is_some() as usize + self.outputs.as_ref().map_or(0, RawOutputSet::len);
        if held > 0 {
            trace!("Releasing {} cycle tensors", held);
        }
    }
}

/// What the scheduler drives.
struct DetectionEngine {
    state: Mutex<DetectorState>,
    model: ModelSlot,
    arena: TensorArena,
    events: broadcast::Sender<DetectionFrame>,
    frames_published: AtomicU64,
}

#[async_trait]
impl CycleRunner for DetectionEngine {
    fn is_ready(&self) -> bool {
        self.model.is_loaded() && self.state.lock().camera.is_ready()
    }

    async fn run_cycle(&self, token: &CycleToken) -> Result<(), VisionError> {
        let Some(model) = self.model.get() else {
            return Ok(());
        };
        let mut resources = CycleResources::default();

        resources.input = self.state.lock().capture(&self.arena)?;
        let result = match resources.input.as_ref() {
            Some(input) => model.execute(input, &self.arena).await,
            None => {
                trace!("Cycle {}: no frame available", token.sequence());
                return Ok(());
            }
        };
        resources.release_input();
        resources.outputs = Some(result?);

        if token.is_cancelled() {
            debug!("Cycle {} cancelled after inference", token.sequence());
            return Ok(());
        }

        let Some(outputs) = resources.outputs.as_ref() else {
            return Ok(());
        };
        let (detections, dimensions) = {
            let mut state = self.state.lock();
            let detections = state.complete(outputs)?;
            (detections, state.buffer.dimensions())
        };
        drop(resources);

        if !detections.is_empty() {
            debug!(
                "Cycle {}: {}",
                token.sequence(),
                detections
                    .iter()
                    .map(|d| format!("{} {:.2}", d.label, d.score))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        self.frames_published.fetch_add(1, Ordering::AcqRel);
        // no subscribers is fine
        let _ = self.events.send(DetectionFrame {
            sequence: token.sequence(),
            dimensions,
            detections,
        });
        Ok(())
    }
}

/// The running detector.
pub struct DetectionSystem {
    engine: Arc<DetectionEngine>,
    scheduler: Scheduler,
    model_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl DetectionSystem {
    /// Start with the model named by `config.model_source`.
    ///
    /// The model loads in the background; until it is in place (or forever,
    /// if loading fails) ticks are no-ops. A camera that cannot be opened is
    /// reported and likewise leaves the loop idle.
    pub async fn start(
        config: DetectorConfig,
        platform: Arc<dyn MediaDevices>,
    ) -> Result<Self, VisionError> {
        let system = Self::launch(&config, platform, ModelSlot::empty())?;

        let slot = system.engine.model.clone();
        let source = config.model_source.clone();
        let handle = tokio::spawn(async move {
            let loaded = match ModelSource::parse(&source) {
                Ok(source) => load_model(&source, &ModelCache::default()).await,
                Err(e) => Err(e),
            };
            match loaded {
                Ok(model) => slot.set(model),
                Err(e) => error!("Model load failed, detections disabled: {}", e),
            }
        });
        *system.model_task.lock() = Some(handle);
        Ok(system)
    }

    /// Start with an already loaded model.
    pub async fn start_with_model(
        config: DetectorConfig,
        platform: Arc<dyn MediaDevices>,
        model: Arc<dyn InferenceModel>,
    ) -> Result<Self, VisionError> {
        Self::launch(&config, platform, ModelSlot::loaded(model))
    }

    fn launch(
        config: &DetectorConfig,
        platform: Arc<dyn MediaDevices>,
        model: ModelSlot,
    ) -> Result<Self, VisionError> {
        config.validate()?;
        let mut camera = CameraManager::new(platform);
        if let Err(e) = camera.open(config.camera.clone()) {
            error!("Camera unavailable: {}", e);
        }
        let state = DetectorState::new(config, camera)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let engine = Arc::new(DetectionEngine {
            state: Mutex::new(state),
            model,
            arena: TensorArena::new(),
            events,
            frames_published: AtomicU64::new(0),
        });
        let scheduler = Scheduler::start(config.interval(), engine.clone())?;
        info!("Detection system started");

        Ok(Self {
            engine,
            scheduler,
            model_task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Wait for a background model load to finish. True if a model is loaded.
    pub async fn wait_for_model(&self) -> bool {
        let task = self.model_task.lock().take();
        if let Some(handle) = task {
            if let Err(e) = handle.await {
                warn!("Model loader task ended abnormally: {}", e);
            }
        }
        self.engine.model.is_loaded()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectionFrame> {
        self.engine.events.subscribe()
    }

    /// Switch to another camera. The old stream is fully stopped first.
    /// Returns the id of the device now streaming.
    pub fn switch_camera(&self, selector: CameraSelector) -> Result<String, VisionError> {
        let mut state = self.engine.state.lock();
        let active = state.camera.switch(selector)?;
        Ok(active.device_id().to_string())
    }

    pub fn list_devices(&self) -> Vec<CameraDevice> {
        self.engine.state.lock().camera.list_devices()
    }

    pub fn latest_detections(&self) -> Vec<Detection> {
        self.engine.state.lock().latest.clone()
    }

    /// Copy of the drawing surface as last rendered.
    pub fn snapshot(&self) -> FrameBuffer {
        self.engine.state.lock().buffer.clone()
    }

    pub fn arena(&self) -> &TensorArena {
        &self.engine.arena
    }

    pub fn stats(&self) -> SystemStats {
        let active_device = self
            .engine
            .state
            .lock()
            .camera
            .active()
            .map(|a| a.device_id().to_string());
        SystemStats {
            scheduler_state: self.scheduler.state(),
            scheduler: self.scheduler.stats(),
            model: self.engine.model.get().map(|m| m.name().to_string()),
            active_device,
            live_tensors: self.engine.arena.live(),
            tensors_allocated: self.engine.arena.allocated(),
            frames_published: self.engine.frames_published.load(Ordering::Acquire),
        }
    }

    /// Stop the scheduler, then the camera. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.shutdown().await;
        if let Some(handle) = self.model_task.lock().take() {
            handle.abort();
        }
        let stopped = self.engine.state.lock().camera.stop();
        info!("Detection system stopped ({} camera tracks released)", stopped);
    }
}
