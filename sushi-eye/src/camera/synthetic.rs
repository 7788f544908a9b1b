//! Synthetic camera platform
//!
//! Deterministic test-pattern cameras with the same lifecycle rules as real
//! hardware: each open stream holds one video track until stopped. Track
//! accounting is exposed so callers can check that two streams are never
//! open at once.

use super::{
    CameraDevice, DeviceKind, FacingMode, MediaDevices, MediaStream, StreamConstraints,
    TrackInfo, TrackState,
};
use crate::error::VisionError;
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

/// One simulated camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticCamera {
    pub id: String,
    pub label: String,
    pub facing: Option<FacingMode>,
    pub size: (u32, u32),
}

impl SyntheticCamera {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        facing: Option<FacingMode>,
        size: (u32, u32),
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            facing,
            size,
        }
    }
}

#[derive(Debug, Default)]
struct TrackLedger {
    open: AtomicUsize,
    max_open: AtomicUsize,
    streams_opened: AtomicU64,
}

impl TrackLedger {
    fn acquire(&self) {
        let now = self.open.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_open.fetch_max(now, Ordering::AcqRel);
        self.streams_opened.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Platform serving [`SyntheticCamera`]s.
#[derive(Debug)]
pub struct SyntheticMediaDevices {
    cameras: Vec<SyntheticCamera>,
    denied: AtomicBool,
    ledger: Arc<TrackLedger>,
}

impl SyntheticMediaDevices {
    pub fn new(cameras: Vec<SyntheticCamera>) -> Self {
        Self {
            cameras,
            denied: AtomicBool::new(false),
            ledger: Arc::new(TrackLedger::default()),
        }
    }

    /// A front camera (640×480) followed by a back camera (1280×720).
    pub fn front_and_back() -> Self {
        Self::new(vec![
            SyntheticCamera::new(
                "synthetic-front",
                "Front Camera (synthetic)",
                Some(FacingMode::User),
                (640, 480),
            ),
            SyntheticCamera::new(
                "synthetic-back",
                "Back Camera (synthetic)",
                Some(FacingMode::Environment),
                (1280, 720),
            ),
        ])
    }

    /// Simulate the user denying (or granting) camera permission.
    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::Release);
    }

    /// Tracks currently holding a camera.
    pub fn open_tracks(&self) -> usize {
        self.ledger.open.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously open tracks ever observed.
    pub fn max_concurrent_tracks(&self) -> usize {
        self.ledger.max_open.load(Ordering::Acquire)
    }

    pub fn streams_opened(&self) -> u64 {
        self.ledger.streams_opened.load(Ordering::Acquire)
    }

    fn check_permission(&self) -> Result<(), VisionError> {
        if self.denied.load(Ordering::Acquire) {
            return Err(VisionError::CameraAccess(
                "NotAllowedError: permission denied".to_string(),
            ));
        }
        Ok(())
    }

    fn find(&self, constraints: &StreamConstraints) -> Result<&SyntheticCamera, VisionError> {
        if let Some(id) = &constraints.device_id {
            return self
                .cameras
                .iter()
                .find(|c| &c.id == id)
                .ok_or_else(|| {
                    VisionError::CameraAccess(format!("OverconstrainedError: deviceId {}", id))
                });
        }
        if let Some(mode) = constraints.facing_mode {
            return self
                .cameras
                .iter()
                .find(|c| c.facing == Some(mode))
                .ok_or_else(|| {
                    VisionError::CameraAccess(format!(
                        "OverconstrainedError: facingMode {}",
                        mode.as_str()
                    ))
                });
        }
        self.cameras
            .first()
            .ok_or_else(|| VisionError::CameraAccess("NotFoundError: no camera".to_string()))
    }
}

impl MediaDevices for SyntheticMediaDevices {
    fn enumerate_devices(&self) -> Result<Vec<CameraDevice>, VisionError> {
        self.check_permission()?;
        Ok(self
            .cameras
            .iter()
            .map(|c| CameraDevice::video(c.id.clone(), c.label.clone()))
            .collect())
    }

    fn get_user_media(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn MediaStream>, VisionError> {
        self.check_permission()?;
        let camera = self.find(constraints)?.clone();
        self.ledger.acquire();
        let serial = self.ledger.streams_opened.load(Ordering::Acquire);
        info!("Synthetic camera {} opened", camera.id);
        Ok(Box::new(SyntheticStream {
            id: format!("synthetic-stream-{}", serial),
            camera,
            frame_count: 0,
            live: true,
            ledger: self.ledger.clone(),
        }))
    }
}

struct SyntheticStream {
    id: String,
    camera: SyntheticCamera,
    frame_count: u64,
    live: bool,
    ledger: Arc<TrackLedger>,
}

impl SyntheticStream {
    /// Moving diagonal gradient; shifts a little every frame.
    fn render_pattern(&self) -> RgbImage {
        let (width, height) = self.camera.size;
        let shift = self.frame_count as u32;
        let tint = match self.camera.facing {
            Some(FacingMode::User) => 40u8,
            Some(FacingMode::Environment) => 160u8,
            None => 100u8,
        };
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                (x.wrapping_add(shift) % 256) as u8,
                (y.wrapping_add(shift) % 256) as u8,
                tint,
            ])
        })
    }
}

impl MediaStream for SyntheticStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn device_id(&self) -> &str {
        &self.camera.id
    }

    fn tracks(&self) -> Vec<TrackInfo> {
        vec![TrackInfo {
            id: format!("{}-video", self.id),
            kind: DeviceKind::VideoInput,
            state: if self.live {
                TrackState::Live
            } else {
                TrackState::Ended
            },
        }]
    }

    fn stop_all_tracks(&mut self) {
        if self.live {
            self.live = false;
            self.ledger.release();
        }
    }

    fn native_size(&self) -> (u32, u32) {
        self.camera.size
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>, VisionError> {
        if !self.live {
            return Ok(None);
        }
        self.frame_count += 1;
        Ok(Some(self.render_pattern()))
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.stop_all_tracks();
    }
}
