//! USB webcam platform via OpenCV `videoio`

use super::{
    CameraDevice, DeviceKind, MediaDevices, MediaStream, StreamConstraints, TrackInfo,
    TrackState,
};
use crate::error::VisionError;
use image::RgbImage;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{VideoCapture, CAP_ANY, CAP_PROP_FRAME_HEIGHT, CAP_PROP_FRAME_WIDTH},
};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Number of device indices probed during enumeration.
const DEFAULT_MAX_PROBE: u32 = 8;

/// Platform backed by OpenCV capture devices, identified by index.
pub struct OpenCvMediaDevices {
    max_probe: u32,
    requested_size: Option<(u32, u32)>,
    serial: AtomicU64,
}

impl Default for OpenCvMediaDevices {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PROBE)
    }
}

impl OpenCvMediaDevices {
    pub fn new(max_probe: u32) -> Self {
        Self {
            max_probe,
            requested_size: None,
            serial: AtomicU64::new(0),
        }
    }

    /// Ask devices for this capture size when opening.
    pub fn with_requested_size(mut self, width: u32, height: u32) -> Self {
        self.requested_size = Some((width, height));
        self
    }
}

impl MediaDevices for OpenCvMediaDevices {
    fn enumerate_devices(&self) -> Result<Vec<CameraDevice>, VisionError> {
        let mut devices = Vec::new();
        for index in 0..self.max_probe {
            let mut capture = match VideoCapture::new(index as i32, CAP_ANY) {
                Ok(capture) => capture,
                Err(e) => {
                    debug!("Probe of camera {} failed: {}", index, e);
                    continue;
                }
            };
            if capture.is_opened()? {
                devices.push(CameraDevice::video(
                    index.to_string(),
                    format!("Video device {}", index),
                ));
            }
            capture.release()?;
        }
        Ok(devices)
    }

    fn get_user_media(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn MediaStream>, VisionError> {
        if let Some(mode) = constraints.facing_mode {
            return Err(VisionError::CameraAccess(format!(
                "facing mode '{}' is not supported by OpenCV capture",
                mode.as_str()
            )));
        }

        let index: i32 = match &constraints.device_id {
            Some(id) => id
                .parse()
                .map_err(|_| VisionError::CameraAccess(format!("invalid device id '{}'", id)))?,
            None => 0,
        };

        let mut capture = VideoCapture::new(index, CAP_ANY)
            .map_err(|e| VisionError::CameraAccess(format!("Failed to open camera {}: {}", index, e)))?;
        if !capture.is_opened()? {
            return Err(VisionError::CameraAccess(format!(
                "Camera {} failed to open",
                index
            )));
        }

        if let Some((width, height)) = self.requested_size {
            if !capture.set(CAP_PROP_FRAME_WIDTH, width as f64)?
                || !capture.set(CAP_PROP_FRAME_HEIGHT, height as f64)?
            {
                warn!("Camera {} ignored requested size {}x{}", index, width, height);
            }
        }

        let width = capture.get(CAP_PROP_FRAME_WIDTH)?.max(0.0) as u32;
        let height = capture.get(CAP_PROP_FRAME_HEIGHT)?.max(0.0) as u32;
        let serial = self.serial.fetch_add(1, Ordering::AcqRel) + 1;

        info!("Camera {} opened at {}x{}", index, width, height);

        Ok(Box::new(OpenCvStream {
            id: format!("opencv-stream-{}", serial),
            device_id: index.to_string(),
            capture: Some(capture),
            size: (width, height),
        }))
    }
}

struct OpenCvStream {
    id: String,
    device_id: String,
    capture: Option<VideoCapture>,
    size: (u32, u32),
}

impl MediaStream for OpenCvStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn tracks(&self) -> Vec<TrackInfo> {
        vec![TrackInfo {
            id: format!("{}-video", self.id),
            kind: DeviceKind::VideoInput,
            state: if self.capture.is_some() {
                TrackState::Live
            } else {
                TrackState::Ended
            },
        }]
    }

    fn stop_all_tracks(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                warn!("Failed to release camera {}: {}", self.device_id, e);
            }
        }
    }

    fn native_size(&self) -> (u32, u32) {
        self.size
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>, VisionError> {
        let Some(capture) = self.capture.as_mut() else {
            return Ok(None);
        };

        let mut bgr = Mat::default();
        if !capture.read(&mut bgr)? || bgr.empty() {
            return Ok(None);
        }

        let mut rgb = Mat::default();
        imgproc::cvt_color(&bgr, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;

        let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
        let bytes = rgb.data_bytes()?.to_vec();
        RgbImage::from_raw(width, height, bytes)
            .map(Some)
            .ok_or_else(|| VisionError::CameraAccess("camera frame has unexpected layout".to_string()))
    }
}

impl Drop for OpenCvStream {
    fn drop(&mut self) {
        self.stop_all_tracks();
    }
}
