use opencv::{core::Mat, prelude::*, videoio};
use thiserror::Error;

use crate::config::CameraConfig;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Failed to open camera: {0}")]
    OpenCameraFailed(opencv::Error),
    #[error("Camera {0} is not available")]
    DeviceUnavailable(i32),
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(opencv::Error),
}

/// One captured video frame.
pub struct Frame {
    pub mat: Mat,
}

pub trait FrameSource: Send {
    fn start(&mut self, device_index: i32) -> Result<(), CameraError>;
    fn read(&mut self) -> Result<Option<Frame>, CameraError>;
    fn release(&mut self);
    fn is_started(&self) -> bool;
}

pub struct Camera {
    capture: Option<videoio::VideoCapture>,
    frame_width: u32,
    frame_height: u32,
    frame_rate: u32,
}

impl Camera {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            capture: None,
            frame_width: config.frame_width,
            frame_height: config.frame_height,
            frame_rate: config.frame_rate,
        }
    }
}

impl FrameSource for Camera {
    fn start(&mut self, device_index: i32) -> Result<(), CameraError> {
        self.release();

        let mut capture = videoio::VideoCapture::new(device_index, videoio::CAP_ANY)
            .map_err(CameraError::OpenCameraFailed)?;
        if !capture.is_opened().map_err(CameraError::OpenCameraFailed)? {
            return Err(CameraError::DeviceUnavailable(device_index));
        }

        // Geometry is a request, not a guarantee; some devices ignore it.
        let _ = capture.set(videoio::CAP_PROP_FRAME_WIDTH, self.frame_width as f64);
        let _ = capture.set(videoio::CAP_PROP_FRAME_HEIGHT, self.frame_height as f64);
        let _ = capture.set(videoio::CAP_PROP_FPS, self.frame_rate as f64);

        self.capture = Some(capture);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>, CameraError> {
        let Some(capture) = self.capture.as_mut() else {
            return Ok(None);
        };

        let mut mat = Mat::default();
        if !capture.read(&mut mat).map_err(CameraError::ReadFrameFailed)? || mat.empty() {
            return Ok(None);
        }
        Ok(Some(Frame { mat }))
    }

    fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                tracing::debug!("camera release failed: {:?}", e);
            }
        }
    }

    fn is_started(&self) -> bool {
        self.capture.is_some()
    }
}
