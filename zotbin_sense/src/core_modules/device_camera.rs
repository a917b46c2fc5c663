// THEORY:
// `DeviceCamera` is the live frame source: a V4L2 device read through OpenCV's
// `VideoCapture`. It asks the driver for the configured resolution, drops a few
// frames while auto exposure settles, and converts every BGR `Mat` into an
// `RgbImage` so nothing above this file sees OpenCV types.
//
// The device is released exactly once, by `close` or on drop, whichever comes
// first. A capture after release is an error rather than a reopen.

use crate::core_modules::camera::Camera;
use crate::error::{Result, SenseError};
use image::RgbImage;
use log::{debug, info, warn};
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};

fn cv_err(err: opencv::Error) -> SenseError {
    SenseError::Camera(err.to_string())
}

pub struct DeviceCamera {
    capture: VideoCapture,
    raw: Mat,
    rgb: Mat,
    device: i32,
    released: bool,
}

impl DeviceCamera {
    /// Opens `/dev/video<device>` and requests `width`×`height`.
    pub fn open(device: i32, width: u32, height: u32, warmup_frames: u32) -> Result<Self> {
        let mut capture = VideoCapture::new(device, videoio::CAP_V4L2).map_err(cv_err)?;
        if !capture.is_opened().map_err(cv_err)? {
            return Err(SenseError::Camera(format!("cannot open /dev/video{device}")));
        }
        capture
            .set(videoio::CAP_PROP_FRAME_WIDTH, width as f64)
            .map_err(cv_err)?;
        capture
            .set(videoio::CAP_PROP_FRAME_HEIGHT, height as f64)
            .map_err(cv_err)?;

        let mut camera = Self {
            capture,
            raw: Mat::default(),
            rgb: Mat::default(),
            device,
            released: false,
        };
        for _ in 0..warmup_frames {
            camera.grab()?;
        }
        let got = (
            camera.capture.get(videoio::CAP_PROP_FRAME_WIDTH).map_err(cv_err)? as u32,
            camera.capture.get(videoio::CAP_PROP_FRAME_HEIGHT).map_err(cv_err)? as u32,
        );
        if got != (width, height) {
            warn!("/dev/video{device} delivers {}x{} instead of {width}x{height}", got.0, got.1);
        }
        info!("opened /dev/video{device} at {}x{}", got.0, got.1);
        Ok(camera)
    }

    fn grab(&mut self) -> Result<()> {
        if self.released {
            return Err(SenseError::Camera(format!("/dev/video{} is released", self.device)));
        }
        let ok = self.capture.read(&mut self.raw).map_err(cv_err)?;
        if !ok || self.raw.empty() {
            return Err(SenseError::Camera(format!("/dev/video{} returned no frame", self.device)));
        }
        Ok(())
    }
}

impl Camera for DeviceCamera {
    fn capture(&mut self) -> Result<RgbImage> {
        self.grab()?;
        imgproc::cvt_color(&self.raw, &mut self.rgb, imgproc::COLOR_BGR2RGB, 0).map_err(cv_err)?;
        let (width, height) = (self.rgb.cols() as u32, self.rgb.rows() as u32);
        let bytes = self.rgb.data_bytes().map_err(cv_err)?.to_vec();
        RgbImage::from_raw(width, height, bytes)
            .ok_or_else(|| SenseError::Camera(format!("short frame buffer for {width}x{height}")))
    }

    fn close(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.capture.release() {
            Ok(()) => debug!("released /dev/video{}", self.device),
            Err(err) => warn!("releasing /dev/video{} failed: {err}", self.device),
        }
    }
}

impl Drop for DeviceCamera {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_is_a_camera_error() {
        assert!(matches!(
            DeviceCamera::open(4095, 640, 480, 0),
            Err(SenseError::Camera(_))
        ));
    }
}
