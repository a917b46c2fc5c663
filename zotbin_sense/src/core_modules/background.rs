// THEORY:
// The `BackgroundModel` is the picture of the empty chute that every live frame
// is compared against. It is captured once, at startup, and replaced only on an
// explicit recapture. It is never blended with live frames: a bin that sees a
// slow trickle of items must not learn those items into its background.
//
// The reference is stored already reduced, grayscaled and blurred. Frames wider
// than `process_width` are shrunk by an integer factor and the blur kernel is
// shrunk with them, so the blur covers the same part of the scene at any
// resolution. `prepare` runs a live frame through exactly the same steps, so a
// difference between the two is a difference in the scene, not in processing.

use crate::core_modules::camera::Camera;
use crate::core_modules::frame_ops::{self, DEFAULT_PROCESS_WIDTH, GaussianKernel};
use crate::error::{Result, SenseError};
use chrono::{DateTime, Utc};
use image::{GrayImage, RgbImage};
use log::info;

#[derive(Debug, Clone)]
pub struct BackgroundModel {
    reference: GrayImage,
    kernel: GaussianKernel,
    work_kernel: GaussianKernel,
    process_width: u32,
    scale: u32,
    frame_size: (u32, u32),
    captured_at: DateTime<Utc>,
}

impl BackgroundModel {
    pub fn from_frame(frame: &RgbImage, kernel: GaussianKernel) -> Self {
        Self::with_process_width(frame, kernel, DEFAULT_PROCESS_WIDTH)
    }

    pub fn with_process_width(frame: &RgbImage, kernel: GaussianKernel, process_width: u32) -> Self {
        let scale = frame_ops::downscale_factor(frame.width(), process_width);
        let work_kernel = kernel.scaled(scale);
        let reference = work_kernel.blur(&frame_ops::downscale_gray(frame, scale));
        Self {
            reference,
            kernel,
            work_kernel,
            process_width,
            scale,
            frame_size: frame.dimensions(),
            captured_at: Utc::now(),
        }
    }

    /// Grabs one frame of the empty scene and builds a model from it.
    pub fn capture_reference<C: Camera + ?Sized>(
        camera: &mut C,
        kernel: GaussianKernel,
        process_width: u32,
    ) -> Result<Self> {
        let frame = camera.capture()?;
        let model = Self::with_process_width(&frame, kernel, process_width);
        info!(
            "captured background reference {}x{} (processed at {}x{}, 1/{})",
            model.frame_size.0,
            model.frame_size.1,
            model.reference.width(),
            model.reference.height(),
            model.scale
        );
        Ok(model)
    }

    pub fn recapture<C: Camera + ?Sized>(&mut self, camera: &mut C) -> Result<()> {
        *self = Self::capture_reference(camera, self.kernel.clone(), self.process_width)?;
        Ok(())
    }

    /// The processed reference, at `1 / scale()` of the camera resolution.
    pub fn reference(&self) -> &GrayImage {
        &self.reference
    }

    pub fn kernel(&self) -> &GaussianKernel {
        &self.kernel
    }

    /// Linear shrink factor between camera frames and processed frames.
    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn frame_size(&self) -> (u32, u32) {
        self.frame_size
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Reduce, grayscale and blur a live frame the way the reference was.
    pub fn prepare(&self, frame: &RgbImage) -> Result<GrayImage> {
        if frame.dimensions() != self.frame_size {
            return Err(SenseError::Camera(format!(
                "frame size {:?} does not match reference {:?}",
                frame.dimensions(),
                self.frame_size
            )));
        }
        Ok(self.work_kernel.blur(&frame_ops::downscale_gray(frame, self.scale)))
    }

    /// Per-pixel absolute difference between a live frame and the reference.
    pub fn difference(&self, frame: &RgbImage) -> Result<GrayImage> {
        frame_ops::abs_diff(&self.prepare(frame)?, &self.reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::camera::tests::{solid, ScriptedCamera};
    use crate::core_modules::clock::ManualClock;
    use std::time::Duration;

    #[test]
    fn identical_scene_has_zero_difference() {
        let model = BackgroundModel::from_frame(&solid(16, 12, 90), GaussianKernel::new(5).unwrap());
        let diff = model.difference(&solid(16, 12, 90)).unwrap();
        assert!(diff.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn recapture_replaces_reference() {
        let mut camera = ScriptedCamera::new(
            vec![solid(8, 8, 20), solid(8, 8, 200)],
            solid(8, 8, 0),
            ManualClock::new(),
            Duration::from_millis(33),
        );
        let kernel = GaussianKernel::new(3).unwrap();
        let mut model = BackgroundModel::capture_reference(&mut camera, kernel, DEFAULT_PROCESS_WIDTH).unwrap();
        assert_eq!(model.reference().get_pixel(0, 0)[0], 20);

        model.recapture(&mut camera).unwrap();
        assert_eq!(model.reference().get_pixel(0, 0)[0], 200);
        assert_eq!(model.kernel().size(), 3);
    }

    #[test]
    fn wide_frames_are_processed_smaller() {
        let model = BackgroundModel::from_frame(&solid(1920, 1080, 60), GaussianKernel::new(21).unwrap());
        assert_eq!(model.scale(), 3);
        assert_eq!(model.reference().dimensions(), (640, 360));
        assert_eq!(model.kernel().size(), 21);
        assert!(model.reference().pixels().all(|p| p[0] == 60));
    }

    #[test]
    fn mismatched_frame_is_rejected() {
        let model = BackgroundModel::from_frame(&solid(16, 12, 90), GaussianKernel::new(5).unwrap());
        assert!(matches!(model.difference(&solid(12, 16, 90)), Err(SenseError::Camera(_))));
    }
}
