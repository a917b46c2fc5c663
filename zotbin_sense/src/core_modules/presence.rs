// THEORY:
// The `PresenceDetector` answers one question per frame: is there something in
// the chute right now? It is a pure function of the frame and the background.
//
// Steps:
// 1.  blur the frame and difference it against the background reference;
// 2.  threshold the difference into a binary motion mask;
// 3.  dilate the mask so a textured object does not fall apart into specks;
// 4.  measure connected regions and report presence when any one of them
//     exceeds `min_area`. Many small regions never add up to an object.
//
// The work happens on the background model's reduced frame. Areas are
// reported back in camera pixels, so `min_area` means the same thing at any
// processing width.

use crate::core_modules::background::BackgroundModel;
use crate::core_modules::camera::Camera;
use crate::core_modules::frame_ops;
use crate::core_modules::regions::region_finder;
use crate::error::Result;
use image::RgbImage;
use log::trace;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionParams {
    /// Per-pixel difference that counts as change.
    pub diff_threshold: u8,
    /// Rounds of 3×3 dilation on the motion mask.
    pub dilate_iterations: u32,
    /// A region must be larger than this, in camera pixels, to count as an object.
    pub min_area: usize,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            diff_threshold: 25,
            dilate_iterations: 2,
            min_area: 2000,
        }
    }
}

/// What the detector saw in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceReading {
    pub present: bool,
    /// In camera pixels.
    pub largest_area: usize,
}

pub struct PresenceDetector {
    background: BackgroundModel,
    params: DetectionParams,
}

impl PresenceDetector {
    pub fn new(background: BackgroundModel, params: DetectionParams) -> Self {
        Self { background, params }
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    pub fn background(&self) -> &BackgroundModel {
        &self.background
    }

    pub fn recapture_background<C: Camera + ?Sized>(&mut self, camera: &mut C) -> Result<()> {
        self.background.recapture(camera)
    }

    pub fn evaluate(&self, frame: &RgbImage) -> Result<PresenceReading> {
        let diff = self.background.difference(frame)?;
        let mask = frame_ops::threshold(&diff, self.params.diff_threshold);
        let mask = frame_ops::dilate(&mask, self.params.dilate_iterations);
        let scale = self.background.scale() as usize;
        let largest_area = region_finder::largest_area(&mask) * scale * scale;
        trace!("largest motion region {largest_area}px");
        Ok(PresenceReading {
            present: largest_area > self.params.min_area,
            largest_area,
        })
    }

    pub fn is_present(&self, frame: &RgbImage) -> Result<bool> {
        Ok(self.evaluate(frame)?.present)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core_modules::camera::tests::solid;
    use crate::core_modules::frame_ops::{DEFAULT_BLUR_KERNEL, GaussianKernel};
    use crate::core_modules::transit::DEFAULT_EXIT_GRACE;
    use image::Rgb;
    use std::time::Instant;

    pub(crate) const WIDTH: u32 = 64;
    pub(crate) const HEIGHT: u32 = 48;

    pub(crate) fn empty_scene() -> RgbImage {
        solid(WIDTH, HEIGHT, 40)
    }

    /// The empty scene with a bright square of side `side` in the middle.
    pub(crate) fn scene_with_object(side: u32) -> RgbImage {
        let mut frame = empty_scene();
        let x0 = (WIDTH - side) / 2;
        let y0 = (HEIGHT - side) / 2;
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                frame.put_pixel(x, y, Rgb([230, 230, 230]));
            }
        }
        frame
    }

    pub(crate) fn detector(min_area: usize) -> PresenceDetector {
        let background = BackgroundModel::from_frame(&empty_scene(), GaussianKernel::new(3).unwrap());
        PresenceDetector::new(
            background,
            DetectionParams {
                min_area,
                ..DetectionParams::default()
            },
        )
    }

    #[test]
    fn empty_scene_is_absent() {
        let reading = detector(100).evaluate(&empty_scene()).unwrap();
        assert_eq!(reading, PresenceReading { present: false, largest_area: 0 });
    }

    #[test]
    fn large_object_is_present() {
        let reading = detector(100).evaluate(&scene_with_object(16)).unwrap();
        assert!(reading.present);
        assert!(reading.largest_area >= 16 * 16, "{}", reading.largest_area);
    }

    #[test]
    fn object_below_min_area_is_ignored() {
        assert!(!detector(2000).is_present(&scene_with_object(6)).unwrap());
    }

    #[test]
    fn scattered_specks_do_not_sum_up() {
        let mut frame = empty_scene();
        for (x, y) in [(5, 5), (30, 5), (55, 5), (5, 40), (30, 40), (55, 40)] {
            frame.put_pixel(x, y, Rgb([255, 255, 255]));
            frame.put_pixel(x + 1, y, Rgb([255, 255, 255]));
        }
        let reading = detector(100).evaluate(&frame).unwrap();
        assert!(!reading.present, "{reading:?}");
    }

    #[test]
    fn full_hd_frame_is_judged_within_the_exit_grace() {
        let reference = solid(1920, 1080, 40);
        let mut frame = reference.clone();
        for y in 390..690 {
            for x in 810..1110 {
                frame.put_pixel(x, y, Rgb([230, 230, 230]));
            }
        }
        let background = BackgroundModel::from_frame(&reference, GaussianKernel::new(DEFAULT_BLUR_KERNEL).unwrap());
        let detector = PresenceDetector::new(background, DetectionParams::default());

        detector.evaluate(&reference).unwrap();
        let started = Instant::now();
        let reading = detector.evaluate(&frame).unwrap();
        let elapsed = started.elapsed();

        assert!(reading.present);
        assert!((90_000..140_000).contains(&reading.largest_area), "{}", reading.largest_area);
        // debug builds run several times slower
        let budget = if cfg!(debug_assertions) {
            DEFAULT_EXIT_GRACE * 4
        } else {
            DEFAULT_EXIT_GRACE / 3
        };
        assert!(elapsed < budget, "evaluate took {elapsed:?}");
    }
}
