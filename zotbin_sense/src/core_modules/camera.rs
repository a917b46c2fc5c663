// THEORY:
// `Camera` is the seam between the vision logic and whatever produces frames.
// A capture either yields a full RGB frame or fails; there is no partial frame.
// The device behind it is owned by exactly one vision worker at a time.
//
// The live source is `DeviceCamera` (behind the `live-camera` feature).
// `ReplayCamera` plays back a directory of still images in file-name order. It
// is how a recorded transit is re-run on a desk, and how the rig exercises the
// whole capture path without a sensor attached. Once the recording runs out it
// keeps returning the last frame, the same as a camera watching a still scene.
// With a `ManualClock` attached, each capture advances that clock by the frame
// interval instead of sleeping, so a ten second window replays instantly.

use crate::core_modules::clock::ManualClock;
use crate::error::{Result, SenseError};
use image::RgbImage;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::time::Duration;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "ppm"];

pub trait Camera {
    fn capture(&mut self) -> Result<RgbImage>;

    /// Releases the device. Captures after close are errors.
    fn close(&mut self) {}
}

impl<C: Camera + ?Sized> Camera for Box<C> {
    fn capture(&mut self) -> Result<RgbImage> {
        (**self).capture()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

pub type BoxedCamera = Box<dyn Camera + Send>;

pub struct ReplayCamera {
    frames: Vec<PathBuf>,
    next: usize,
    last: Option<RgbImage>,
    interval: Duration,
    clock: Option<ManualClock>,
    closed: bool,
}

impl ReplayCamera {
    /// Lists the images in `dir`. `interval` is slept before each capture.
    pub fn open(dir: &Path, interval: Duration) -> Result<Self> {
        let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| SenseError::Camera(format!("cannot open {}: {e}", dir.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        frames.sort();
        if frames.is_empty() {
            return Err(SenseError::Camera(format!("no images in {}", dir.display())));
        }
        info!("replaying {} frames from {}", frames.len(), dir.display());
        Ok(Self {
            frames,
            next: 0,
            last: None,
            interval,
            clock: None,
            closed: false,
        })
    }

    /// Drives `clock` forward by the frame interval per capture, without sleeping.
    pub fn simulated(mut self, clock: ManualClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn exhausted(&self) -> bool {
        self.next >= self.frames.len()
    }
}

impl Camera for ReplayCamera {
    fn capture(&mut self) -> Result<RgbImage> {
        if self.closed {
            return Err(SenseError::Camera("camera is closed".into()));
        }
        match &self.clock {
            Some(clock) => clock.advance(self.interval),
            None if !self.interval.is_zero() => std::thread::sleep(self.interval),
            None => {}
        }
        if let Some(path) = self.frames.get(self.next) {
            let frame = image::open(path)
                .map_err(|e| SenseError::Camera(format!("cannot decode {}: {e}", path.display())))?
                .to_rgb8();
            debug!("replay frame {} ({})", self.next, path.display());
            self.next += 1;
            self.last = Some(frame.clone());
            return Ok(frame);
        }
        self.last
            .clone()
            .ok_or_else(|| SenseError::Camera("replay has no frames".into()))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core_modules::clock::Clock;
    use image::Rgb;
    use std::collections::VecDeque;

    /// Plays a fixed list of frames and advances a shared clock per capture.
    pub(crate) struct ScriptedCamera {
        pub frames: VecDeque<RgbImage>,
        pub fallback: RgbImage,
        pub clock: ManualClock,
        pub step: Duration,
        pub captures: usize,
    }

    impl ScriptedCamera {
        pub(crate) fn new(frames: Vec<RgbImage>, fallback: RgbImage, clock: ManualClock, step: Duration) -> Self {
            Self {
                frames: frames.into(),
                fallback,
                clock,
                step,
                captures: 0,
            }
        }
    }

    impl Camera for ScriptedCamera {
        fn capture(&mut self) -> Result<RgbImage> {
            self.clock.advance(self.step);
            self.captures += 1;
            Ok(self.frames.pop_front().unwrap_or_else(|| self.fallback.clone()))
        }
    }

    pub(crate) fn solid(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([value, value, value]))
    }

    #[test]
    fn replay_plays_in_name_order_then_holds() {
        let dir = tempfile::tempdir().unwrap();
        solid(4, 4, 30).save(dir.path().join("frame_002.png")).unwrap();
        solid(4, 4, 10).save(dir.path().join("frame_001.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut camera = ReplayCamera::open(dir.path(), Duration::ZERO).unwrap();
        assert_eq!(camera.len(), 2);
        assert_eq!(camera.capture().unwrap().get_pixel(0, 0)[0], 10);
        assert_eq!(camera.capture().unwrap().get_pixel(0, 0)[0], 30);
        assert!(camera.exhausted());
        assert_eq!(camera.capture().unwrap().get_pixel(0, 0)[0], 30);

        camera.close();
        assert!(matches!(camera.capture(), Err(SenseError::Camera(_))));
    }

    #[test]
    fn simulated_replay_advances_the_clock() {
        let dir = tempfile::tempdir().unwrap();
        solid(4, 4, 10).save(dir.path().join("a.png")).unwrap();
        let clock = ManualClock::new();
        let mut camera = ReplayCamera::open(dir.path(), Duration::from_millis(40))
            .unwrap()
            .simulated(clock.clone());
        camera.capture().unwrap();
        camera.capture().unwrap();
        assert_eq!(clock.now(), Duration::from_millis(80));
    }

    #[test]
    fn empty_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ReplayCamera::open(dir.path(), Duration::ZERO).is_err());
    }
}
