// THEORY:
// Given a closed transit, `selection` picks the one frame that represents it.
//
// The default is the frame nearest the middle of the transit: an object sliding
// down a chute is most fully in view about halfway through, well clear of the
// motion blur at the edges of the frame. Ties go to the earlier frame.
//
// `MidpointPolicy::LegacySqrt2` reproduces an older target that divided the
// transit span by √2 instead of 2; it lands later in the transit and is kept
// only so recorded results from deployed bins can be reproduced.
//
// `SelectionStrategy::Sharpest` ignores timing and takes the frame with the
// highest Laplacian variance, which suits slow drops where blur matters more
// than position.

use crate::core_modules::frame_ops;
use crate::core_modules::transit::TimedFrame;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MidpointPolicy {
    #[default]
    True,
    LegacySqrt2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    Midpoint,
    Sharpest,
}

pub fn target_time(enter: Duration, exit: Duration, policy: MidpointPolicy) -> Duration {
    let span = exit.saturating_sub(enter);
    match policy {
        MidpointPolicy::True => enter + span / 2,
        MidpointPolicy::LegacySqrt2 => enter + span.div_f64(std::f64::consts::SQRT_2),
    }
}

/// Index of the frame closest to `target`. Earliest wins a tie.
pub fn nearest_index<F>(frames: &[TimedFrame<F>], target: Duration) -> Option<usize> {
    let mut best: Option<(usize, Duration)> = None;
    for (i, frame) in frames.iter().enumerate() {
        let distance = frame.timestamp.abs_diff(target);
        if best.is_none_or(|(_, d)| distance < d) {
            best = Some((i, distance));
        }
    }
    best.map(|(i, _)| i)
}

pub fn select_with_policy<F>(
    frames: &[TimedFrame<F>],
    enter: Duration,
    exit: Duration,
    policy: MidpointPolicy,
) -> Option<&TimedFrame<F>> {
    nearest_index(frames, target_time(enter, exit, policy)).map(|i| &frames[i])
}

/// The frame nearest the true midpoint of `[enter, exit]`.
pub fn select_representative<F>(frames: &[TimedFrame<F>], enter: Duration, exit: Duration) -> Option<&TimedFrame<F>> {
    select_with_policy(frames, enter, exit, MidpointPolicy::True)
}

/// Variance of the 4-neighbor Laplacian. Higher is sharper.
pub fn sharpness(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }
    let px = |x: u32, y: u32| gray.get_pixel(x, y)[0] as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0.0;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
            n += 1.0;
        }
    }
    let mean = sum / n;
    sum_sq / n - mean * mean
}

/// Index of the sharpest frame. Earliest wins a tie.
pub fn sharpest_index(frames: &[TimedFrame<RgbImage>]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, frame) in frames.iter().enumerate() {
        let score = sharpness(&frame_ops::to_gray(&frame.image));
        if best.is_none_or(|(_, s)| score > s) {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i)
}

impl SelectionStrategy {
    pub fn pick(
        self,
        frames: &[TimedFrame<RgbImage>],
        enter: Duration,
        exit: Duration,
        policy: MidpointPolicy,
    ) -> Option<usize> {
        match self {
            SelectionStrategy::Midpoint => nearest_index(frames, target_time(enter, exit, policy)),
            SelectionStrategy::Sharpest => sharpest_index(frames),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    fn frames_at(secs: &[f64]) -> Vec<TimedFrame<f64>> {
        secs.iter()
            .map(|s| TimedFrame {
                timestamp: Duration::from_secs_f64(*s),
                image: *s,
            })
            .collect()
    }

    fn secs(v: f64) -> Duration {
        Duration::from_secs_f64(v)
    }

    #[test]
    fn picks_frame_nearest_true_midpoint() {
        let frames = frames_at(&[1.2, 2.0, 2.9]);
        let chosen = select_representative(&frames, secs(1.0), secs(3.0)).unwrap();
        assert_eq!(chosen.image, 2.0);
    }

    #[test]
    fn ties_go_to_the_earlier_frame() {
        let frames = frames_at(&[1.5, 2.5]);
        let chosen = select_representative(&frames, secs(1.0), secs(3.0)).unwrap();
        assert_eq!(chosen.image, 1.5);
    }

    #[test]
    fn legacy_policy_lands_later() {
        let frames = frames_at(&[1.2, 2.0, 2.6]);
        let enter = secs(1.0);
        let exit = secs(3.0);
        assert_eq!(select_with_policy(&frames, enter, exit, MidpointPolicy::True).unwrap().image, 2.0);
        assert_eq!(
            select_with_policy(&frames, enter, exit, MidpointPolicy::LegacySqrt2).unwrap().image,
            2.6
        );
    }

    #[test]
    fn single_frame_transit() {
        let frames = frames_at(&[4.0]);
        let chosen = select_representative(&frames, secs(4.0), secs(4.0)).unwrap();
        assert_eq!(chosen.image, 4.0);
        assert!(select_representative::<f64>(&[], secs(0.0), secs(1.0)).is_none());
    }

    #[test]
    fn sharpness_prefers_edges() {
        let flat = GrayImage::from_pixel(10, 10, Luma([100]));
        let checker = GrayImage::from_fn(10, 10, |x, y| Luma([if (x + y) % 2 == 0 { 0 } else { 255 }]));
        assert_eq!(sharpness(&flat), 0.0);
        assert!(sharpness(&checker) > 1000.0);
    }

    #[test]
    fn sharpest_strategy_ignores_timing() {
        let blurry = RgbImage::from_pixel(8, 8, Rgb([90, 90, 90]));
        let crisp = RgbImage::from_fn(8, 8, |x, _| if x % 2 == 0 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) });
        let frames = vec![
            TimedFrame { timestamp: secs(1.0), image: crisp },
            TimedFrame { timestamp: secs(2.0), image: blurry },
        ];
        let picked = SelectionStrategy::Sharpest.pick(&frames, secs(1.0), secs(3.0), MidpointPolicy::True);
        assert_eq!(picked, Some(0));
        let picked = SelectionStrategy::Midpoint.pick(&frames, secs(1.0), secs(3.0), MidpointPolicy::True);
        assert_eq!(picked, Some(1));
    }
}
