// THEORY:
// `capture_transit` runs one detection window end to end: it pulls frames from
// the camera, skips the ignore period while the lid or trigger settles, feeds
// presence answers into a `TransitTracker`, and, once the transit has closed,
// picks a representative frame.
//
// The window always ends. It stops early when the tracker reaches a terminal
// state, and otherwise at the deadline, where an open transit is closed at its
// last present frame. A frame that lands on or past the deadline is never
// evaluated. All timing goes through the injected `Clock`.

use crate::core_modules::camera::Camera;
use crate::core_modules::clock::Clock;
use crate::core_modules::presence::PresenceDetector;
use crate::core_modules::selection::{MidpointPolicy, SelectionStrategy};
use crate::core_modules::transit::{DEFAULT_EXIT_GRACE, TimedFrame, TransitEnd, TransitTracker};
use crate::error::Result;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureParams {
    pub window: Duration,
    pub ignore_period: Duration,
    pub exit_grace: Duration,
    pub strategy: SelectionStrategy,
    pub midpoint: MidpointPolicy,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            ignore_period: Duration::from_secs(2),
            exit_grace: DEFAULT_EXIT_GRACE,
            strategy: SelectionStrategy::default(),
            midpoint: MidpointPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub selected: TimedFrame,
    pub enter_time: Duration,
    pub exit_time: Duration,
    pub ended_by: TransitEnd,
    /// Frames in which the object was present.
    pub frames_in_transit: usize,
    pub window_started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    Detected(DetectionResult),
    NoDetection,
}

impl CaptureOutcome {
    pub fn detection(&self) -> Option<&DetectionResult> {
        match self {
            CaptureOutcome::Detected(result) => Some(result),
            CaptureOutcome::NoDetection => None,
        }
    }
}

pub fn capture_transit<C, K>(
    camera: &mut C,
    detector: &PresenceDetector,
    clock: &K,
    params: &CaptureParams,
) -> Result<CaptureOutcome>
where
    C: Camera + ?Sized,
    K: Clock + ?Sized,
{
    let window_started_at = Utc::now();
    let start = clock.now();
    let mut tracker = TransitTracker::new(params.exit_grace);
    let mut frames_seen = 0usize;

    loop {
        if clock.now().saturating_sub(start) >= params.window {
            tracker.expire();
            break;
        }
        let image = camera.capture()?;
        let timestamp = clock.now().saturating_sub(start);
        frames_seen += 1;
        if timestamp >= params.window {
            tracker.expire();
            break;
        }
        if timestamp < params.ignore_period {
            continue;
        }
        let present = detector.is_present(&image)?;
        if tracker.observe(timestamp, present, image).is_terminal() {
            break;
        }
    }

    let Some(transit) = tracker.finish() else {
        info!("no detection in {frames_seen} frames");
        return Ok(CaptureOutcome::NoDetection);
    };

    let frames_in_transit = transit.frames.len();
    let Some(index) = params
        .strategy
        .pick(&transit.frames, transit.enter_time, transit.exit_time, params.midpoint)
    else {
        return Ok(CaptureOutcome::NoDetection);
    };
    let Some(selected) = transit.frames.into_iter().nth(index) else {
        return Ok(CaptureOutcome::NoDetection);
    };

    debug!(
        "selected frame at {:.3}s of {frames_in_transit} in transit",
        selected.timestamp.as_secs_f64()
    );
    info!(
        "transit {:.3}s..{:.3}s ({:?})",
        transit.enter_time.as_secs_f64(),
        transit.exit_time.as_secs_f64(),
        transit.ended_by
    );
    Ok(CaptureOutcome::Detected(DetectionResult {
        selected,
        enter_time: transit.enter_time,
        exit_time: transit.exit_time,
        ended_by: transit.ended_by,
        frames_in_transit,
        window_started_at,
    }))
}
