// THEORY:
// The `transit` module gives the per-frame presence answers a memory. It turns a
// stream of (time, present?) observations into at most one transit: the span
// during which an object was in view, together with every frame it was seen in.
//
// Lifecycle of a `TransitTracker`:
// - **Idle**: nothing seen yet. The first present frame opens the transit and
//   fixes `enter_time`.
// - **Tracking**: present frames are appended and refresh `last_seen`. Absent
//   frames are dropped. An object that flickers out for less than `exit_grace`
//   is still the same object.
// - **Exited**: an absent frame arrived more than `exit_grace` after the last
//   present one. `exit_time` is the last time the object was actually seen.
// - **Expired**: the window deadline hit while still tracking. The transit is
//   closed at its last present frame.
//
// Exited and Expired are terminal; later observations are ignored. Timestamps
// are non-decreasing offsets from the start of the capture window.

use image::RgbImage;
use log::debug;
use std::time::Duration;

pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_millis(300);

/// A frame and when it was captured, relative to the window start.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedFrame<F = RgbImage> {
    pub timestamp: Duration,
    pub image: F,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitState {
    Idle,
    Tracking,
    Exited,
    Expired,
}

impl TransitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransitState::Exited | TransitState::Expired)
    }
}

/// How a closed transit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitEnd {
    Exited,
    Expired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitRecord<F = RgbImage> {
    pub enter_time: Duration,
    pub last_seen: Duration,
    pub frames: Vec<TimedFrame<F>>,
}

/// A transit that has been closed, one way or the other.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTransit<F = RgbImage> {
    pub enter_time: Duration,
    pub exit_time: Duration,
    pub ended_by: TransitEnd,
    pub frames: Vec<TimedFrame<F>>,
}

pub struct TransitTracker<F = RgbImage> {
    state: TransitState,
    record: Option<TransitRecord<F>>,
    exit_grace: Duration,
}

impl<F> TransitTracker<F> {
    pub fn new(exit_grace: Duration) -> Self {
        Self {
            state: TransitState::Idle,
            record: None,
            exit_grace,
        }
    }

    pub fn state(&self) -> TransitState {
        self.state
    }

    pub fn record(&self) -> Option<&TransitRecord<F>> {
        self.record.as_ref()
    }

    /// Feeds one frame's presence answer. `frame` is kept only when present.
    pub fn observe(&mut self, timestamp: Duration, present: bool, frame: F) -> TransitState {
        match (self.state, present) {
            (TransitState::Idle, true) => {
                debug!("transit entered at {:.3}s", timestamp.as_secs_f64());
                self.record = Some(TransitRecord {
                    enter_time: timestamp,
                    last_seen: timestamp,
                    frames: vec![TimedFrame { timestamp, image: frame }],
                });
                self.state = TransitState::Tracking;
            }
            (TransitState::Tracking, true) => {
                if let Some(record) = self.record.as_mut() {
                    record.last_seen = timestamp;
                    record.frames.push(TimedFrame { timestamp, image: frame });
                }
            }
            (TransitState::Tracking, false) => {
                let last_seen = self.record.as_ref().map_or(timestamp, |r| r.last_seen);
                if timestamp.saturating_sub(last_seen) > self.exit_grace {
                    debug!("transit exited, last seen {:.3}s", last_seen.as_secs_f64());
                    self.state = TransitState::Exited;
                }
            }
            _ => {}
        }
        self.state
    }

    /// Called when the window deadline passes.
    pub fn expire(&mut self) -> TransitState {
        if self.state == TransitState::Tracking {
            debug!("transit still open at deadline, closing at last present frame");
            self.state = TransitState::Expired;
        }
        self.state
    }

    /// Closes out the tracker. `None` when nothing was ever present.
    pub fn finish(self) -> Option<CompletedTransit<F>> {
        let ended_by = match self.state {
            TransitState::Idle => return None,
            TransitState::Exited => TransitEnd::Exited,
            TransitState::Tracking | TransitState::Expired => TransitEnd::Expired,
        };
        let record = self.record?;
        Some(CompletedTransit {
            enter_time: record.enter_time,
            exit_time: record.last_seen,
            ended_by,
            frames: record.frames,
        })
    }
}
