// THEORY:
// `WeightSensor` is the acquisition and calibration engine. It owns a raw sample
// source (normally the HX711 driver), the in-memory `Calibration`, and the store
// that persists it. It is the only thing allowed to mutate calibration, and it
// only does so through `tare` and `calibrate_with_known_weight`.
//
// A calibration change is written to disk before it is committed to memory, so
// what the process uses and what the next process will load never disagree.
// Gram reads refuse to run without a scale: a meaningless ratio is worse than an
// error for anything downstream that bills or alerts on weight.

use crate::core_modules::calibration::{Calibration, CalibrationStore};
use crate::core_modules::hx711::RawSample;
use crate::core_modules::sampler::{self, OutlierPolicy, RawSampleSource, WindowStats};
use crate::error::{Result, SenseError};
use log::{debug, info, warn};
use std::time::{Duration, Instant};

const AVG_MIN_ATTEMPTS: usize = 30;
const AVG_ATTEMPTS_PER_SAMPLE: usize = 6;
const WINDOW_MIN_ATTEMPTS: usize = 200;
const WINDOW_ATTEMPTS_PER_SAMPLE: usize = 10;
const STABILITY_RETRY_DELAY: Duration = Duration::from_millis(200);
const WARMUP_RETRY_DELAY: Duration = Duration::from_millis(50);
const WARMUP_SAMPLES: usize = 5;

pub const TARE_SETTLE: Duration = Duration::from_millis(5);
pub const READ_SETTLE: Duration = Duration::from_millis(2);

pub struct WeightSensor<S: RawSampleSource> {
    source: S,
    calibration: Calibration,
    store: CalibrationStore,
    policy: OutlierPolicy,
}

impl<S: RawSampleSource> WeightSensor<S> {
    /// Wraps `source` and loads any stored calibration.
    pub fn new(source: S, store: CalibrationStore, policy: OutlierPolicy) -> Self {
        let mut calibration = Calibration::default();
        if store.load_into(&mut calibration) {
            info!(
                "loaded calibration offset={:.2} scale={:.6} from {}",
                calibration.offset,
                calibration.scale,
                store.path().display()
            );
        }
        Self {
            source,
            calibration,
            store,
            policy,
        }
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn store(&self) -> &CalibrationStore {
        &self.store
    }

    /// Re-reads the store. A bad file leaves the current values in place.
    pub fn reload_calibration(&mut self) -> bool {
        self.store.load_into(&mut self.calibration)
    }

    pub fn read_raw_samples(
        &mut self,
        target: usize,
        max_attempts: usize,
        settle: Duration,
    ) -> Result<Vec<RawSample>> {
        sampler::read_raw_samples(&mut self.source, target, max_attempts, settle)
    }

    /// Robust average of a fresh window of `samples` conversions.
    pub fn read_raw_avg(&mut self, samples: usize, settle: Duration) -> Result<f64> {
        if samples == 0 {
            return Err(SenseError::InvalidArgument("samples must be > 0".into()));
        }
        let max_attempts = (samples * AVG_ATTEMPTS_PER_SAMPLE).max(AVG_MIN_ATTEMPTS);
        let values = self.read_raw_samples(samples, max_attempts, settle)?;
        sampler::robust_mean(&values, &self.policy).ok_or(SenseError::InsufficientSamples {
            wanted: samples,
            got: 0,
        })
    }

    fn commit(&mut self, mut next: Calibration) -> Result<()> {
        next.updated_at = chrono::Utc::now().timestamp();
        self.store.save(&next)?;
        self.calibration = next;
        Ok(())
    }

    /// Zeroes the scale at the current load.
    pub fn tare(&mut self, samples: usize) -> Result<()> {
        let offset = self.read_raw_avg(samples, TARE_SETTLE)?;
        self.commit(Calibration {
            offset,
            ..self.calibration
        })?;
        info!("tare complete, offset={offset:.2}");
        Ok(())
    }

    /// Derives the scale from a known mass resting on the platform.
    pub fn calibrate_with_known_weight(
        &mut self,
        known_grams: f64,
        samples: usize,
        min_delta_raw: f64,
    ) -> Result<()> {
        if !(known_grams > 0.0) || !known_grams.is_finite() {
            return Err(SenseError::InvalidArgument(format!(
                "known_grams must be > 0 (got {known_grams})"
            )));
        }

        let loaded = self.read_raw_avg(samples, TARE_SETTLE)?;
        let delta = loaded - self.calibration.offset;
        if delta.abs() < min_delta_raw {
            return Err(SenseError::Calibration(format!(
                "signal too small (|delta|={:.1} < {min_delta_raw:.1}); check mechanics/wiring or use a heavier weight",
                delta.abs()
            )));
        }

        let scale = delta / known_grams;
        if scale == 0.0 || !scale.is_finite() {
            return Err(SenseError::Calibration(format!("invalid scale computed ({scale})")));
        }

        self.commit(Calibration {
            scale,
            ..self.calibration
        })?;
        info!("calibration complete, scale={scale:.6} raw/g");
        Ok(())
    }

    pub fn read_grams(&mut self, samples: usize) -> Result<f64> {
        if !self.calibration.is_calibrated() {
            return Err(SenseError::Calibration(format!(
                "missing calibration (scale={})",
                self.calibration.scale
            )));
        }
        let raw = self.read_raw_avg(samples, READ_SETTLE)?;
        let grams = (raw - self.calibration.offset) / self.calibration.scale;
        debug!("raw={raw:.1} grams={grams:.2}");
        Ok(grams)
    }

    /// Min/max/mean of one plain window, with a generous attempt budget.
    pub fn read_window(&mut self, samples: usize, settle: Duration) -> Result<WindowStats> {
        let max_attempts = (samples * WINDOW_ATTEMPTS_PER_SAMPLE).max(WINDOW_MIN_ATTEMPTS);
        let values = self.read_raw_samples(samples, max_attempts, settle)?;
        WindowStats::from_samples(&values).ok_or(SenseError::InsufficientSamples {
            wanted: samples,
            got: 0,
        })
    }

    /// Blocks until a window's span is within `span_raw`, or `timeout` passes.
    pub fn wait_for_stability(
        &mut self,
        window_samples: usize,
        span_raw: f64,
        settle: Duration,
        timeout: Duration,
    ) -> Result<WindowStats> {
        let start = Instant::now();
        let mut last: Option<WindowStats> = None;
        while start.elapsed() < timeout {
            let stats = self.read_window(window_samples, settle)?;
            if stats.span() <= span_raw {
                return Ok(stats);
            }
            debug!("waiting for stability, span={:.1}", stats.span());
            last = Some(stats);
            std::thread::sleep(STABILITY_RETRY_DELAY);
        }
        Err(SenseError::Calibration(match last {
            Some(stats) => format!("signal not stable (span_raw={:.1})", stats.span()),
            None => "signal not stable (span_raw=n/a)".into(),
        }))
    }

    /// Exercises the line until it produces data. Returns the number of
    /// successful warm-up reads; fails only when none succeed.
    pub fn warmup(&mut self, attempts: usize, settle: Duration) -> Result<usize> {
        let mut ok = 0;
        let mut last_err = None;
        for _ in 0..attempts {
            match self.read_raw_avg(WARMUP_SAMPLES, settle) {
                Ok(_) => ok += 1,
                Err(err @ SenseError::InsufficientSamples { .. }) => last_err = Some(err),
                Err(err) if err.is_transient() => last_err = Some(err),
                Err(err) => return Err(err),
            }
            std::thread::sleep(WARMUP_RETRY_DELAY);
        }
        if ok == 0 {
            warn!("no successful reads during warmup");
            return Err(last_err.unwrap_or(SenseError::InsufficientSamples {
                wanted: WARMUP_SAMPLES,
                got: 0,
            }));
        }
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::sampler::tests::ScriptedSource;
    use tempfile::TempDir;

    fn sensor(source: ScriptedSource) -> (TempDir, WeightSensor<ScriptedSource>) {
        let root = tempfile::tempdir().unwrap();
        let store = CalibrationStore::for_bin(root.path(), "zotbin-1");
        (root, WeightSensor::new(source, store, OutlierPolicy::default()))
    }

    fn feed(sensor: &mut WeightSensor<ScriptedSource>, value: RawSample, count: usize) {
        sensor.source = ScriptedSource::constant(value, count);
    }

    #[test]
    fn calibrate_then_read_recovers_known_weight() {
        let (_root, mut ws) = sensor(ScriptedSource::constant(1000, 10));
        ws.tare(10).unwrap();
        assert_eq!(ws.calibration().offset, 1000.0);

        feed(&mut ws, 51_000, 10);
        ws.calibrate_with_known_weight(500.0, 10, 5000.0).unwrap();
        assert_eq!(ws.calibration().scale, 100.0);

        feed(&mut ws, 1000 + 100 * 237, 12);
        let grams = ws.read_grams(12).unwrap();
        assert!((grams - 237.0).abs() < 1e-9, "{grams}");
    }

    #[test]
    fn calibration_is_persisted_after_each_mutation() {
        let (root, mut ws) = sensor(ScriptedSource::constant(1000, 10));
        ws.tare(10).unwrap();
        feed(&mut ws, 51_000, 10);
        ws.calibrate_with_known_weight(500.0, 10, 5000.0).unwrap();

        let reopened = WeightSensor::new(
            ScriptedSource::new(vec![]),
            CalibrationStore::for_bin(root.path(), "zotbin-1"),
            OutlierPolicy::default(),
        );
        assert_eq!(reopened.calibration().offset, 1000.0);
        assert_eq!(reopened.calibration().scale, 100.0);
        assert!(reopened.calibration().updated_at > 0);
    }

    #[test]
    fn uncalibrated_read_fails_loudly() {
        let (_root, mut ws) = sensor(ScriptedSource::constant(1000, 10));
        assert!(matches!(ws.read_grams(5), Err(SenseError::Calibration(_))));
    }

    #[test]
    fn non_positive_known_weight_is_rejected() {
        let (_root, mut ws) = sensor(ScriptedSource::constant(1000, 10));
        assert!(matches!(
            ws.calibrate_with_known_weight(0.0, 5, 5000.0),
            Err(SenseError::InvalidArgument(_))
        ));
        assert!(matches!(
            ws.calibrate_with_known_weight(f64::NAN, 5, 5000.0),
            Err(SenseError::InvalidArgument(_))
        ));
    }

    #[test]
    fn weak_signal_does_not_calibrate() {
        let (_root, mut ws) = sensor(ScriptedSource::constant(1200, 10));
        assert!(matches!(
            ws.calibrate_with_known_weight(500.0, 10, 5000.0),
            Err(SenseError::Calibration(msg)) if msg.contains("too small")
        ));
        assert_eq!(ws.calibration().scale, 0.0);
    }

    #[test]
    fn dead_line_surfaces_insufficient_samples() {
        let (_root, mut ws) = sensor(ScriptedSource::new(vec![]));
        assert!(matches!(
            ws.tare(5),
            Err(SenseError::InsufficientSamples { wanted: 5, got: 0 })
        ));
    }

    #[test]
    fn stability_waits_for_quiet_window() {
        let mut script: Vec<Result<RawSample>> = vec![Ok(0), Ok(5000), Ok(0)];
        script.extend([Ok(100), Ok(120), Ok(110)]);
        let (_root, mut ws) = sensor(ScriptedSource::new(script));
        let stats = ws
            .wait_for_stability(3, 1500.0, Duration::ZERO, Duration::from_secs(5))
            .unwrap();
        assert_eq!(stats.span(), 20.0);
    }

    #[test]
    fn warmup_fails_only_without_any_read() {
        let (_root, mut ws) = sensor(ScriptedSource::constant(10, 5));
        assert_eq!(ws.warmup(2, Duration::ZERO).unwrap(), 1);

        feed(&mut ws, 0, 0);
        assert!(matches!(
            ws.warmup(1, Duration::ZERO),
            Err(SenseError::InsufficientSamples { .. })
        ));
    }
}
