// THEORY:
// The `sampler` turns a flaky stream of single conversions into one trustworthy
// number. It has two halves:
//
// 1.  **Acquisition** (`read_raw_samples`): keep asking the source for samples,
//     swallowing the transient protocol faults, until the window is full or the
//     attempt budget is spent. A short window is never returned; it is an
//     `InsufficientSamples` error.
// 2.  **Reduction** (`robust_mean`): an interquartile-range filter. Load cells
//     pick up single-sample spikes from motors, relays and loose wiring. Fencing
//     at 1.5×IQR outside the quartiles removes them without a fixed trim count,
//     and the median is the fallback whenever the fence is degenerate.

use crate::core_modules::gpio::PinBackend;
use crate::core_modules::hx711::{Hx711, RawSample};
use crate::error::{Result, SenseError};
use log::trace;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Anything that yields single raw conversions.
pub trait RawSampleSource {
    fn read_raw(&mut self) -> Result<RawSample>;
}

impl<B: PinBackend> RawSampleSource for Hx711<B> {
    fn read_raw(&mut self) -> Result<RawSample> {
        Hx711::read_raw(self)
    }
}

impl<S: RawSampleSource + ?Sized> RawSampleSource for Box<S> {
    fn read_raw(&mut self) -> Result<RawSample> {
        (**self).read_raw()
    }
}

/// Collects `target` valid samples in at most `max_attempts` reads.
pub fn read_raw_samples<S: RawSampleSource + ?Sized>(
    source: &mut S,
    target: usize,
    max_attempts: usize,
    settle: Duration,
) -> Result<Vec<RawSample>> {
    let mut values = Vec::with_capacity(target);
    let mut attempts = 0;

    while values.len() < target && attempts < max_attempts {
        attempts += 1;
        match source.read_raw() {
            Ok(raw) => values.push(raw),
            Err(err) if err.is_transient() => trace!("discarding sample attempt {attempts}: {err}"),
            Err(err) => return Err(err),
        }
        if !settle.is_zero() && values.len() < target && attempts < max_attempts {
            std::thread::sleep(settle);
        }
    }

    if values.len() < target {
        return Err(SenseError::InsufficientSamples {
            wanted: target,
            got: values.len(),
        });
    }
    Ok(values)
}

/// Outlier policy for `robust_mean`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierPolicy {
    /// Fence distance outside [Q1, Q3], in IQRs.
    pub iqr_factor: f64,
    /// Fewer survivors than this falls back to the median.
    pub min_survivors: usize,
}

impl Default for OutlierPolicy {
    fn default() -> Self {
        Self {
            iqr_factor: 1.5,
            min_survivors: 3,
        }
    }
}

/// Linear-interpolated quantile of an already sorted slice.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

fn sorted_f64(values: &[RawSample]) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.iter().map(|v| *v as f64).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

pub fn median(values: &[RawSample]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(quantile_sorted(&sorted_f64(values), 0.5))
}

/// Returns (Q1, Q3).
pub fn quartiles(values: &[RawSample]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let sorted = sorted_f64(values);
    Some((quantile_sorted(&sorted, 0.25), quantile_sorted(&sorted, 0.75)))
}

/// IQR-filtered mean of the window. `None` only for an empty window.
pub fn robust_mean(values: &[RawSample], policy: &OutlierPolicy) -> Option<f64> {
    let sorted = sorted_f64(values);
    if sorted.is_empty() {
        return None;
    }
    let median = quantile_sorted(&sorted, 0.5);
    let q1 = quantile_sorted(&sorted, 0.25);
    let q3 = quantile_sorted(&sorted, 0.75);
    let iqr = q3 - q1;
    if iqr == 0.0 {
        return Some(median);
    }

    let low = q1 - policy.iqr_factor * iqr;
    let high = q3 + policy.iqr_factor * iqr;
    let kept: Vec<f64> = sorted.into_iter().filter(|v| *v >= low && *v <= high).collect();
    if kept.len() < policy.min_survivors {
        return Some(median);
    }
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

/// Summary of one raw window, used by the stability check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl WindowStats {
    pub fn from_samples(values: &[RawSample]) -> Option<Self> {
        let min = *values.iter().min()? as f64;
        let max = *values.iter().max()? as f64;
        let mean = values.iter().map(|v| *v as f64).sum::<f64>() / values.len() as f64;
        Some(Self { mean, min, max })
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays a fixed script of read results, then reports not-ready forever.
    pub(crate) struct ScriptedSource {
        pub script: VecDeque<Result<RawSample>>,
        pub reads: usize,
    }

    impl ScriptedSource {
        pub(crate) fn new(script: Vec<Result<RawSample>>) -> Self {
            Self {
                script: script.into(),
                reads: 0,
            }
        }

        pub(crate) fn constant(value: RawSample, count: usize) -> Self {
            Self::new((0..count).map(|_| Ok(value)).collect())
        }
    }

    impl RawSampleSource for ScriptedSource {
        fn read_raw(&mut self) -> Result<RawSample> {
            self.reads += 1;
            self.script
                .pop_front()
                .unwrap_or(Err(SenseError::NotReady { timeout_ms: 800 }))
        }
    }

    #[test]
    fn all_not_ready_is_insufficient_not_partial() {
        let mut source = ScriptedSource::new(vec![]);
        let result = read_raw_samples(&mut source, 5, 5, Duration::ZERO);
        assert!(matches!(
            result,
            Err(SenseError::InsufficientSamples { wanted: 5, got: 0 })
        ));
        assert_eq!(source.reads, 5);
    }

    #[test]
    fn transient_faults_are_skipped() {
        let mut source = ScriptedSource::new(vec![
            Ok(1),
            Err(SenseError::ReadError("invalid raw (0xFFFFFF)".into())),
            Ok(2),
            Err(SenseError::NotReady { timeout_ms: 800 }),
            Ok(3),
        ]);
        let values = read_raw_samples(&mut source, 3, 10, Duration::ZERO).unwrap();
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(source.reads, 5);
    }

    #[test]
    fn hardware_faults_propagate_immediately() {
        let mut source = ScriptedSource::new(vec![Ok(1), Err(SenseError::Gpio("gone".into()))]);
        let result = read_raw_samples(&mut source, 3, 10, Duration::ZERO);
        assert!(matches!(result, Err(SenseError::Gpio(_))));
    }

    #[test]
    fn single_spike_does_not_skew_mean() {
        let mean = robust_mean(&[10, 11, 9, 10, 12, 500], &OutlierPolicy::default()).unwrap();
        assert!((mean - 10.4).abs() < 1e-9, "{mean}");
    }

    #[test]
    fn zero_iqr_uses_median() {
        let mean = robust_mean(&[7, 7, 7, 7, 7, 9000], &OutlierPolicy::default()).unwrap();
        assert_eq!(mean, 7.0);
    }

    #[test]
    fn too_few_survivors_uses_full_median() {
        let policy = OutlierPolicy {
            min_survivors: 3,
            ..OutlierPolicy::default()
        };
        // Two samples always survive their own fence.
        assert_eq!(robust_mean(&[100, 200], &policy), Some(150.0));
        assert_eq!(robust_mean(&[], &policy), None);
    }

    #[test]
    fn quartiles_interpolate() {
        let (q1, q3) = quartiles(&[9, 10, 10, 11, 12, 500]).unwrap();
        assert_eq!(q1, 10.0);
        assert_eq!(q3, 11.75);
        assert_eq!(median(&[3, 1, 2]), Some(2.0));
    }

    #[test]
    fn window_stats_span() {
        let stats = WindowStats::from_samples(&[4, 10, 6]).unwrap();
        assert_eq!(stats.span(), 6.0);
        assert!((stats.mean - 20.0 / 3.0).abs() < 1e-12);
    }
}
