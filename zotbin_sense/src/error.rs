// THEORY:
// Every failure in the sensing core is a typed value. The ADC protocol faults
// (`NotReady`, `ReadError`) are transient and normally absorbed by the sampler's
// retry budget; when that budget runs out they surface as `InsufficientSamples`.
// Calibration faults are user-facing and never defaulted away. Vision has no
// error variant for "nothing seen": that is a `CaptureOutcome`, not a failure.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SenseError {
    /// DOUT stayed high past the ready timeout.
    #[error("HX711 not ready (DOUT stayed high for {timeout_ms} ms)")]
    NotReady { timeout_ms: u64 },

    /// The pulse train overran its budget or decoded to a sentinel value.
    #[error("HX711 read error: {0}")]
    ReadError(String),

    #[error("insufficient valid samples ({got} of {wanted})")]
    InsufficientSamples { wanted: usize, got: usize },

    #[error("calibration error: {0}")]
    Calibration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("gpio backend error: {0}")]
    Gpio(String),

    #[error("camera error: {0}")]
    Camera(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The error codes a downstream publisher sees for a weight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightErrorCode {
    NotReady,
    ReadError,
    InsufficientSamples,
    CalibrationError,
}

impl SenseError {
    /// Collapses the error onto the weight boundary taxonomy. Hardware and
    /// argument faults have no code of their own and report as read errors.
    pub fn code(&self) -> WeightErrorCode {
        match self {
            SenseError::NotReady { .. } => WeightErrorCode::NotReady,
            SenseError::InsufficientSamples { .. } => WeightErrorCode::InsufficientSamples,
            SenseError::Calibration(_) | SenseError::InvalidArgument(_) => {
                WeightErrorCode::CalibrationError
            }
            _ => WeightErrorCode::ReadError,
        }
    }

    /// True for faults the sampler is allowed to swallow and retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, SenseError::NotReady { .. } | SenseError::ReadError(_))
    }
}

pub type Result<T> = std::result::Result<T, SenseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_faults_are_transient() {
        assert!(SenseError::NotReady { timeout_ms: 800 }.is_transient());
        assert!(SenseError::ReadError("overrun".into()).is_transient());
        assert!(!SenseError::InsufficientSamples { wanted: 5, got: 0 }.is_transient());
        assert!(!SenseError::Gpio("closed".into()).is_transient());
    }

    #[test]
    fn codes_match_boundary_taxonomy() {
        assert_eq!(
            SenseError::InsufficientSamples { wanted: 5, got: 2 }.code(),
            WeightErrorCode::InsufficientSamples
        );
        assert_eq!(
            SenseError::Calibration("scale=0".into()).code(),
            WeightErrorCode::CalibrationError
        );
        assert_eq!(SenseError::NotReady { timeout_ms: 1 }.code(), WeightErrorCode::NotReady);
    }
}
