// THEORY:
// This file is the entry point for the `zotbin_sense` library crate, the
// sensing core of a smart bin. It has two independent halves:
//
// - the weight path: an HX711 load-cell ADC driven over GPIO, a retrying
//   sampler with an outlier-robust average, and a persistent tare/scale
//   calibration;
// - the vision path: a fixed background reference, per-frame presence
//   detection, a transit state machine, and selection of one representative
//   frame per transit.
//
// `pipeline` wires both halves into workers connected by bounded channels and
// is the interface most consumers want. The building blocks stay public under
// `core_modules` for tools that drive one half directly, like the calibration
// rig.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod pipeline;

pub use config::SenseConfig;
pub use core_modules::capture::{CaptureOutcome, DetectionResult};
pub use error::{Result, SenseError, WeightErrorCode};
pub use pipeline::{BinRecord, SensePipeline, Trigger, WeightHandle, WeightReading};
