// THEORY:
// `SenseConfig` is every tunable of the sensing core in one serde tree. Each
// section carries its own defaults, so a config file only needs the keys a
// deployment actually changes, and an empty file (or no file) is a working
// bench setup. `validate` rejects values that would make a component
// misbehave rather than fail, such as an even blur kernel or a zero window.
//
// The section types also know how to turn themselves into the runtime structs
// the components take (`Hx711Config`, `DetectionParams`, `CaptureParams`), so
// the binary never hand-copies fields.

use crate::core_modules::calibration::{self, CalibrationStore};
use crate::core_modules::capture::CaptureParams;
use crate::core_modules::frame_ops::{DEFAULT_BLUR_KERNEL, DEFAULT_PROCESS_WIDTH, GaussianKernel};
use crate::core_modules::gpio::{
    self, BackendKind, BoxedBackend, CdevBackend, DEFAULT_GPIO_CHIP, DEFAULT_SYSFS_ROOT, Pin, SysfsBackend,
};
use crate::core_modules::hx711::{Gain, Hx711Config};
use crate::core_modules::presence::DetectionParams;
use crate::core_modules::sampler::OutlierPolicy;
use crate::core_modules::selection::{MidpointPolicy, SelectionStrategy};
use crate::error::{Result, SenseError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BIN_ID: &str = "zotbin-1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenseConfig {
    pub bin_id: String,
    /// Overrides `$XDG_CONFIG_HOME` / `$HOME/.config` for calibration files.
    pub config_root: Option<PathBuf>,
    pub adc: AdcConfig,
    pub sampling: SamplingConfig,
    pub vision: VisionConfig,
}

impl Default for SenseConfig {
    fn default() -> Self {
        Self {
            bin_id: DEFAULT_BIN_ID.to_string(),
            config_root: None,
            adc: AdcConfig::default(),
            sampling: SamplingConfig::default(),
            vision: VisionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdcConfig {
    pub dout_pin: Pin,
    pub sck_pin: Pin,
    pub gain: Gain,
    pub ready_timeout_ms: u64,
    pub clock_delay_us: u64,
    pub max_read_duration_us: u64,
    pub backend: BackendKind,
    /// Character device used by the `cdev` backend.
    pub gpio_chip: PathBuf,
    pub sysfs_root: PathBuf,
    /// Overrides the gpiochip base detected under `sysfs_root`.
    pub sysfs_base: Option<u32>,
}

impl Default for AdcConfig {
    fn default() -> Self {
        let hx = Hx711Config::default();
        Self {
            dout_pin: hx.dout_pin,
            sck_pin: hx.sck_pin,
            gain: hx.gain,
            ready_timeout_ms: hx.ready_timeout.as_millis() as u64,
            clock_delay_us: hx.clock_delay_us,
            max_read_duration_us: hx.max_read_duration.as_micros() as u64,
            backend: BackendKind::default(),
            gpio_chip: PathBuf::from(DEFAULT_GPIO_CHIP),
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            sysfs_base: None,
        }
    }
}

impl AdcConfig {
    pub fn hx711_config(&self) -> Hx711Config {
        Hx711Config {
            dout_pin: self.dout_pin,
            sck_pin: self.sck_pin,
            gain: self.gain,
            ready_timeout: Duration::from_millis(self.ready_timeout_ms),
            clock_delay_us: self.clock_delay_us,
            max_read_duration: Duration::from_micros(self.max_read_duration_us),
        }
    }

    pub fn open_backend(&self) -> Result<BoxedBackend> {
        let sysfs = || SysfsBackend::boxed(&self.sysfs_root, self.sysfs_base);
        match self.backend {
            BackendKind::Cdev => CdevBackend::boxed(&self.gpio_chip),
            BackendKind::Sysfs => sysfs(),
            BackendKind::Auto => gpio::open_with_fallback(|| CdevBackend::boxed(&self.gpio_chip), sysfs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub read_samples: usize,
    pub tare_samples: usize,
    pub calibration_samples: usize,
    pub min_delta_raw: f64,
    pub outliers: OutlierPolicy,
    pub settle_ms: u64,
    pub stability_window_samples: usize,
    pub stability_span_raw: f64,
    pub stability_timeout_ms: u64,
    pub warmup_attempts: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            read_samples: 12,
            tare_samples: 25,
            calibration_samples: 40,
            min_delta_raw: 5000.0,
            outliers: OutlierPolicy::default(),
            settle_ms: 5,
            stability_window_samples: 30,
            stability_span_raw: 1500.0,
            stability_timeout_ms: 12_000,
            warmup_attempts: 40,
        }
    }
}

impl SamplingConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn stability_timeout(&self) -> Duration {
        Duration::from_millis(self.stability_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub blur_kernel: u32,
    pub diff_threshold: u8,
    pub dilate_iterations: u32,
    pub min_contour_area: usize,
    pub exit_grace_ms: u64,
    pub ignore_period_ms: u64,
    pub window_ms: u64,
    /// Frames wider than this are shrunk by an integer factor before detection.
    pub process_width: u32,
    /// Pacing for replayed recordings.
    pub frame_interval_ms: u64,
    pub camera: CameraConfig,
    pub selection: SelectionStrategy,
    pub midpoint: MidpointPolicy,
}

impl Default for VisionConfig {
    fn default() -> Self {
        let detection = DetectionParams::default();
        let capture = CaptureParams::default();
        Self {
            blur_kernel: DEFAULT_BLUR_KERNEL,
            diff_threshold: detection.diff_threshold,
            dilate_iterations: detection.dilate_iterations,
            min_contour_area: detection.min_area,
            exit_grace_ms: capture.exit_grace.as_millis() as u64,
            ignore_period_ms: capture.ignore_period.as_millis() as u64,
            window_ms: capture.window.as_millis() as u64,
            process_width: DEFAULT_PROCESS_WIDTH,
            frame_interval_ms: 33,
            camera: CameraConfig::default(),
            selection: capture.strategy,
            midpoint: capture.midpoint,
        }
    }
}

/// The live capture device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// V4L2 device index (`/dev/videoN`).
    pub device: i32,
    pub width: u32,
    pub height: u32,
    /// Frames grabbed and dropped after opening while exposure settles.
    pub warmup_frames: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: 0,
            width: 1920,
            height: 1080,
            warmup_frames: 10,
        }
    }
}

impl VisionConfig {
    pub fn kernel(&self) -> Result<GaussianKernel> {
        GaussianKernel::new(self.blur_kernel)
    }

    pub fn detection_params(&self) -> DetectionParams {
        DetectionParams {
            diff_threshold: self.diff_threshold,
            dilate_iterations: self.dilate_iterations,
            min_area: self.min_contour_area,
        }
    }

    pub fn capture_params(&self) -> CaptureParams {
        CaptureParams {
            window: Duration::from_millis(self.window_ms),
            ignore_period: Duration::from_millis(self.ignore_period_ms),
            exit_grace: Duration::from_millis(self.exit_grace_ms),
            strategy: self.selection,
            midpoint: self.midpoint,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl SenseConfig {
    /// Reads and validates a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SenseError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| SenseError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// `load` when a path is given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(SenseError::Config(msg));

        GaussianKernel::new(self.vision.blur_kernel)?;
        if self.vision.process_width == 0 {
            return fail("vision.process_width must be > 0".into());
        }
        if self.vision.window_ms == 0 {
            return fail("vision.window_ms must be > 0".into());
        }
        if self.vision.ignore_period_ms >= self.vision.window_ms {
            return fail(format!(
                "vision.ignore_period_ms ({}) must be shorter than window_ms ({})",
                self.vision.ignore_period_ms, self.vision.window_ms
            ));
        }
        if self.adc.ready_timeout_ms == 0 || self.adc.max_read_duration_us == 0 {
            return fail("adc timeouts must be > 0".into());
        }
        if self.adc.dout_pin == self.adc.sck_pin {
            return fail(format!("adc.dout_pin and adc.sck_pin are both {}", self.adc.sck_pin));
        }
        let s = &self.sampling;
        if s.read_samples == 0 || s.tare_samples == 0 || s.calibration_samples == 0 {
            return fail("sample counts must be > 0".into());
        }
        if s.stability_window_samples == 0 {
            return fail("sampling.stability_window_samples must be > 0".into());
        }
        if !(s.min_delta_raw >= 0.0) || !(s.outliers.iqr_factor > 0.0) {
            return fail("sampling.min_delta_raw must be >= 0 and iqr_factor > 0".into());
        }
        Ok(())
    }

    pub fn calibration_root(&self) -> PathBuf {
        self.config_root
            .clone()
            .unwrap_or_else(calibration::default_config_root)
    }

    pub fn calibration_store(&self) -> CalibrationStore {
        CalibrationStore::for_bin(&self.calibration_root(), &self.bin_id)
    }
}
