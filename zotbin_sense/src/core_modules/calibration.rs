// THEORY:
// `Calibration` is the small piece of state that turns raw counts into grams:
// an offset (the raw reading at zero load) and a scale (raw counts per gram).
// It lives in one JSON file per bin under the installation's config root.
//
// The store is deliberately pessimistic about its own file:
// - a missing file means "uncalibrated", which is a legal starting state;
// - a file that exists but will not parse is logged and ignored, and whatever
//   was already in memory stays put;
// - writes go to a temp file in the same directory, are synced, and are then
//   renamed over the target, so a crash can never leave a half-written record
//   that parses as a zero calibration.

use crate::error::Result;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const STORE_DIR: &str = "weight_sensor";
const DEFAULT_BIN_ID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    /// Raw units at zero load.
    pub offset: f64,
    /// Raw units per gram. Zero means "not calibrated".
    pub scale: f64,
    /// Unix seconds of the last tare or calibration.
    pub updated_at: i64,
}

impl Calibration {
    pub fn is_calibrated(&self) -> bool {
        self.scale != 0.0 && self.scale.is_finite()
    }
}

/// Keeps ASCII alphanumerics, `-` and `_`; anything else becomes `_`.
pub fn sanitize_bin_id(bin_id: &str) -> String {
    if bin_id.is_empty() {
        return DEFAULT_BIN_ID.to_string();
    }
    bin_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// `$XDG_CONFIG_HOME`, else `$HOME/.config`, else `./.config`.
pub fn default_config_root() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg);
    }
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
}

pub fn calibration_path(config_root: &Path, bin_id: &str) -> PathBuf {
    config_root
        .join(STORE_DIR)
        .join(format!("{}.json", sanitize_bin_id(bin_id)))
}

pub struct CalibrationStore {
    path: PathBuf,
}

impl CalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_bin(config_root: &Path, bin_id: &str) -> Self {
        Self::new(calibration_path(config_root, bin_id))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored record. `None` when the file is missing or unusable.
    pub fn load(&self) -> Option<Calibration> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no calibration at {}", self.path.display());
                return None;
            }
            Err(err) => {
                warn!("cannot read calibration {}: {err}", self.path.display());
                return None;
            }
        };
        match serde_json::from_str::<Calibration>(&contents) {
            Ok(cal) if cal.offset.is_finite() && cal.scale.is_finite() => Some(cal),
            Ok(_) => {
                warn!("calibration {} has non-finite values, ignoring", self.path.display());
                None
            }
            Err(err) => {
                warn!("calibration {} is corrupt, ignoring: {err}", self.path.display());
                None
            }
        }
    }

    /// Overwrites `target` with the stored record when one is usable.
    pub fn load_into(&self, target: &mut Calibration) -> bool {
        match self.load() {
            Some(cal) => {
                *target = cal;
                true
            }
            None => false,
        }
    }

    pub fn save(&self, cal: &Calibration) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let mut serialized = serde_json::to_string_pretty(cal)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        serialized.push('\n');

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_BIN_ID.to_string());
        let tmp = dir.join(format!(".{file_name}.tmp"));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(serialized.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        info!(
            "saved calibration offset={:.2} scale={:.6} to {}",
            cal.offset,
            cal.scale,
            self.path.display()
        );
        Ok(())
    }
}
