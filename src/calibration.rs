//! Calibration metadata.
//!
//! Only the three scalar fields this engine depends on are read from the calibration
//! artifact. The point count is the sole source of truth for how many points make up a
//! complete sweep.

use crate::error::{VnaError, VnaResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Frequency plan of the loaded calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationMetadata {
    /// First swept frequency.
    pub start_frequency_hz: u64,
    /// Last swept frequency.
    pub stop_frequency_hz: u64,
    /// Points per sweep.
    pub num_points: usize,
}

impl CalibrationMetadata {
    /// Unvalidated metadata; see [`validate`](Self::validate).
    pub fn new(start_frequency_hz: u64, stop_frequency_hz: u64, num_points: usize) -> Self {
        Self {
            start_frequency_hz,
            stop_frequency_hz,
            num_points,
        }
    }

    /// Read the calibration artifact at `path` (TOML; unrelated keys are ignored).
    pub fn load_from<P: AsRef<Path>>(path: P) -> VnaResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            VnaError::Calibration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let meta: Self = toml::from_str(&text).map_err(|e| {
            VnaError::Calibration(format!("cannot parse {}: {}", path.display(), e))
        })?;
        meta.validate()?;
        tracing::info!(
            path = %path.display(),
            start_hz = meta.start_frequency_hz,
            stop_hz = meta.stop_frequency_hz,
            points = meta.num_points,
            "Loaded calibration"
        );
        Ok(meta)
    }

    /// Reject fewer than two points or a non-increasing frequency range.
    pub fn validate(&self) -> VnaResult<()> {
        if self.num_points < 2 {
            return Err(VnaError::Calibration(format!(
                "num_points must be at least 2, got {}",
                self.num_points
            )));
        }
        if self.start_frequency_hz >= self.stop_frequency_hz {
            return Err(VnaError::Calibration(format!(
                "start frequency {} Hz must be below stop frequency {} Hz",
                self.start_frequency_hz, self.stop_frequency_hz
            )));
        }
        Ok(())
    }

    /// Nominal frequency of point `index` on a linear grid.
    pub fn frequency_at(&self, index: usize) -> u64 {
        let span = self.stop_frequency_hz.saturating_sub(self.start_frequency_hz) as u128;
        let steps = self.num_points.saturating_sub(1).max(1) as u128;
        self.start_frequency_hz + (span * index as u128 / steps) as u64
    }
}
