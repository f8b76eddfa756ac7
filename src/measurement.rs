//! Measurement data types flowing through the pipeline.
//!
//! `PointMessage` values are produced by the transport, one per wire message, and folded
//! by the assembler into `SweepRecord` values. A record is only ever created complete and
//! is moved (never shared mutably) to whoever receives it.

use chrono::{DateTime, Utc};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical measurement port, e.g. one S-parameter such as `S11`.
///
/// This is a streaming source identifier, not a network port number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(String);

impl PortId {
    /// Port called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The port name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PortId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PortId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A single decoded push message.
#[derive(Debug, Clone, PartialEq)]
pub struct PointMessage {
    /// Port the message arrived on.
    pub port: PortId,
    /// Position within the sweep, 0 starts a new sweep.
    pub point_index: usize,
    /// Frequency of this point.
    pub frequency_hz: u64,
    /// Complex S-parameter at `frequency_hz`.
    pub s_parameter: Complex32,
}

/// One complete sweep for one port.
///
/// `frequencies_hz` and `s_parameters` always have the same length, equal to the
/// expected point count of the port at release time, and frequencies are strictly
/// increasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRecord {
    /// Port the sweep was measured on.
    pub port: PortId,
    /// Per-port counter, starting at 0 for the first emitted record.
    pub sequence_no: u64,
    /// Time at which the final point of the sweep was received.
    pub acquired_at: DateTime<Utc>,
    /// Frequency of every point, strictly increasing.
    pub frequencies_hz: Vec<u64>,
    /// S-parameter of every point.
    pub s_parameters: Vec<Complex32>,
}

impl SweepRecord {
    /// Number of points in the sweep.
    pub fn len(&self) -> usize {
        self.frequencies_hz.len()
    }

    /// Whether the sweep has no points.
    pub fn is_empty(&self) -> bool {
        self.frequencies_hz.is_empty()
    }

    /// Log-magnitude of every point in dB (`20·log10|S|`).
    pub fn magnitude_db(&self) -> Vec<f32> {
        self.s_parameters
            .iter()
            .map(|s| 20.0 * s.norm().max(f32::MIN_POSITIVE).log10())
            .collect()
    }

    /// Frequency and depth of the deepest point, if any.
    pub fn minimum_db(&self) -> Option<(u64, f32)> {
        self.frequencies_hz
            .iter()
            .copied()
            .zip(self.magnitude_db())
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}
