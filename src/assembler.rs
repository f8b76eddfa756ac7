//! Per-port sweep reassembly.
//!
//! A `SweepAssembler` folds the point stream of one port into complete `SweepRecord`
//! values. The instrument streams continuously and carries no end-of-sweep marker, so a
//! listener that attaches mid-sweep would otherwise see an undersized first record. The
//! assembler only accumulates from an index-0 boundary, requires strictly consecutive
//! indices, and releases a record when the expected point count is reached.
//!
//! Discarding a partial sweep is not an error. It happens on every attach and every
//! mid-sweep reconnect, and is only visible through [`AssemblerStats`] and debug logs.

use crate::measurement::{PointMessage, PortId, SweepRecord};
use chrono::Utc;
use num_complex::Complex32;

/// Counters describing what the assembler did with its input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    /// Complete records released.
    pub emitted: u64,
    /// Accumulations abandoned before completion.
    pub discarded_partials: u64,
    /// Points ignored while waiting for an index-0 boundary.
    pub skipped_points: u64,
}

#[derive(Debug, Default)]
struct PortSweepState {
    frequencies_hz: Vec<u64>,
    s_parameters: Vec<Complex32>,
    have_seen_index_zero: bool,
}

impl PortSweepState {
    fn len(&self) -> usize {
        self.frequencies_hz.len()
    }

    fn clear(&mut self) {
        self.frequencies_hz.clear();
        self.s_parameters.clear();
        self.have_seen_index_zero = false;
    }
}

/// Sweep state machine of one port.
#[derive(Debug)]
pub struct SweepAssembler {
    port: PortId,
    expected_point_count: usize,
    state: PortSweepState,
    next_sequence_no: u64,
    stats: AssemblerStats,
}

impl SweepAssembler {
    /// Create an assembler expecting `expected_point_count` points per sweep.
    ///
    /// With a count of zero the assembler stays inert until [`reconfigure`](Self::reconfigure).
    pub fn new(port: PortId, expected_point_count: usize) -> Self {
        Self {
            port,
            expected_point_count,
            state: PortSweepState::default(),
            next_sequence_no: 0,
            stats: AssemblerStats::default(),
        }
    }

    /// Port this assembler serves.
    pub fn port(&self) -> &PortId {
        &self.port
    }

    /// Points a sweep must have to be emitted.
    pub fn expected_point_count(&self) -> usize {
        self.expected_point_count
    }

    /// Counters since construction.
    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Whether an accumulation is in progress.
    pub fn is_accumulating(&self) -> bool {
        self.state.have_seen_index_zero
    }

    /// Apply a new point count. Any in-flight accumulation is discarded.
    pub fn reconfigure(&mut self, expected_point_count: usize) {
        if expected_point_count != self.expected_point_count {
            tracing::debug!(
                port = %self.port,
                from = self.expected_point_count,
                to = expected_point_count,
                "Reconfiguring sweep assembler"
            );
        }
        self.expected_point_count = expected_point_count;
        self.reset();
    }

    /// Discard any in-flight accumulation and wait for the next index 0.
    pub fn reset(&mut self) {
        if self.state.have_seen_index_zero && self.state.len() > 0 {
            self.discard("reset");
        }
        self.state.clear();
    }

    /// Feed one point. Returns a record when this point completes a sweep.
    pub fn push(&mut self, point: &PointMessage) -> Option<SweepRecord> {
        if point.port != self.port {
            tracing::warn!(
                port = %self.port,
                other = %point.port,
                "Ignoring point addressed to another port"
            );
            return None;
        }
        if self.expected_point_count == 0 {
            self.stats.skipped_points += 1;
            return None;
        }

        if point.point_index == 0 {
            if self.state.have_seen_index_zero && self.state.len() > 0 {
                self.discard("new sweep started");
            }
            self.state.clear();
            self.state.have_seen_index_zero = true;
        } else if !self.state.have_seen_index_zero {
            self.stats.skipped_points += 1;
            return None;
        }

        if point.point_index != self.state.len() {
            tracing::debug!(
                port = %self.port,
                expected = self.state.len(),
                got = point.point_index,
                "Out-of-order point"
            );
            self.discard("out-of-order point");
            self.state.clear();
            self.stats.skipped_points += 1;
            return None;
        }

        if let Some(&last) = self.state.frequencies_hz.last() {
            if point.frequency_hz <= last {
                tracing::debug!(
                    port = %self.port,
                    last_hz = last,
                    got_hz = point.frequency_hz,
                    "Non-increasing frequency"
                );
                self.discard("non-increasing frequency");
                self.state.clear();
                self.stats.skipped_points += 1;
                return None;
            }
        }

        self.state.frequencies_hz.push(point.frequency_hz);
        self.state.s_parameters.push(point.s_parameter);

        if self.state.len() < self.expected_point_count {
            return None;
        }

        let record = SweepRecord {
            port: self.port.clone(),
            sequence_no: self.next_sequence_no,
            acquired_at: Utc::now(),
            frequencies_hz: std::mem::take(&mut self.state.frequencies_hz),
            s_parameters: std::mem::take(&mut self.state.s_parameters),
        };
        self.state.clear();
        self.next_sequence_no += 1;
        self.stats.emitted += 1;
        tracing::trace!(port = %self.port, seq = record.sequence_no, "Sweep complete");
        Some(record)
    }

    fn discard(&mut self, reason: &'static str) {
        self.stats.discarded_partials += 1;
        tracing::debug!(
            port = %self.port,
            collected = self.state.len(),
            expected = self.expected_point_count,
            reason,
            "Discarding partial sweep"
        );
    }
}
