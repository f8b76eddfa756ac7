//! Hand-off of completed sweeps from receive tasks to the foreground consumer.
//!
//! The consumer (typically a UI refreshing at a fixed rate) only ever needs the newest
//! sweep. The mailbox therefore holds a single pending record: `publish` overwrites a
//! record the consumer has not drained yet, whatever port it came from. Memory stays
//! bounded however slow the consumer is, and the producer never waits on the consumer.
//!
//! A replaced record is skipped entirely, never delivered late, so drained records always
//! follow publish order.

use crate::measurement::SweepRecord;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Records handed to `publish`.
    pub published: u64,
    /// Records replaced before the consumer drained them.
    pub coalesced: u64,
    /// Records taken by the consumer.
    pub drained: u64,
}

/// Latest-wins, single-slot mailbox between producer tasks and one consumer.
#[derive(Default)]
pub struct CrossThreadDispatcher {
    slot: Mutex<Option<SweepRecord>>,
    notify: Notify,
    published: AtomicU64,
    coalesced: AtomicU64,
    drained: AtomicU64,
}

impl CrossThreadDispatcher {
    /// Create an empty mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `record` available to the consumer, replacing any undrained record.
    pub fn publish(&self, record: SweepRecord) {
        let replaced = self.slot.lock().replace(record);
        if let Some(replaced) = replaced {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                port = %replaced.port,
                seq = replaced.sequence_no,
                "Consumer behind, replacing undrained sweep"
            );
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Take the pending record without blocking.
    pub fn drain(&self) -> Option<SweepRecord> {
        let record = self.slot.lock().take();
        if record.is_some() {
            self.drained.fetch_add(1, Ordering::Relaxed);
        }
        record
    }

    /// Whether a record is waiting to be drained.
    pub fn has_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Wait until a record is pending. For async consumers.
    pub async fn wait_pending(&self) {
        loop {
            let notified = self.notify.notified();
            if self.has_pending() {
                return;
            }
            notified.await;
        }
    }

    /// Snapshot of the delivery counters.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            published: self.published.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
        }
    }
}
