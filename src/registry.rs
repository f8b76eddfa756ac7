//! Per-port listener registry for completed sweeps.
//!
//! Registration happens on the consumer side while dispatch runs on push receive tasks.
//! Registration changes take a mutex; dispatch copies the port's listener list under the
//! lock and invokes it after releasing, so a concurrent (de)registration never disturbs
//! an in-flight dispatch and listeners may (de)register from inside a callback.

use crate::measurement::{PortId, SweepRecord};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Receives ownership of a completed sweep.
pub type SweepListener = Arc<dyn Fn(SweepRecord) + Send + Sync>;

/// Handle returned by [`CallbackRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    listeners: HashMap<PortId, Vec<(ListenerId, SweepListener)>>,
}

/// Maps a port to the listeners awaiting its sweeps.
#[derive(Default)]
pub struct CallbackRegistry {
    inner: Mutex<RegistryInner>,
}

impl CallbackRegistry {
    /// Registry with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `port`. Listeners run in registration order.
    pub fn register<F>(&self, port: &PortId, listener: F) -> ListenerId
    where
        F: Fn(SweepRecord) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner
            .listeners
            .entry(port.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        tracing::debug!(port = %port, listener = id.0, "Registered sweep listener");
        id
    }

    /// Remove one listener. Returns `false` if it was not registered.
    pub fn deregister(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let mut removed = false;
        inner.listeners.retain(|_, list| {
            let before = list.len();
            list.retain(|(listener_id, _)| *listener_id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Remove every listener of `port`, returning how many were removed.
    pub fn deregister_port(&self, port: &PortId) -> usize {
        self.inner
            .lock()
            .listeners
            .remove(port)
            .map_or(0, |list| list.len())
    }

    /// Listeners registered for `port`.
    pub fn listener_count(&self, port: &PortId) -> usize {
        self.inner.lock().listeners.get(port).map_or(0, Vec::len)
    }

    /// Deliver `record` to every listener of its port; returns the number of deliveries.
    ///
    /// The last listener receives the record itself, earlier ones receive clones.
    pub fn dispatch(&self, record: SweepRecord) -> usize {
        let snapshot: Vec<SweepListener> = self
            .inner
            .lock()
            .listeners
            .get(&record.port)
            .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        let Some((last, rest)) = snapshot.split_last() else {
            tracing::trace!(port = %record.port, "No listener for sweep");
            return 0;
        };
        for listener in rest {
            listener(record.clone());
        }
        last(record);
        snapshot.len()
    }
}
