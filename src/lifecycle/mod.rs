//! Acquisition lifecycle state machine.
//!
//! The controller owns the only path from `Ready` to `Collecting` and back. Every
//! collection runs on a freshly cold-started engine instance: the idle instance used for
//! probing is stopped first, since the engine cannot change continuous-mode parameters
//! once it streams.
//!
//! ```text
//!   Idle ──► Probing ──► Ready ──► Starting ──► Collecting ──► Stopping ──► Ready
//!    ▲          │          │          │              │              │
//!    └──────────┴──────────┴──────────┴──────────────┴──────────────┘  (failure)
//! ```
//!
//! Completed sweeps pass through a [`CollectionGate`] before they reach the
//! [`CallbackRegistry`]. The gate enforces the configured sweep limit and, once closed on
//! cancellation, guarantees that no further record is delivered.

pub mod commands;
pub mod engine;

pub use engine::{EngineControl, ProcessEngine, ProcessHandle, UnmanagedEngine};

use crate::assembler::{AssemblerStats, SweepAssembler};
use crate::calibration::CalibrationMetadata;
use crate::config::VnaConfig;
use crate::error::{VnaError, VnaResult};
use crate::measurement::PortId;
use crate::registry::CallbackRegistry;
use crate::transport::{CommandChannel, InstrumentLink, Transport, TransportFault};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Phase of the acquisition lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecyclePhase {
    /// Not connected, or recovering from a failure.
    Idle,
    /// Establishing connectivity and identifying the instrument.
    Probing,
    /// Identified and waiting for a collection request.
    Ready,
    /// Cold-starting the engine and enabling continuous mode.
    Starting,
    /// Sweeps are flowing to listeners.
    Collecting,
    /// Tearing down the streaming engine.
    Stopping,
}

impl LifecyclePhase {
    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: LifecyclePhase) -> bool {
        use LifecyclePhase::*;
        matches!(
            (self, next),
            (Idle, Probing)
                | (Probing, Ready)
                | (Probing, Idle)
                | (Ready, Probing)
                | (Ready, Starting)
                | (Ready, Idle)
                | (Starting, Collecting)
                | (Starting, Stopping)
                | (Starting, Idle)
                | (Collecting, Stopping)
                | (Collecting, Idle)
                | (Stopping, Ready)
                | (Stopping, Idle)
        )
    }

    /// Phases during which the engine is owned by a collection.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            LifecyclePhase::Starting | LifecyclePhase::Collecting | LifecyclePhase::Stopping
        )
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a collection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionEnd {
    /// The sweep limit was reached.
    Completed,
    /// Cancelled by the consumer.
    Cancelled,
}

/// Outcome of [`SweepLifecycleController::collect`].
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSummary {
    /// Why the collection stopped.
    pub ending: CollectionEnd,
    /// Records handed to the registry.
    pub sweeps_delivered: u64,
    /// Time from `Starting` until the gate closed.
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    admitted: u64,
    limit: Option<u64>,
}

/// Admission control between the assemblers and the registry.
#[derive(Debug, Default)]
pub struct CollectionGate {
    state: Mutex<GateState>,
}

impl CollectionGate {
    /// Open the gate for a new collection of at most `limit` sweeps.
    pub fn arm(&self, limit: Option<u64>) {
        *self.state.lock() = GateState {
            open: true,
            admitted: 0,
            limit,
        };
    }

    /// Close the gate. Once this returns no admission is in progress and none follows.
    pub fn close(&self) {
        self.state.lock().open = false;
    }

    /// Whether records are currently admitted.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Records admitted since the last `arm`.
    pub fn admitted(&self) -> u64 {
        self.state.lock().admitted
    }

    /// Run `deliver` with the record's ordinal and whether it reaches the limit, if the
    /// gate admits one more record. `deliver` runs under the gate lock.
    pub fn admit<F>(&self, deliver: F) -> bool
    where
        F: FnOnce(u64, bool),
    {
        let mut state = self.state.lock();
        if !state.open {
            return false;
        }
        if state.limit.is_some_and(|limit| state.admitted >= limit) {
            state.open = false;
            return false;
        }
        state.admitted += 1;
        let limit_reached = state.limit.is_some_and(|limit| state.admitted >= limit);
        if limit_reached {
            state.open = false;
        }
        deliver(state.admitted, limit_reached);
        true
    }
}

/// Progress reported by receive tasks to the controller.
#[derive(Debug)]
enum CollectorEvent {
    Sweep {
        port: PortId,
        sequence_no: u64,
        ordinal: u64,
        limit_reached: bool,
    },
    Fault(TransportFault),
}

/// Drives probing, cold start, streaming and teardown of one instrument.
pub struct SweepLifecycleController {
    config: VnaConfig,
    link: Arc<dyn InstrumentLink>,
    engine: Arc<dyn EngineControl>,
    registry: Arc<CallbackRegistry>,
    assemblers: BTreeMap<PortId, Arc<Mutex<SweepAssembler>>>,
    gate: Arc<CollectionGate>,
    events_tx: mpsc::UnboundedSender<CollectorEvent>,
    events_rx: mpsc::UnboundedReceiver<CollectorEvent>,
    phase_tx: watch::Sender<LifecyclePhase>,
    calibration: Option<CalibrationMetadata>,
    transport: Option<Transport>,
    engine_handle: Option<ProcessHandle>,
    identity: Option<String>,
}

impl SweepLifecycleController {
    /// Controller in `Idle` with one assembler per configured port.
    pub fn new(
        config: VnaConfig,
        link: Arc<dyn InstrumentLink>,
        engine: Arc<dyn EngineControl>,
        registry: Arc<CallbackRegistry>,
    ) -> Self {
        let assemblers = config
            .ports()
            .into_iter()
            .map(|port| {
                let assembler = SweepAssembler::new(port.clone(), 0);
                (port, Arc::new(Mutex::new(assembler)))
            })
            .collect();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (phase_tx, _) = watch::channel(LifecyclePhase::Idle);

        Self {
            config,
            link,
            engine,
            registry,
            assemblers,
            gate: Arc::new(CollectionGate::default()),
            events_tx,
            events_rx,
            phase_tx,
            calibration: None,
            transport: None,
            engine_handle: None,
            identity: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> LifecyclePhase {
        *self.phase_tx.borrow()
    }

    /// Observe phase transitions.
    pub fn subscribe_phase(&self) -> watch::Receiver<LifecyclePhase> {
        self.phase_tx.subscribe()
    }

    /// Registry that receives admitted records.
    pub fn registry(&self) -> Arc<CallbackRegistry> {
        self.registry.clone()
    }

    /// Identification string of the last successful probe.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Calibration used by the next collection.
    pub fn calibration(&self) -> Option<&CalibrationMetadata> {
        self.calibration.as_ref()
    }

    /// Configured ports, in order.
    pub fn ports(&self) -> Vec<PortId> {
        self.assemblers.keys().cloned().collect()
    }

    /// Handle of the engine instance currently owned by the controller.
    pub fn engine_handle(&self) -> Option<ProcessHandle> {
        self.engine_handle
    }

    /// Per-port assembler counters.
    pub fn assembler_stats(&self) -> BTreeMap<PortId, AssemblerStats> {
        self.assemblers
            .iter()
            .map(|(port, assembler)| (port.clone(), assembler.lock().stats()))
            .collect()
    }

    /// Ports with a live push connection.
    pub async fn open_push_ports(&self) -> Vec<PortId> {
        match &self.transport {
            Some(transport) => transport.open_ports().await,
            None => Vec::new(),
        }
    }

    /// Install calibration metadata and resize every assembler to its point count.
    ///
    /// Rejected while a collection owns the engine.
    pub fn set_calibration(&mut self, calibration: CalibrationMetadata) -> VnaResult<()> {
        let phase = self.phase();
        if phase.is_busy() {
            return Err(VnaError::PreconditionFailed(format!(
                "calibration cannot change while {phase}"
            )));
        }
        calibration.validate()?;
        for assembler in self.assemblers.values() {
            assembler.lock().reconfigure(calibration.num_points);
        }
        info!(
            num_points = calibration.num_points,
            start_hz = calibration.start_frequency_hz,
            stop_hz = calibration.stop_frequency_hz,
            "Calibration installed"
        );
        self.calibration = Some(calibration);
        Ok(())
    }

    /// Confirm the instrument is reachable and identify it.
    ///
    /// An unreachable engine is cold-started as an idle instance. On failure the
    /// controller returns to `Idle` and any engine it started is stopped again.
    pub async fn probe(&mut self) -> VnaResult<String> {
        self.transition(LifecyclePhase::Probing)?;
        match self.connect_and_identify().await {
            Ok(identity) => {
                self.transition(LifecyclePhase::Ready)?;
                Ok(identity)
            }
            Err(e) => {
                warn!("Probe failed: {e}");
                self.teardown().await;
                self.enter_idle();
                Err(e)
            }
        }
    }

    /// Check everything `collect` requires, without side effects.
    pub fn check_preconditions(&self) -> VnaResult<()> {
        let phase = self.phase();
        if phase != LifecyclePhase::Ready {
            return Err(VnaError::PreconditionFailed(format!(
                "collection can only begin from Ready, current phase is {phase}"
            )));
        }
        let calibration = self
            .calibration
            .as_ref()
            .ok_or_else(|| VnaError::PreconditionFailed("no calibration loaded".into()))?;
        calibration
            .validate()
            .map_err(|e| VnaError::PreconditionFailed(e.to_string()))?;
        self.config
            .validate()
            .map_err(|e| VnaError::PreconditionFailed(e.to_string()))?;
        Ok(())
    }

    /// Run one collection from `Ready` until `total_sweeps` records were delivered or
    /// `cancel` turns `true`.
    ///
    /// A precondition failure returns immediately and leaves the phase untouched. Any
    /// other failure tears the engine down and leaves the controller in `Idle`.
    pub async fn collect(
        &mut self,
        total_sweeps: Option<u64>,
        cancel: &mut watch::Receiver<bool>,
    ) -> VnaResult<CollectionSummary> {
        self.check_preconditions()?;
        if total_sweeps == Some(0) {
            return Err(VnaError::PreconditionFailed(
                "total_sweeps must be positive".into(),
            ));
        }
        let calibration = self
            .calibration
            .ok_or_else(|| VnaError::PreconditionFailed("no calibration loaded".into()))?;

        self.transition(LifecyclePhase::Starting)?;
        while self.events_rx.try_recv().is_ok() {}
        self.reset_assemblers();
        self.gate.arm(total_sweeps);
        let started = Instant::now();

        let outcome = self.stream(&calibration, cancel).await;

        self.gate.close();
        // A sweep in flight at this point is discarded, never flushed
        self.reset_assemblers();
        let sweeps_delivered = self.gate.admitted();

        let ending = match outcome {
            Ok(ending) => ending,
            Err(e) => {
                error!(sweeps_delivered, "Collection failed: {e}");
                self.teardown().await;
                self.enter_idle();
                return Err(e);
            }
        };

        self.transition(LifecyclePhase::Stopping)?;
        self.teardown().await;
        match self.connect_and_identify().await {
            Ok(_) => self.transition(LifecyclePhase::Ready)?,
            Err(e) => {
                warn!("Re-probe after collection failed: {e}");
                self.teardown().await;
                self.enter_idle();
                return Err(e);
            }
        }

        let summary = CollectionSummary {
            ending,
            sweeps_delivered,
            elapsed: started.elapsed(),
        };
        info!(
            ending = ?summary.ending,
            sweeps = summary.sweeps_delivered,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Collection finished"
        );
        Ok(summary)
    }

    /// Stop any collection resources and the engine, then enter `Idle`.
    pub async fn shutdown(&mut self) {
        self.gate.close();
        self.reset_assemblers();
        self.teardown().await;
        if self.phase() != LifecyclePhase::Idle {
            self.enter_idle();
        }
        info!("Lifecycle controller shut down");
    }

    fn transition(&mut self, next: LifecyclePhase) -> VnaResult<()> {
        let current = self.phase();
        if !current.can_transition_to(next) {
            return Err(VnaError::IllegalTransition {
                from: current,
                to: next,
            });
        }
        info!(from = %current, to = %next, "Lifecycle transition");
        self.phase_tx.send_replace(next);
        Ok(())
    }

    /// Failure exit: every non-idle phase may fall back to `Idle`.
    fn enter_idle(&mut self) {
        let current = self.phase();
        let idle = LifecyclePhase::Idle;
        if current != idle {
            info!(from = %current, to = %idle, "Lifecycle transition");
            self.phase_tx.send_replace(idle);
        }
        self.identity = None;
    }

    fn reset_assemblers(&self) {
        for assembler in self.assemblers.values() {
            assembler.lock().reset();
        }
    }

    async fn connect_and_identify(&mut self) -> VnaResult<String> {
        if self.transport.is_none() {
            let transport = match Transport::connect(self.link.clone()).await {
                Ok(transport) => transport,
                Err(VnaError::Connection(e)) => {
                    info!("Engine not reachable ({e}), starting an idle instance");
                    self.cold_start().await?
                }
                Err(e) => return Err(e),
            };
            self.transport = Some(transport);
        }
        let command = self
            .transport
            .as_ref()
            .map(Transport::command)
            .ok_or(VnaError::SessionClosed)?;

        let probe_timeout = self.config.acquisition.probe_timeout();
        let reply = tokio::time::timeout(probe_timeout, command.query(&self.config.commands.identify))
            .await;
        let identity = match reply {
            Ok(Ok(identity)) => identity,
            Err(_) | Ok(Err(VnaError::CommandTimeout { .. })) => {
                return Err(VnaError::ProbeTimeout(probe_timeout.as_millis() as u64))
            }
            Ok(Err(e)) => return Err(e),
        };
        if identity.is_empty() {
            return Err(VnaError::Instrument(
                "empty identification response".into(),
            ));
        }
        info!(identity = %identity, "Instrument identified");
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Stop the current instance, if any, and start a fresh one that answers SCPI.
    async fn cold_start(&mut self) -> VnaResult<Transport> {
        self.stop_engine_instance().await;

        let attempts = self.config.engine.start_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let handle = match self.engine.start_engine().await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(attempt, attempts, "Engine start failed: {e}");
                    last_error = Some(e);
                    continue;
                }
            };
            self.engine_handle = Some(handle);

            match self.wait_reachable().await {
                Ok(transport) => {
                    info!(%handle, attempt, "Acquisition engine is up");
                    return Ok(transport);
                }
                Err(e) => {
                    warn!(%handle, attempt, attempts, "Engine did not come up: {e}");
                    self.stop_engine_instance().await;
                    last_error = Some(e);
                }
            }
        }

        Err(VnaError::Engine(match last_error {
            Some(e) => format!("engine not started after {attempts} attempts: {e}"),
            None => format!("engine not started after {attempts} attempts"),
        }))
    }

    /// Poll the command port until the engine answers its ready query.
    async fn wait_reachable(&self) -> VnaResult<Transport> {
        let start_timeout = self.config.engine.start_timeout();
        let poll_interval = self.config.engine.poll_interval();
        let command_timeout = self.config.acquisition.command_timeout();
        let deadline = Instant::now() + start_timeout;

        loop {
            let attempt = async {
                let transport = Transport::connect(self.link.clone()).await?;
                query(
                    &transport.command(),
                    &self.config.commands.engine_ready,
                    command_timeout,
                )
                .await?;
                Ok::<_, VnaError>(transport)
            };

            match tokio::time::timeout_at(deadline, attempt).await {
                Ok(Ok(transport)) => return Ok(transport),
                Ok(Err(e)) if e.is_recoverable() => debug!("Engine not ready yet: {e}"),
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            }

            if Instant::now() + poll_interval >= deadline {
                break;
            }
            tokio::time::sleep(poll_interval).await;
        }

        Err(VnaError::Engine(format!(
            "not reachable within {} ms",
            start_timeout.as_millis()
        )))
    }

    /// Starting phase and the collection loop. Returns how the collection ended.
    async fn stream(
        &mut self,
        calibration: &CalibrationMetadata,
        cancel: &mut watch::Receiver<bool>,
    ) -> VnaResult<CollectionEnd> {
        if let Some(idle) = self.transport.take() {
            idle.close_all().await;
        }
        let transport = self.cold_start().await?;
        let command = transport.command();
        self.transport = Some(transport);
        if *cancel.borrow() {
            return Ok(self.cancelled());
        }

        let command_timeout = self.config.acquisition.command_timeout();
        for setup in commands::render_sweep_setup(&self.config.commands, calibration)? {
            send(&command, &setup, command_timeout).await?;
        }

        self.wire_handlers();
        if let Some(transport) = &self.transport {
            for port in self.assemblers.keys() {
                transport.open_push_channel(port).await?;
            }
        }
        if *cancel.borrow() {
            return Ok(self.cancelled());
        }

        send(&command, &self.config.commands.continuous_on, command_timeout).await?;
        info!(ports = self.assemblers.len(), "Continuous acquisition enabled");

        self.await_sweeps(cancel).await
    }

    fn wire_handlers(&self) {
        let Some(transport) = &self.transport else {
            return;
        };

        for (port, assembler) in &self.assemblers {
            let assembler = assembler.clone();
            let gate = self.gate.clone();
            let registry = self.registry.clone();
            let events = self.events_tx.clone();
            transport.on_point(port, move |point| {
                let Some(record) = assembler.lock().push(point) else {
                    return;
                };
                let port = record.port.clone();
                let sequence_no = record.sequence_no;
                let admitted = gate.admit(|ordinal, limit_reached| {
                    registry.dispatch(record);
                    let _ = events.send(CollectorEvent::Sweep {
                        port: port.clone(),
                        sequence_no,
                        ordinal,
                        limit_reached,
                    });
                });
                if !admitted {
                    debug!(port = %port, seq = sequence_no, "Gate closed, sweep dropped");
                }
            });
        }

        let assemblers = self.assemblers.clone();
        transport.on_protocol_violation(move |port, _| {
            if let Some(assembler) = assemblers.get(port) {
                assembler.lock().reset();
            }
        });

        let events = self.events_tx.clone();
        transport.on_fault(move |fault| {
            let _ = events.send(CollectorEvent::Fault(fault));
        });
    }

    /// Stop admitting sweeps the moment cancellation is seen.
    fn cancelled(&self) -> CollectionEnd {
        self.gate.close();
        CollectionEnd::Cancelled
    }

    async fn await_sweeps(
        &mut self,
        cancel: &mut watch::Receiver<bool>,
    ) -> VnaResult<CollectionEnd> {
        let first_sweep_timeout = self.config.acquisition.first_sweep_timeout();
        let first_sweep_deadline = Instant::now() + first_sweep_timeout;

        loop {
            if *cancel.borrow_and_update() {
                info!("Cancellation observed");
                return Ok(self.cancelled());
            }
            let waiting_for_first = self.phase() == LifecyclePhase::Starting;

            tokio::select! {
                biased;

                changed = cancel.changed() => {
                    if changed.is_err() {
                        info!("Cancellation handle dropped");
                        return Ok(self.cancelled());
                    }
                }

                event = self.events_rx.recv() => match event {
                    Some(CollectorEvent::Sweep { port, sequence_no, ordinal, limit_reached }) => {
                        if self.phase() == LifecyclePhase::Starting {
                            self.transition(LifecyclePhase::Collecting)?;
                        }
                        debug!(port = %port, seq = sequence_no, ordinal, "Sweep delivered");
                        if limit_reached {
                            info!(sweeps = ordinal, "Sweep limit reached");
                            return Ok(CollectionEnd::Completed);
                        }
                    }
                    Some(CollectorEvent::Fault(fault)) => {
                        return Err(VnaError::StreamLost {
                            port: fault.port.to_string(),
                            source: Box::new(fault.error),
                        });
                    }
                    None => return Err(VnaError::SessionClosed),
                },

                _ = tokio::time::sleep_until(first_sweep_deadline), if waiting_for_first => {
                    return Err(VnaError::Engine(format!(
                        "no complete sweep within {} ms of enabling continuous mode",
                        first_sweep_timeout.as_millis()
                    )));
                }
            }
        }
    }

    /// Disable streaming, close every connection, then stop the engine instance.
    async fn teardown(&mut self) {
        if let Some(transport) = self.transport.take() {
            if !transport.open_ports().await.is_empty() {
                let timeout = self.config.acquisition.command_timeout();
                if let Err(e) =
                    send(&transport.command(), &self.config.commands.continuous_off, timeout).await
                {
                    warn!("Could not disable continuous mode: {e}");
                }
            }
            transport.close_all().await;
        }
        self.stop_engine_instance().await;
    }

    async fn stop_engine_instance(&mut self) {
        if let Some(handle) = self.engine_handle.take() {
            if let Err(e) = self.engine.stop_engine(handle).await {
                warn!(%handle, "Failed to stop acquisition engine: {e}");
            }
        }
    }
}

async fn send(channel: &Arc<dyn CommandChannel>, command: &str, timeout: Duration) -> VnaResult<()> {
    match tokio::time::timeout(timeout, channel.write(command)).await {
        Ok(result) => result,
        Err(_) => Err(VnaError::CommandTimeout {
            command: command.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

async fn query(
    channel: &Arc<dyn CommandChannel>,
    command: &str,
    timeout: Duration,
) -> VnaResult<String> {
    match tokio::time::timeout(timeout, channel.query(command)).await {
        Ok(result) => result,
        Err(_) => Err(VnaError::CommandTimeout {
            command: command.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
