//! Acquisition session: the lifecycle worker task and the consumer-side handle.
//!
//! [`AcquisitionSession::spawn`] moves a [`SweepLifecycleController`] onto a dedicated
//! tokio task. Every probe, cold start and SCPI round trip happens there. The consumer
//! talks to it through a [`SessionHandle`]:
//!
//! - commands travel over an mpsc channel and are answered on oneshot replies,
//! - cancellation is a `watch` flag the worker checks at its safe points,
//! - completed sweeps arrive through the [`CrossThreadDispatcher`], drained at the
//!   consumer's own pace.
//!
//! The worker probes as soon as it starts. Transient probe failures are retried every
//! `acquisition.probe_retry_interval_ms`. Fatal failures are reported to the
//! `on_fatal_error` callbacks and wait for an explicit [`SessionHandle::probe`].

use crate::calibration::CalibrationMetadata;
use crate::config::VnaConfig;
use crate::dispatcher::CrossThreadDispatcher;
use crate::error::{ErrorKind, VnaError, VnaResult};
use crate::lifecycle::{
    engine, CollectionSummary, EngineControl, LifecyclePhase, SweepLifecycleController,
};
use crate::mock::MockInstrument;
use crate::registry::CallbackRegistry;
use crate::transport::{InstrumentLink, TcpLink};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

/// Receives the kind of every fatal session error.
pub type FatalErrorHandler = Arc<dyn Fn(ErrorKind) + Send + Sync>;

enum SessionCommand {
    Probe {
        reply: oneshot::Sender<VnaResult<String>>,
    },
    BeginCollection {
        total_sweeps: Option<u64>,
        reply: oneshot::Sender<VnaResult<CollectionTicket>>,
    },
    ReloadCalibration {
        calibration: CalibrationMetadata,
        reply: oneshot::Sender<VnaResult<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Completion of an accepted collection.
#[derive(Debug)]
pub struct CollectionTicket {
    done: oneshot::Receiver<VnaResult<CollectionSummary>>,
}

impl CollectionTicket {
    /// Wait until the collection ended and the session left `Stopping`.
    pub async fn finished(self) -> VnaResult<CollectionSummary> {
        self.done.await.map_err(|_| VnaError::SessionClosed)?
    }
}

/// Session builder.
pub struct AcquisitionSession {
    config: VnaConfig,
    link: Arc<dyn InstrumentLink>,
    engine: Arc<dyn EngineControl>,
    calibration: Option<CalibrationMetadata>,
}

impl AcquisitionSession {
    /// Session over `link` and `engine`; nothing runs until [`spawn`](Self::spawn).
    pub fn new(
        config: VnaConfig,
        link: Arc<dyn InstrumentLink>,
        engine: Arc<dyn EngineControl>,
    ) -> Self {
        Self {
            config,
            link,
            engine,
            calibration: None,
        }
    }

    /// Build the link and engine control the configuration asks for.
    pub fn from_config(config: VnaConfig) -> Self {
        if config.instrument.mock {
            info!("Using simulated instrument");
            let mock = MockInstrument::from_config(&config);
            let (link, engine) = (mock.link(), mock.engine());
            return Self::new(config, link, engine);
        }
        let link: Arc<dyn InstrumentLink> =
            Arc::new(TcpLink::from_config(&config.instrument, &config.acquisition));
        let engine = engine::from_config(&config.engine);
        Self::new(config, link, engine)
    }

    /// Use `calibration` instead of reading `acquisition.calibration_path`.
    pub fn with_calibration(mut self, calibration: CalibrationMetadata) -> Self {
        self.calibration = Some(calibration);
        self
    }

    /// Validate the configuration, start the worker and probe the instrument.
    pub fn spawn(self) -> VnaResult<SessionHandle> {
        self.config.validate()?;
        let calibration = match (self.calibration, &self.config.acquisition.calibration_path) {
            (Some(calibration), _) => Some(calibration),
            (None, Some(path)) => Some(CalibrationMetadata::load_from(path)?),
            (None, None) => {
                warn!("No calibration configured; collection stays unavailable until one is loaded");
                None
            }
        };

        let session_id = Uuid::new_v4();
        let registry = Arc::new(CallbackRegistry::new());
        let dispatcher = Arc::new(CrossThreadDispatcher::new());
        for port in self.config.ports() {
            let dispatcher = dispatcher.clone();
            registry.register(&port, move |record| dispatcher.publish(record));
        }

        let retry_interval = self.config.acquisition.probe_retry_interval();
        let mut controller =
            SweepLifecycleController::new(self.config, self.link, self.engine, registry.clone());
        if let Some(calibration) = calibration {
            controller.set_calibration(calibration)?;
        }
        let phase = controller.subscribe_phase();

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let fatal_handlers: Arc<Mutex<Vec<FatalErrorHandler>>> = Arc::default();

        let worker = SessionWorker {
            controller,
            commands: commands_rx,
            cancel: cancel_rx,
            phase: phase.clone(),
            fatal_handlers: fatal_handlers.clone(),
            retry_interval,
            retry_at: None,
        };
        let span = tracing::info_span!("session", id = %session_id);
        let task = tokio::spawn(worker.run().instrument(span));
        info!(session = %session_id, "Acquisition session started");

        Ok(SessionHandle {
            session_id,
            commands: commands_tx,
            cancel: cancel_tx,
            phase,
            dispatcher,
            registry,
            fatal_handlers,
            task: Some(task),
        })
    }
}

/// Consumer-side handle of a running session.
pub struct SessionHandle {
    session_id: Uuid,
    commands: mpsc::Sender<SessionCommand>,
    cancel: watch::Sender<bool>,
    phase: watch::Receiver<LifecyclePhase>,
    dispatcher: Arc<CrossThreadDispatcher>,
    registry: Arc<CallbackRegistry>,
    fatal_handlers: Arc<Mutex<Vec<FatalErrorHandler>>>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Identifier used in log fields.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Last phase published by the worker.
    pub fn phase(&self) -> LifecyclePhase {
        *self.phase.borrow()
    }

    /// Observe phase transitions.
    pub fn subscribe_phase(&self) -> watch::Receiver<LifecyclePhase> {
        self.phase.clone()
    }

    /// Wait until the session reaches `target`, for at most `timeout`.
    pub async fn wait_for_phase(&self, target: LifecyclePhase, timeout: Duration) -> VnaResult<()> {
        let mut phase = self.phase.clone();
        let wait = async {
            loop {
                if *phase.borrow_and_update() == target {
                    return Ok::<(), VnaError>(());
                }
                phase.changed().await.map_err(|_| VnaError::SessionClosed)?;
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            VnaError::PreconditionFailed(format!(
                "session did not reach {target} within {} ms (currently {})",
                timeout.as_millis(),
                self.phase()
            ))
        })?
    }

    /// Latest-wins mailbox of completed sweeps.
    pub fn dispatcher(&self) -> Arc<CrossThreadDispatcher> {
        self.dispatcher.clone()
    }

    /// Listener registry, for consumers that want every sweep rather than the latest.
    pub fn registry(&self) -> Arc<CallbackRegistry> {
        self.registry.clone()
    }

    /// Call `handler` with the kind of every error that is not retried automatically.
    pub fn on_fatal_error<F>(&self, handler: F)
    where
        F: Fn(ErrorKind) + Send + Sync + 'static,
    {
        self.fatal_handlers.lock().push(Arc::new(handler));
    }

    /// Probe now, cancelling any scheduled retry.
    pub async fn probe(&self) -> VnaResult<String> {
        let (reply, rx) = oneshot::channel();
        self.request(SessionCommand::Probe { reply }, rx).await?
    }

    /// Begin a collection of `total_sweeps` sweeps, or until cancelled when `None`.
    ///
    /// Returns once the request is accepted; precondition failures are returned here.
    pub async fn begin_collection(&self, total_sweeps: Option<u64>) -> VnaResult<CollectionTicket> {
        self.cancel.send_replace(false);
        let (reply, rx) = oneshot::channel();
        self.request(SessionCommand::BeginCollection { total_sweeps, reply }, rx)
            .await?
    }

    /// Request cancellation of the running collection. Never blocks.
    pub fn cancel(&self) {
        info!(session = %self.session_id, "Cancellation requested");
        self.cancel.send_replace(true);
    }

    /// Replace the calibration and reconfigure every assembler. Rejected while busy.
    pub async fn reload_calibration(&self, calibration: CalibrationMetadata) -> VnaResult<()> {
        let (reply, rx) = oneshot::channel();
        self.request(SessionCommand::ReloadCalibration { calibration, reply }, rx)
            .await?
    }

    /// Cancel any collection, tear the engine down and stop the worker.
    pub async fn shutdown(mut self) -> VnaResult<()> {
        self.cancel.send_replace(true);
        let (reply, rx) = oneshot::channel();
        let result = self.request(SessionCommand::Shutdown { reply }, rx).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Session worker ended abnormally: {e}");
            }
        }
        result
    }

    async fn request<T>(&self, command: SessionCommand, reply: oneshot::Receiver<T>) -> VnaResult<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| VnaError::SessionClosed)?;
        reply.await.map_err(|_| VnaError::SessionClosed)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

struct SessionWorker {
    controller: SweepLifecycleController,
    commands: mpsc::Receiver<SessionCommand>,
    cancel: watch::Receiver<bool>,
    phase: watch::Receiver<LifecyclePhase>,
    fatal_handlers: Arc<Mutex<Vec<FatalErrorHandler>>>,
    retry_interval: Duration,
    retry_at: Option<Instant>,
}

impl SessionWorker {
    async fn run(mut self) {
        let _ = self.probe().await;

        let mut shutdown_reply = None;
        while shutdown_reply.is_none() {
            let retry_at = self.retry_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown { reply }) => shutdown_reply = Some(reply),
                    Some(command) => shutdown_reply = self.handle(command).await,
                    None => break,
                },
                _ = sleep_until_opt(retry_at), if retry_at.is_some() => {
                    self.retry_at = None;
                    info!("Retrying probe");
                    let _ = self.probe().await;
                }
            }
        }

        self.controller.shutdown().await;
        info!("Acquisition session stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    /// Returns the reply channel of a shutdown received while collecting.
    async fn handle(&mut self, command: SessionCommand) -> Option<oneshot::Sender<()>> {
        match command {
            SessionCommand::Probe { reply } => {
                self.retry_at = None;
                let _ = reply.send(self.probe().await);
                None
            }
            SessionCommand::ReloadCalibration { calibration, reply } => {
                let _ = reply.send(self.controller.set_calibration(calibration));
                None
            }
            SessionCommand::BeginCollection {
                total_sweeps,
                reply,
            } => self.collect(total_sweeps, reply).await,
            SessionCommand::Shutdown { reply } => Some(reply),
        }
    }

    async fn probe(&mut self) -> VnaResult<String> {
        let result = self.controller.probe().await;
        if let Err(e) = &result {
            self.after_failure(e);
        }
        result
    }

    async fn collect(
        &mut self,
        total_sweeps: Option<u64>,
        reply: oneshot::Sender<VnaResult<CollectionTicket>>,
    ) -> Option<oneshot::Sender<()>> {
        if let Err(e) = self.controller.check_preconditions() {
            warn!("Collection rejected: {e}");
            let _ = reply.send(Err(e));
            return None;
        }
        if total_sweeps == Some(0) {
            let _ = reply.send(Err(VnaError::PreconditionFailed(
                "total_sweeps must be positive".into(),
            )));
            return None;
        }

        let (done_tx, done) = oneshot::channel();
        let _ = reply.send(Ok(CollectionTicket { done }));

        let mut shutdown_reply = None;
        let mut commands_open = true;
        let result = {
            let phase = self.phase.clone();
            let collection = self.controller.collect(total_sweeps, &mut self.cancel);
            tokio::pin!(collection);
            loop {
                tokio::select! {
                    result = &mut collection => break result,
                    command = self.commands.recv(), if commands_open && shutdown_reply.is_none() => {
                        match command {
                            Some(SessionCommand::Shutdown { reply }) => shutdown_reply = Some(reply),
                            Some(other) => reject_busy(other, *phase.borrow()),
                            None => commands_open = false,
                        }
                    }
                }
            }
        };

        match &result {
            Ok(summary) => info!(
                sweeps = summary.sweeps_delivered,
                ending = ?summary.ending,
                "Collection complete"
            ),
            Err(e) => self.after_failure(e),
        }
        let _ = done_tx.send(result);
        shutdown_reply
    }

    /// Schedule a retry for transient failures that left the session idle; report the
    /// rest as fatal.
    fn after_failure(&mut self, e: &VnaError) {
        if self.controller.phase() != LifecyclePhase::Idle {
            return;
        }
        if e.is_recoverable() {
            warn!(
                retry_in_ms = self.retry_interval.as_millis() as u64,
                "Session idle after transient failure: {e}"
            );
            self.retry_at = Some(Instant::now() + self.retry_interval);
            return;
        }

        let kind = e.kind();
        error!(kind = %kind, "Fatal session error: {e}");
        self.retry_at = None;
        let handlers = self.fatal_handlers.lock().clone();
        for handler in handlers {
            handler(kind);
        }
    }
}

fn reject_busy(command: SessionCommand, phase: LifecyclePhase) {
    let busy = || VnaError::PreconditionFailed(format!("session is busy ({phase})"));
    match command {
        SessionCommand::Probe { reply } => {
            let _ = reply.send(Err(busy()));
        }
        SessionCommand::BeginCollection { reply, .. } => {
            let _ = reply.send(Err(busy()));
        }
        SessionCommand::ReloadCalibration { reply, .. } => {
            let _ = reply.send(Err(busy()));
        }
        SessionCommand::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
