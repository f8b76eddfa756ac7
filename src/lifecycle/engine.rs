//! Acquisition engine process control.
//!
//! The engine cannot change continuous-mode parameters while it is streaming, so a
//! collection always runs on a freshly cold-started instance. Only the lifecycle
//! controller starts or stops it.

use crate::config::EngineConfig;
use crate::error::{VnaError, VnaResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Opaque handle of one started engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle(pub u64);

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine#{}", self.0)
    }
}

/// Start/stop signalling for the acquisition engine.
#[async_trait]
pub trait EngineControl: Send + Sync {
    /// Start an instance. Safe to call when another instance may already be running.
    async fn start_engine(&self) -> VnaResult<ProcessHandle>;

    /// Stop an instance. Safe to call when the process has already exited.
    async fn stop_engine(&self, handle: ProcessHandle) -> VnaResult<()>;
}

/// Build the engine control described by `config`.
pub fn from_config(config: &EngineConfig) -> Arc<dyn EngineControl> {
    match &config.program {
        Some(program) => Arc::new(
            ProcessEngine::new(program.clone(), config.args.clone())
                .with_stop_timeout(config.stop_timeout()),
        ),
        None => Arc::new(UnmanagedEngine::default()),
    }
}

/// Engine run as a child process of this program.
pub struct ProcessEngine {
    program: PathBuf,
    args: Vec<String>,
    stop_timeout: Duration,
    children: Mutex<HashMap<u64, Child>>,
    next_id: AtomicU64,
}

impl ProcessEngine {
    /// Run `program` with `args` on every start.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            stop_timeout: Duration::from_secs(5),
            children: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// How long `stop_engine` waits for the process to exit.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

#[async_trait]
impl EngineControl for ProcessEngine {
    async fn start_engine(&self) -> VnaResult<ProcessHandle> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                VnaError::Engine(format!("failed to spawn {}: {}", self.program.display(), e))
            })?;

        let handle = ProcessHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::info!(
            %handle,
            pid = child.id(),
            program = %self.program.display(),
            "Started acquisition engine"
        );
        self.children.lock().await.insert(handle.0, child);
        Ok(handle)
    }

    async fn stop_engine(&self, handle: ProcessHandle) -> VnaResult<()> {
        let Some(mut child) = self.children.lock().await.remove(&handle.0) else {
            tracing::debug!(%handle, "Engine already stopped");
            return Ok(());
        };

        if let Some(status) = child.try_wait()? {
            tracing::info!(%handle, %status, "Engine had already exited");
            return Ok(());
        }

        if let Err(e) = child.start_kill() {
            // InvalidInput means the process exited between try_wait and kill
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(VnaError::Engine(format!("failed to kill {}: {}", handle, e)));
            }
        }

        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(%handle, %status, "Stopped acquisition engine");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(VnaError::Engine(format!(
                "{} did not exit within {} ms",
                handle,
                self.stop_timeout.as_millis()
            ))),
        }
    }
}

/// Engine supervised outside this program. Start and stop only hand out handles.
#[derive(Default)]
pub struct UnmanagedEngine {
    next_id: AtomicU64,
}

#[async_trait]
impl EngineControl for UnmanagedEngine {
    async fn start_engine(&self) -> VnaResult<ProcessHandle> {
        let handle = ProcessHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%handle, "Engine is managed externally; nothing to start");
        Ok(handle)
    }

    async fn stop_engine(&self, handle: ProcessHandle) -> VnaResult<()> {
        tracing::debug!(%handle, "Engine is managed externally; nothing to stop");
        Ok(())
    }
}
