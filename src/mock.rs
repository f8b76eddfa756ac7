//! Simulated instrument for testing without hardware.
//!
//! `MockInstrument` plays both the acquisition engine process and the VNA behind it. It
//! provides an [`InstrumentLink`] and an [`EngineControl`] that share one simulated state:
//!
//! - Connections are refused while the engine is not running.
//! - `*IDN?` returns the identity string and `*OPC?` returns `1`.
//! - `SENS:FREQ:STAR`, `SENS:FREQ:STOP` and `SENS:SWE:POIN` change the sweep.
//! - While `INIT:CONT ON` is in effect each push connection streams sweeps. The first
//!   sweep on a connection starts halfway through, like attaching to a running instrument.
//!
//! Stopping the engine (or [`MockInstrument::crash_engine`]) ends every push stream with
//! EOF. Fault injection covers hanging commands, failing engine starts and malformed push
//! lines.

use crate::calibration::CalibrationMetadata;
use crate::config::VnaConfig;
use crate::error::{ConnectionError, VnaError, VnaResult};
use crate::lifecycle::{EngineControl, ProcessHandle};
use crate::measurement::PortId;
use crate::transport::wire::encode_point;
use crate::transport::{CommandChannel, InstrumentLink, PushStream};
use async_trait::async_trait;
use num_complex::Complex32;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::watch;

const DEFAULT_IDENTITY: &str = "MockVNA,SIM-2P,000001,1.0";
const DUPLEX_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct EngineState {
    running: Option<ProcessHandle>,
    continuous: bool,
}

struct MockState {
    identity: String,
    ports: Vec<PortId>,
    sweep_interval: Duration,
    sweep: Mutex<CalibrationMetadata>,
    engine: watch::Sender<EngineState>,
    next_handle: Mutex<u64>,
    engine_starts: Mutex<u64>,
    stopped: Mutex<Vec<ProcessHandle>>,
    commands: Mutex<Vec<String>>,
    hang_on: Mutex<Option<String>>,
    engine_fails: Mutex<bool>,
    malformed: Mutex<HashMap<PortId, u32>>,
}

impl MockState {
    fn running(&self) -> Option<ProcessHandle> {
        self.engine.borrow().running
    }

    fn refuse_unless_running(&self, what: &str) -> VnaResult<ProcessHandle> {
        self.running()
            .ok_or_else(|| ConnectionError::Refused(format!("mock {what}")).into())
    }

    fn take_malformed(&self, port: &PortId) -> bool {
        let mut malformed = self.malformed.lock();
        match malformed.get_mut(port) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Simulated acquisition engine plus VNA.
#[derive(Clone)]
pub struct MockInstrument {
    state: Arc<MockState>,
}

impl MockInstrument {
    /// Create an instrument with push ports `ports`, sweeping 101 points from 1 MHz to
    /// 3 GHz until reconfigured.
    pub fn new(ports: impl IntoIterator<Item = PortId>) -> Self {
        Self::with_settings(ports, DEFAULT_IDENTITY.to_string(), Duration::from_millis(5))
    }

    /// Create an instrument exposing the push ports named in `config`.
    pub fn from_config(config: &VnaConfig) -> Self {
        Self::new(config.ports())
    }

    fn with_settings(
        ports: impl IntoIterator<Item = PortId>,
        identity: String,
        sweep_interval: Duration,
    ) -> Self {
        let (engine, _) = watch::channel(EngineState::default());
        Self {
            state: Arc::new(MockState {
                identity,
                ports: ports.into_iter().collect(),
                sweep_interval,
                sweep: Mutex::new(CalibrationMetadata::new(1_000_000, 3_000_000_000, 101)),
                engine,
                next_handle: Mutex::new(1),
                engine_starts: Mutex::new(0),
                stopped: Mutex::new(Vec::new()),
                commands: Mutex::new(Vec::new()),
                hang_on: Mutex::new(None),
                engine_fails: Mutex::new(false),
                malformed: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Pause between consecutive sweeps on each push stream.
    pub fn with_sweep_interval(self, interval: Duration) -> Self {
        let ports = self.state.ports.clone();
        Self::with_settings(ports, self.state.identity.clone(), interval)
    }

    /// Reply to `*IDN?` with `identity`.
    pub fn with_identity(self, identity: impl Into<String>) -> Self {
        let ports = self.state.ports.clone();
        Self::with_settings(ports, identity.into(), self.state.sweep_interval)
    }

    /// Connections to the simulated instrument.
    pub fn link(&self) -> Arc<dyn InstrumentLink> {
        Arc::new(MockLink {
            state: self.state.clone(),
        })
    }

    /// Process control of the simulated engine.
    pub fn engine(&self) -> Arc<dyn EngineControl> {
        Arc::new(MockEngine {
            state: self.state.clone(),
        })
    }

    /// Never answer `command`; the caller's timeout has to fire.
    pub fn hang_on_command(&self, command: impl Into<String>) {
        *self.state.hang_on.lock() = Some(command.into());
    }

    /// Answer commands again after `hang_on_command`.
    pub fn release_hang(&self) {
        *self.state.hang_on.lock() = None;
    }

    /// Make every engine start fail.
    pub fn set_engine_fails(&self, fails: bool) {
        *self.state.engine_fails.lock() = fails;
    }

    /// Emit `count` undecodable lines on `port` before its next points.
    pub fn inject_malformed(&self, port: &PortId, count: u32) {
        *self.state.malformed.lock().entry(port.clone()).or_default() += count;
    }

    /// Let the engine die without a stop request.
    pub fn crash_engine(&self) {
        self.state.engine.send_replace(EngineState::default());
    }

    /// Successful and failed `start_engine` calls.
    pub fn engine_starts(&self) -> u64 {
        *self.state.engine_starts.lock()
    }

    /// Handles passed to `stop_engine`, in call order.
    pub fn stopped_handles(&self) -> Vec<ProcessHandle> {
        self.state.stopped.lock().clone()
    }

    /// Instance currently running, if any.
    pub fn running_handle(&self) -> Option<ProcessHandle> {
        self.state.running()
    }

    /// Whether continuous sweeping is enabled.
    pub fn is_continuous(&self) -> bool {
        self.state.engine.borrow().continuous
    }

    /// Current sweep settings as applied by SCPI commands.
    pub fn sweep(&self) -> CalibrationMetadata {
        *self.state.sweep.lock()
    }

    /// Every command and query received, in order.
    pub fn commands_received(&self) -> Vec<String> {
        self.state.commands.lock().clone()
    }
}

struct MockEngine {
    state: Arc<MockState>,
}

#[async_trait]
impl EngineControl for MockEngine {
    async fn start_engine(&self) -> VnaResult<ProcessHandle> {
        *self.state.engine_starts.lock() += 1;
        if *self.state.engine_fails.lock() {
            return Err(VnaError::Engine("simulated start failure".into()));
        }

        let handle = {
            let mut next = self.state.next_handle.lock();
            let handle = ProcessHandle(*next);
            *next += 1;
            handle
        };
        self.state.engine.send_replace(EngineState {
            running: Some(handle),
            continuous: false,
        });
        tracing::debug!(%handle, "Mock engine started");
        Ok(handle)
    }

    async fn stop_engine(&self, handle: ProcessHandle) -> VnaResult<()> {
        self.state.stopped.lock().push(handle);
        self.state.engine.send_if_modified(|engine| {
            if engine.running == Some(handle) {
                *engine = EngineState::default();
                true
            } else {
                false
            }
        });
        tracing::debug!(%handle, "Mock engine stopped");
        Ok(())
    }
}

struct MockLink {
    state: Arc<MockState>,
}

#[async_trait]
impl InstrumentLink for MockLink {
    fn describe(&self) -> String {
        "mock instrument".to_string()
    }

    async fn connect_command(&self) -> VnaResult<Arc<dyn CommandChannel>> {
        let instance = self.state.refuse_unless_running("command port")?;
        Ok(Arc::new(MockCommandChannel {
            state: self.state.clone(),
            instance,
        }))
    }

    async fn connect_push(&self, port: &PortId) -> VnaResult<PushStream> {
        let instance = self
            .state
            .refuse_unless_running(&format!("push port {port}"))?;
        if !self.state.ports.contains(port) {
            return Err(VnaError::Configuration(format!(
                "mock instrument has no push port {port}"
            )));
        }

        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        tokio::spawn(stream_sweeps(
            self.state.clone(),
            port.clone(),
            instance,
            server,
        ));
        Ok(Box::new(client))
    }
}

struct MockCommandChannel {
    state: Arc<MockState>,
    instance: ProcessHandle,
}

impl MockCommandChannel {
    async fn receive(&self, command: &str) -> VnaResult<()> {
        self.state.commands.lock().push(command.to_string());
        if self.state.running() != Some(self.instance) {
            return Err(ConnectionError::Reset("mock command port".into()).into());
        }
        let hangs = self.state.hang_on.lock().as_deref() == Some(command);
        if hangs {
            tracing::debug!(command, "Mock instrument ignoring command");
            futures::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl CommandChannel for MockCommandChannel {
    async fn write(&self, command: &str) -> VnaResult<()> {
        self.receive(command).await?;

        let mut parts = command.split_whitespace();
        let header = parts.next().unwrap_or_default().to_ascii_uppercase();
        let argument = parts.next();
        match (header.as_str(), argument) {
            ("INIT:CONT", Some(arg)) => {
                let on = arg.eq_ignore_ascii_case("ON") || arg == "1";
                self.state.engine.send_modify(|engine| engine.continuous = on);
            }
            ("SENS:FREQ:STAR", Some(arg)) => {
                self.state.sweep.lock().start_frequency_hz = parse_argument(command, arg)?;
            }
            ("SENS:FREQ:STOP", Some(arg)) => {
                self.state.sweep.lock().stop_frequency_hz = parse_argument(command, arg)?;
            }
            ("SENS:SWE:POIN", Some(arg)) => {
                self.state.sweep.lock().num_points = parse_argument(command, arg)?;
            }
            _ => tracing::debug!(command, "Mock instrument accepted command"),
        }
        Ok(())
    }

    async fn query(&self, query: &str) -> VnaResult<String> {
        self.receive(query).await?;
        match query.trim().to_ascii_uppercase().as_str() {
            "*IDN?" => Ok(self.state.identity.clone()),
            "*OPC?" => Ok("1".to_string()),
            other => Err(VnaError::Instrument(format!("unsupported query {other}"))),
        }
    }
}

fn parse_argument<T: std::str::FromStr>(command: &str, arg: &str) -> VnaResult<T> {
    arg.parse()
        .map_err(|_| VnaError::Instrument(format!("bad argument in '{command}'")))
}

/// Simulated reflection: a resonance notch at mid-band that drifts slowly per sweep.
fn s_parameter(index: usize, num_points: usize, sweep_no: u64) -> Complex32 {
    let x = index as f32 / num_points.max(2).saturating_sub(1) as f32;
    let centre = 0.5 + 0.02 * ((sweep_no % 50) as f32 / 50.0 - 0.5);
    let depth = 0.9 / (1.0 + ((x - centre) / 0.03).powi(2));
    Complex32::from_polar(1.0 - depth, -2.0 * PI * x)
}

async fn stream_sweeps(
    state: Arc<MockState>,
    port: PortId,
    instance: ProcessHandle,
    mut out: DuplexStream,
) {
    let mut engine = state.engine.subscribe();
    let mut sweep_no = 0u64;
    let mut first = true;

    loop {
        let current = *engine.borrow_and_update();
        if current.running != Some(instance) {
            tracing::debug!(port = %port, "Mock engine gone, closing push stream");
            return;
        }
        if !current.continuous {
            if engine.changed().await.is_err() {
                return;
            }
            continue;
        }

        let sweep = *state.sweep.lock();
        let start_index = if first { sweep.num_points / 2 } else { 0 };
        first = false;

        let mut buf = String::new();
        for index in start_index..sweep.num_points {
            if state.take_malformed(&port) {
                buf.push_str("not,a,point\n");
            }
            buf.push_str(&encode_point(
                index,
                sweep.frequency_at(index),
                s_parameter(index, sweep.num_points, sweep_no),
            ));
        }
        if out.write_all(buf.as_bytes()).await.is_err() {
            return;
        }
        sweep_no += 1;

        tokio::select! {
            _ = tokio::time::sleep(state.sweep_interval) => {}
            changed = engine.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
