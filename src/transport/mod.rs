//! Instrument transport: one SCPI command connection plus one push connection per port.
//!
//! Each open push channel runs a background receive loop for the connection's lifetime.
//! Decoded points are handed to every handler registered for the port, in registration
//! order. A loop ends only on explicit close or on an unrecoverable read error, which is
//! reported exactly once through the fault handler and never retried silently.

mod scpi;
mod tcp;
pub mod wire;

pub use scpi::{CommandChannel, ScpiClient, DEFAULT_TIMEOUT_MS};
pub use tcp::TcpLink;

use crate::error::{ConnectionError, VnaError, VnaResult};
use crate::measurement::{PointMessage, PortId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// Byte stream of a push channel.
pub type PushStream = Box<dyn AsyncRead + Send + Unpin>;

/// Invoked for every decoded point on a port.
pub type PointHandler = Arc<dyn Fn(&PointMessage) + Send + Sync>;

/// Invoked when a push line cannot be decoded.
pub type ViolationHandler = Arc<dyn Fn(&PortId, &VnaError) + Send + Sync>;

/// Invoked once when a push connection fails for good.
pub type FaultHandler = Arc<dyn Fn(TransportFault) + Send + Sync>;

/// Endpoints of one instrument.
///
/// Implemented over TCP by [`TcpLink`] and by the simulated instrument in
/// [`crate::mock`].
#[async_trait]
pub trait InstrumentLink: Send + Sync {
    /// Human readable address, used in logs.
    fn describe(&self) -> String;

    /// Open the command/response connection.
    async fn connect_command(&self) -> VnaResult<Arc<dyn CommandChannel>>;

    /// Open the push-data connection of `port`.
    async fn connect_push(&self, port: &PortId) -> VnaResult<PushStream>;
}

/// Unrecoverable failure of one push connection.
#[derive(Debug)]
pub struct TransportFault {
    /// Port whose connection failed.
    pub port: PortId,
    /// What ended the connection.
    pub error: VnaError,
}

#[derive(Default)]
struct Handlers {
    points: RwLock<HashMap<PortId, Vec<PointHandler>>>,
    violations: RwLock<Vec<ViolationHandler>>,
    fault: RwLock<Option<FaultHandler>>,
}

impl Handlers {
    fn point_snapshot(&self, port: &PortId) -> Vec<PointHandler> {
        self.points.read().get(port).cloned().unwrap_or_default()
    }

    fn violation_snapshot(&self) -> Vec<ViolationHandler> {
        self.violations.read().clone()
    }

    fn report_fault(&self, fault: TransportFault) {
        let handler = self.fault.read().clone();
        match handler {
            Some(handler) => handler(fault),
            None => tracing::error!(
                port = %fault.port,
                "Push channel failed with no fault handler: {}",
                fault.error
            ),
        }
    }
}

struct PushChannel {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Connected instrument transport.
pub struct Transport {
    link: Arc<dyn InstrumentLink>,
    command: Arc<dyn CommandChannel>,
    handlers: Arc<Handlers>,
    channels: Mutex<HashMap<PortId, PushChannel>>,
}

impl Transport {
    /// Establish the command connection.
    pub async fn connect(link: Arc<dyn InstrumentLink>) -> VnaResult<Self> {
        let command = link.connect_command().await?;
        tracing::debug!("Command channel open to {}", link.describe());
        Ok(Self {
            link,
            command,
            handlers: Arc::new(Handlers::default()),
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// The command/response connection.
    pub fn command(&self) -> Arc<dyn CommandChannel> {
        self.command.clone()
    }

    /// Register a point handler for `port`. Handlers run on the receive task.
    pub fn on_point<F>(&self, port: &PortId, handler: F)
    where
        F: Fn(&PointMessage) + Send + Sync + 'static,
    {
        self.handlers
            .points
            .write()
            .entry(port.clone())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Call `handler` for every push line that cannot be decoded.
    pub fn on_protocol_violation<F>(&self, handler: F)
    where
        F: Fn(&PortId, &VnaError) + Send + Sync + 'static,
    {
        self.handlers.violations.write().push(Arc::new(handler));
    }

    /// Set the handler that receives unrecoverable push-channel failures.
    pub fn on_fault<F>(&self, handler: F)
    where
        F: Fn(TransportFault) + Send + Sync + 'static,
    {
        *self.handlers.fault.write() = Some(Arc::new(handler));
    }

    /// Open the push channel of `port`.
    ///
    /// Idempotent: if the channel is already open this is a no-op success. A channel
    /// whose receive loop has ended is opened again.
    pub async fn open_push_channel(&self, port: &PortId) -> VnaResult<()> {
        let mut channels = self.channels.lock().await;
        if let Some(existing) = channels.get(port) {
            if !existing.task.is_finished() {
                tracing::debug!(port = %port, "Push channel already open");
                return Ok(());
            }
            channels.remove(port);
        }

        let stream = self.link.connect_push(port).await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(receive_loop(
            port.clone(),
            stream,
            self.handlers.clone(),
            shutdown_rx,
        ));

        tracing::info!(port = %port, "Opened push channel");
        channels.insert(
            port.clone(),
            PushChannel {
                shutdown: Some(shutdown_tx),
                task,
            },
        );
        Ok(())
    }

    /// Ports whose receive loop is still running.
    pub async fn open_ports(&self) -> Vec<PortId> {
        let channels = self.channels.lock().await;
        let mut ports: Vec<PortId> = channels
            .iter()
            .filter(|(_, channel)| !channel.task.is_finished())
            .map(|(port, _)| port.clone())
            .collect();
        ports.sort();
        ports
    }

    /// Close one push channel and wait for its receive loop to finish.
    pub async fn close_push_channel(&self, port: &PortId) {
        let channel = self.channels.lock().await.remove(port);
        if let Some(channel) = channel {
            stop_channel(port, channel).await;
        }
    }

    /// Close every push channel. No handler runs after this returns.
    pub async fn close_all(&self) {
        let drained: Vec<(PortId, PushChannel)> = self.channels.lock().await.drain().collect();
        for (port, channel) in drained {
            stop_channel(&port, channel).await;
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Ok(channels) = self.channels.try_lock() {
            for channel in channels.values() {
                channel.task.abort();
            }
        }
    }
}

async fn stop_channel(port: &PortId, mut channel: PushChannel) {
    if let Some(shutdown) = channel.shutdown.take() {
        let _ = shutdown.send(());
    }
    if let Err(e) = channel.task.await {
        if e.is_panic() {
            tracing::error!(port = %port, "Push receive loop panicked");
        }
    }
    tracing::info!(port = %port, "Closed push channel");
}

async fn receive_loop(
    port: PortId,
    stream: PushStream,
    handlers: Arc<Handlers>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::debug!(port = %port, "Receive loop shut down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match wire::decode_point(&port, &line) {
                        Ok(point) => {
                            for handler in handlers.point_snapshot(&port) {
                                handler(&point);
                            }
                        }
                        Err(err) => {
                            tracing::warn!(port = %port, "Dropping malformed push message: {}", err);
                            for handler in handlers.violation_snapshot() {
                                handler(&port, &err);
                            }
                        }
                    }
                }
                Ok(None) => {
                    handlers.report_fault(TransportFault {
                        port: port.clone(),
                        error: ConnectionError::Reset(format!("push channel {}", port)).into(),
                    });
                    break;
                }
                Err(e) => {
                    handlers.report_fault(TransportFault {
                        port: port.clone(),
                        error: ConnectionError::from_io(&format!("push channel {}", port), &e).into(),
                    });
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::wire::encode_point;
    use num_complex::Complex32;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    /// Link whose push channels are in-memory pipes handed back to the test.
    struct PipeLink {
        writers: parking_lot::Mutex<Vec<(PortId, DuplexStream)>>,
        push_connects: AtomicUsize,
    }

    struct NullCommand;

    #[async_trait]
    impl CommandChannel for NullCommand {
        async fn write(&self, _command: &str) -> VnaResult<()> {
            Ok(())
        }
        async fn query(&self, _query: &str) -> VnaResult<String> {
            Ok("1".into())
        }
    }

    #[async_trait]
    impl InstrumentLink for PipeLink {
        fn describe(&self) -> String {
            "pipe".into()
        }

        async fn connect_command(&self) -> VnaResult<Arc<dyn CommandChannel>> {
            Ok(Arc::new(NullCommand))
        }

        async fn connect_push(&self, port: &PortId) -> VnaResult<PushStream> {
            self.push_connects.fetch_add(1, Ordering::SeqCst);
            let (reader, writer) = tokio::io::duplex(4096);
            self.writers.lock().push((port.clone(), writer));
            Ok(Box::new(reader))
        }
    }

    fn pipe_link() -> Arc<PipeLink> {
        Arc::new(PipeLink {
            writers: parking_lot::Mutex::new(Vec::new()),
            push_connects: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn opening_twice_is_a_noop() {
        let link = pipe_link();
        let transport = Transport::connect(link.clone()).await.unwrap();
        let port = PortId::new("S11");

        transport.open_push_channel(&port).await.unwrap();
        transport.open_push_channel(&port).await.unwrap();

        assert_eq!(link.push_connects.load(Ordering::SeqCst), 1);
        assert_eq!(transport.open_ports().await, vec![port]);
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let link = pipe_link();
        let transport = Transport::connect(link.clone()).await.unwrap();
        let port = PortId::new("S21");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let first = tx.clone();
        transport.on_point(&port, move |p| {
            let _ = first.send(("first", p.point_index));
        });
        transport.on_point(&port, move |p| {
            let _ = tx.send(("second", p.point_index));
        });
        transport.open_push_channel(&port).await.unwrap();

        let (_, mut writer) = link.writers.lock().pop().unwrap();
        writer
            .write_all(encode_point(7, 1_000, Complex32::new(0.5, 0.0)).as_bytes())
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(("first", 7)));
        assert_eq!(rx.recv().await, Some(("second", 7)));
    }

    #[tokio::test]
    async fn eof_is_reported_once_as_reset() {
        let link = pipe_link();
        let transport = Transport::connect(link.clone()).await.unwrap();
        let port = PortId::new("S11");

        let faults = Arc::new(AtomicUsize::new(0));
        let counter = faults.clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        transport.on_fault(move |fault| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(fault);
        });
        transport.open_push_channel(&port).await.unwrap();

        drop(link.writers.lock().pop());

        let fault = rx.recv().await.unwrap();
        assert_eq!(fault.port, port);
        assert!(matches!(
            fault.error,
            VnaError::Connection(ConnectionError::Reset(_))
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(faults.load(Ordering::SeqCst), 1);
        assert!(transport.open_ports().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_line_reaches_violation_handler() {
        let link = pipe_link();
        let transport = Transport::connect(link.clone()).await.unwrap();
        let port = PortId::new("S11");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        transport.on_protocol_violation(move |port, err| {
            let _ = tx.send((port.clone(), err.kind()));
        });
        transport.open_push_channel(&port).await.unwrap();

        let (_, mut writer) = link.writers.lock().pop().unwrap();
        writer.write_all(b"garbage\n").await.unwrap();

        let (violating, kind) = rx.recv().await.unwrap();
        assert_eq!(violating, port);
        assert_eq!(kind, crate::error::ErrorKind::ProtocolViolation);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn malformed_line_is_logged_as_warning() {
        let (reader, mut writer) = tokio::io::duplex(256);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        writer.write_all(b"0,100,nan-ish,0\n").await.unwrap();
        drop(writer);

        // Run the loop on this task so its events land in the test span
        receive_loop(
            PortId::new("S21"),
            Box::new(reader),
            Arc::new(Handlers::default()),
            shutdown_rx,
        )
        .await;

        assert!(logs_contain("Dropping malformed push message"));
    }

    #[tokio::test]
    async fn close_all_stops_without_fault() {
        let link = pipe_link();
        let transport = Transport::connect(link.clone()).await.unwrap();
        let faults = Arc::new(AtomicUsize::new(0));
        let counter = faults.clone();
        transport.on_fault(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        transport.open_push_channel(&PortId::new("S11")).await.unwrap();
        transport.open_push_channel(&PortId::new("S21")).await.unwrap();
        transport.close_all().await;

        assert!(transport.open_ports().await.is_empty());
        // Writers dropping after close must not produce a fault
        link.writers.lock().clear();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(faults.load(Ordering::SeqCst), 0);
    }
}
