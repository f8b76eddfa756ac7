//! SCPI over TCP command channel
//!
//! The acquisition engine hosts a line-oriented SCPI server. This module provides the
//! `CommandChannel` seam used by the lifecycle controller and its TCP implementation,
//! `ScpiClient`, which handles connection setup, writes, and queries with a bounded
//! response timeout.

use crate::error::{ConnectionError, VnaError, VnaResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Default command timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Command/response operations against the instrument.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Send a command without expecting a response.
    async fn write(&self, command: &str) -> VnaResult<()>;

    /// Send a query and return the trimmed response line.
    async fn query(&self, query: &str) -> VnaResult<String>;
}

/// Async SCPI client for TCP communication with the acquisition engine
pub struct ScpiClient {
    endpoint: String,
    stream: Mutex<BufReader<TcpStream>>,
    timeout: Duration,
}

/// Open a TCP connection to `endpoint`, mapping failures to [`ConnectionError`].
pub(crate) async fn open_stream(endpoint: &str, connect_timeout: Duration) -> VnaResult<TcpStream> {
    let stream = timeout(connect_timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| ConnectionError::Timeout(endpoint.to_string()))?
        .map_err(|e| ConnectionError::from_io(endpoint, &e))?;

    // Disable Nagle's algorithm for low latency
    stream.set_nodelay(true)?;
    Ok(stream)
}

impl ScpiClient {
    /// Connect to the SCPI server at `endpoint` (`host:port`).
    pub async fn connect(endpoint: &str, connect_timeout: Duration) -> VnaResult<Self> {
        let stream = open_stream(endpoint, connect_timeout).await?;
        tracing::info!("Connected to SCPI server at {}", endpoint);

        Ok(Self {
            endpoint: endpoint.to_string(),
            stream: Mutex::new(BufReader::new(stream)),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        })
    }

    /// Set the command timeout duration.
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout = duration;
        self
    }

    /// Address this client is connected to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn timed_out(&self, command: &str) -> VnaError {
        VnaError::CommandTimeout {
            command: command.to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    async fn send_line(&self, stream: &mut BufReader<TcpStream>, command: &str) -> VnaResult<()> {
        let line = format!("{}\n", command);
        let io = async {
            stream.get_mut().write_all(line.as_bytes()).await?;
            stream.get_mut().flush().await
        };
        match timeout(self.timeout, io).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::from_io(&self.endpoint, &e).into()),
            Err(_) => Err(self.timed_out(command)),
        }
    }

    /// Drop any unsolicited bytes already sitting in the read buffer.
    fn discard_buffered(stream: &mut BufReader<TcpStream>) {
        let len = stream.buffer().len();
        if len > 0 {
            tracing::debug!("Discarding {} stale bytes from SCPI buffer", len);
            stream.consume(len);
        }
    }
}

#[async_trait]
impl CommandChannel for ScpiClient {
    async fn write(&self, command: &str) -> VnaResult<()> {
        let mut stream = self.stream.lock().await;
        tracing::debug!("SCPI write: {:?}", command);
        self.send_line(&mut stream, command).await
    }

    async fn query(&self, query: &str) -> VnaResult<String> {
        let mut stream = self.stream.lock().await;
        Self::discard_buffered(&mut stream);

        tracing::debug!("SCPI query: {:?}", query);
        self.send_line(&mut stream, query).await?;

        let mut response = String::new();
        match timeout(self.timeout, stream.read_line(&mut response)).await {
            Ok(Ok(0)) => Err(ConnectionError::Reset(self.endpoint.clone()).into()),
            Ok(Ok(_)) => {
                let trimmed = response.trim().to_string();
                tracing::debug!("SCPI response: {:?}", trimmed);
                Ok(trimmed)
            }
            Ok(Err(e)) => Err(ConnectionError::from_io(&self.endpoint, &e).into()),
            Err(_) => Err(self.timed_out(query)),
        }
    }
}
