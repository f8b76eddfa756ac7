//! TCP endpoints of a networked analyzer.

use super::scpi::{open_stream, CommandChannel, ScpiClient};
use super::{InstrumentLink, PushStream};
use crate::config::{AcquisitionConfig, InstrumentConfig};
use crate::error::{VnaError, VnaResult};
use crate::measurement::PortId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Command server and per-port push servers on one host.
#[derive(Debug, Clone)]
pub struct TcpLink {
    host: String,
    command_port: u16,
    push_ports: HashMap<PortId, u16>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl TcpLink {
    /// Command server at `host:command_port`, no push ports yet.
    pub fn new(host: impl Into<String>, command_port: u16) -> Self {
        Self {
            host: host.into(),
            command_port,
            push_ports: HashMap::new(),
            connect_timeout: Duration::from_secs(3),
            command_timeout: Duration::from_millis(super::DEFAULT_TIMEOUT_MS),
        }
    }

    /// Endpoints and timeouts from the loaded configuration.
    pub fn from_config(instrument: &InstrumentConfig, acquisition: &AcquisitionConfig) -> Self {
        let mut link = Self::new(instrument.host.clone(), instrument.command_port)
            .with_connect_timeout(instrument.connect_timeout())
            .with_command_timeout(acquisition.command_timeout());
        for (port, tcp_port) in &instrument.push_ports {
            link = link.with_push_port(PortId::new(port.as_str()), *tcp_port);
        }
        link
    }

    /// Serve `port` from `tcp_port` on the same host.
    pub fn with_push_port(mut self, port: PortId, tcp_port: u16) -> Self {
        self.push_ports.insert(port, tcp_port);
        self
    }

    /// Bound on establishing each connection.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound on each SCPI round trip.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn endpoint(&self, tcp_port: u16) -> String {
        format!("{}:{}", self.host, tcp_port)
    }
}

#[async_trait]
impl InstrumentLink for TcpLink {
    fn describe(&self) -> String {
        self.endpoint(self.command_port)
    }

    async fn connect_command(&self) -> VnaResult<Arc<dyn CommandChannel>> {
        let client = ScpiClient::connect(&self.endpoint(self.command_port), self.connect_timeout)
            .await?
            .with_timeout(self.command_timeout);
        Ok(Arc::new(client))
    }

    async fn connect_push(&self, port: &PortId) -> VnaResult<PushStream> {
        let tcp_port = self.push_ports.get(port).ok_or_else(|| {
            VnaError::Configuration(format!("No push port configured for {}", port))
        })?;
        let endpoint = self.endpoint(*tcp_port);
        let stream = open_stream(&endpoint, self.connect_timeout).await?;
        tracing::debug!(port = %port, "Connected push stream at {}", endpoint);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VnaConfig;

    #[test]
    fn builds_endpoints_from_config() {
        let config = VnaConfig::default();
        let link = TcpLink::from_config(&config.instrument, &config.acquisition);
        assert_eq!(link.describe(), "127.0.0.1:5025");
        assert_eq!(link.push_ports.get(&PortId::new("S21")), Some(&5027));
    }

    #[tokio::test]
    async fn unknown_port_is_a_configuration_error() {
        let link = TcpLink::new("127.0.0.1", 5025);
        let result = link.connect_push(&PortId::new("S99")).await;
        assert!(matches!(result, Err(VnaError::Configuration(_))));
    }
}
