//! Custom error types for the streaming engine.
//!
//! This module defines the primary error type, `VnaError`, shared by the transport,
//! the sweep assembler, the lifecycle controller and the session worker. Using the
//! `thiserror` crate it provides one consistent way to describe everything that can go
//! wrong between the SCPI socket and the consumer.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: refused, timed out or reset sockets. Recoverable by retry/re-probe.
//! - **`CommandTimeout`**: a SCPI round trip did not complete in time. Surfaces to the
//!   lifecycle state machine as a failed transition, never as a crash.
//! - **`ProbeTimeout`**: the identification query went unanswered. The session returns
//!   to `Idle` and retries later.
//! - **`PreconditionFailed`**: a requested transition was rejected without side effects.
//! - **`ProtocolViolation`**: a malformed push message. The offending port's assembler
//!   resets; the session continues.
//! - **`StreamLost`**: a push channel failed while collecting. Fatal for the session.
//! - **`Engine`**: the acquisition engine process could not be started or stopped.
//!
//! Discarded partial sweeps are deliberately absent from this list: they are normal
//! steady-state behaviour and never reach the consumer as errors.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::lifecycle::LifecyclePhase;

/// Convenience alias for results using the crate error type.
pub type VnaResult<T> = std::result::Result<T, VnaError>;

/// Socket-level failures of either the command or a push connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Nothing listening at the endpoint.
    #[error("connection refused by {0}")]
    Refused(String),

    /// The endpoint did not answer within the connect timeout.
    #[error("connection to {0} timed out")]
    Timeout(String),

    /// An established connection broke or was closed by the peer.
    #[error("connection to {0} was reset")]
    Reset(String),
}

impl ConnectionError {
    /// Classify an I/O error raised while talking to `endpoint`.
    pub fn from_io(endpoint: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused(endpoint.to_string()),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Self::Timeout(endpoint.to_string())
            }
            _ => Self::Reset(endpoint.to_string()),
        }
    }
}

/// Every failure the streaming engine reports.
#[derive(Error, Debug)]
pub enum VnaError {
    /// Socket failure on the command or a push connection.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A SCPI round trip did not complete in time.
    #[error("Command '{command}' timed out after {timeout_ms} ms")]
    CommandTimeout {
        /// The command or query that went unanswered.
        command: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The identification query went unanswered, in milliseconds waited.
    #[error("Identification probe timed out after {0} ms")]
    ProbeTimeout(u64),

    /// The request is not valid in the current phase or state.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// A push line could not be decoded.
    #[error("Protocol violation on port {port}: {reason}")]
    ProtocolViolation {
        /// Port the line arrived on.
        port: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A push connection failed while a collection was running.
    #[error("Push channel {port} lost during collection: {source}")]
    StreamLost {
        /// Port whose connection failed.
        port: String,
        /// Underlying failure.
        #[source]
        source: Box<VnaError>,
    },

    /// The state machine refused a phase change.
    #[error("Illegal lifecycle transition {from} -> {to}")]
    IllegalTransition {
        /// Phase the controller was in.
        from: LifecyclePhase,
        /// Phase that was requested.
        to: LifecyclePhase,
    },

    /// The acquisition engine could not be started, stopped or reached.
    #[error("Acquisition engine error: {0}")]
    Engine(String),

    /// Calibration metadata is missing or inconsistent.
    #[error("Calibration error: {0}")]
    Calibration(String),

    /// The configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A loaded configuration value is out of range.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The instrument answered with something unexpected.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The session worker has stopped.
    #[error("Acquisition session is closed")]
    SessionClosed,
}

impl From<figment::Error> for VnaError {
    fn from(value: figment::Error) -> Self {
        VnaError::Config(Box::new(value))
    }
}

/// Flat classification of [`VnaError`], handed to `on_fatal_error` callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`VnaError::Connection`].
    Connection,
    /// See [`VnaError::CommandTimeout`].
    CommandTimeout,
    /// See [`VnaError::ProbeTimeout`].
    ProbeTimeout,
    /// See [`VnaError::PreconditionFailed`].
    PreconditionFailed,
    /// See [`VnaError::ProtocolViolation`].
    ProtocolViolation,
    /// See [`VnaError::StreamLost`].
    StreamLost,
    /// See [`VnaError::IllegalTransition`].
    IllegalTransition,
    /// See [`VnaError::Engine`].
    Engine,
    /// See [`VnaError::Calibration`].
    Calibration,
    /// Loading or validating configuration failed.
    Configuration,
    /// See [`VnaError::Instrument`].
    Instrument,
    /// See [`VnaError::Io`].
    Io,
    /// See [`VnaError::SessionClosed`].
    SessionClosed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl VnaError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VnaError::Connection(_) => ErrorKind::Connection,
            VnaError::CommandTimeout { .. } => ErrorKind::CommandTimeout,
            VnaError::ProbeTimeout(_) => ErrorKind::ProbeTimeout,
            VnaError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            VnaError::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            VnaError::StreamLost { .. } => ErrorKind::StreamLost,
            VnaError::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            VnaError::Engine(_) => ErrorKind::Engine,
            VnaError::Calibration(_) => ErrorKind::Calibration,
            VnaError::Config(_) | VnaError::Configuration(_) => ErrorKind::Configuration,
            VnaError::Instrument(_) => ErrorKind::Instrument,
            VnaError::Io(_) => ErrorKind::Io,
            VnaError::SessionClosed => ErrorKind::SessionClosed,
        }
    }

    /// Whether a later retry or re-probe can reasonably succeed without user action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection
                | ErrorKind::CommandTimeout
                | ErrorKind::ProbeTimeout
                | ErrorKind::PreconditionFailed
                | ErrorKind::ProtocolViolation
        )
    }
}
