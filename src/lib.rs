//! # VNA Stream Core Library
//!
//! Continuous-sweep streaming and acquisition lifecycle engine for vector network
//! analyzers that expose a SCPI command port and one push-data port per measurement port.
//! The library guarantees that only complete, correctly ordered sweeps reach the consumer,
//! and it owns the start/stop lifecycle of the external acquisition engine.
//!
//! ## Crate Structure
//!
//! - **`transport`**: SCPI command connection plus one receive loop per push connection.
//!   The `InstrumentLink` and `CommandChannel` traits are the seams to the instrument.
//! - **`assembler`**: per-port state machine folding points into `SweepRecord`s and
//!   discarding sweeps that began mid-stream.
//! - **`registry`**: port → listener map receiving completed sweeps.
//! - **`dispatcher`**: latest-wins hand-off from receive tasks to one consumer.
//! - **`lifecycle`**: `LifecyclePhase`, engine process control and the
//!   `SweepLifecycleController` that probes, cold-starts, streams and tears down.
//! - **`session`**: the worker task running the controller and the consumer-side
//!   `SessionHandle`.
//! - **`mock`**: simulated instrument and engine for tests and `--mock` runs.
//! - **`config`**, **`calibration`**, **`error`**, **`measurement`**, **`tracing_config`**:
//!   configuration, calibration metadata, error types, data model and logging setup.
//!
//! Data flows `transport → assembler → registry → dispatcher → consumer`; the lifecycle
//! controller brackets it so the engine is started before push sockets open and stopped
//! only after they are closed.

pub mod assembler;
pub mod calibration;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod measurement;
pub mod mock;
pub mod registry;
pub mod session;
pub mod tracing_config;
pub mod transport;

pub use assembler::{AssemblerStats, SweepAssembler};
pub use calibration::CalibrationMetadata;
pub use config::VnaConfig;
pub use dispatcher::{CrossThreadDispatcher, DispatchStats};
pub use error::{ConnectionError, ErrorKind, VnaError, VnaResult};
pub use lifecycle::{CollectionEnd, CollectionSummary, LifecyclePhase, SweepLifecycleController};
pub use measurement::{PointMessage, PortId, SweepRecord};
pub use registry::{CallbackRegistry, ListenerId};
pub use session::{AcquisitionSession, CollectionTicket, SessionHandle};
