//! # sandbus-daemon - Private Bus Supervision
//!
//! Launches and stops the private message-bus daemon, drains its output
//! pipes and finds the service processes attached to it.
//!
//! Depends on [`sandbus_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Daemon Supervision
//! - [`BusDaemon`] - Start, probe and stop the bus daemon
//! - [`DaemonConfig`] - Program, configuration file and timeouts
//! - [`SessionFile`] - Share a running daemon between harness invocations
//!
//! ### Bus Introspection
//! - [`BusConnection`] - Ping, list names, resolve a name's pid
//! - [`DbusSendConnector`] - Implementation driving `dbus-send`
//!
//! ### Service Processes
//! - [`terminate_all_attached()`] - SIGTERM every service under a name prefix
//!
//! ### Signals
//! - [`SignalListener`] - Listen for a signal, restoring its disposition afterwards
//!
//! ### Pipe Draining
//! - [`spawn_drainer()`] - Read a pipe until end-of-stream into a [`LineSink`]

pub mod bus;
pub mod pipe;
pub mod process;
pub mod registry;
pub mod session;
pub mod signals;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

pub use bus::{BusConnection, BusConnector, DbusSendConnection, DbusSendConnector};
pub use pipe::{
    drain, spawn_drainer, LineClass, LineClassifier, LineSink, LogSink, OutputTail, PipeSource,
};
pub use process::{BusDaemon, DaemonConfig, StartMode};
pub use registry::{
    resolve_attached, terminate_all_attached, terminate_process, wait_for_exit,
    TerminationReport, DEFAULT_SERVICE_NAME_PREFIX,
};
pub use session::{checked_pid, process_alive, SessionFile};
pub use signals::SignalListener;
