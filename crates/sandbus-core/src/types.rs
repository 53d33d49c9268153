//! Core domain types shared by the supervisor, registry and orchestrator

use std::fmt;

/// Lifecycle of the private bus daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DaemonState {
    #[default]
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl DaemonState {
    /// Whether `address()` / `pid()` may be read
    pub fn is_running(self) -> bool {
        self == DaemonState::Running
    }

    /// A handle in a terminal state must not be started again
    pub fn is_terminal(self) -> bool {
        matches!(self, DaemonState::Stopped | DaemonState::Failed)
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DaemonState::NotStarted => "not started",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::Stopping => "stopping",
            DaemonState::Stopped => "stopped",
            DaemonState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The daemon's self-announcement: connection address and process id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSession {
    pub address: String,
    pub pid: u32,
}

impl DaemonSession {
    pub fn new(address: impl Into<String>, pid: u32) -> Self {
        Self {
            address: address.into(),
            pid,
        }
    }
}

/// A service process attached to the bus under a published name
///
/// Rebuilt on every teardown; never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceProcessRecord {
    pub bus_name: String,
    pub pid: u32,
}

impl ServiceProcessRecord {
    pub fn new(bus_name: impl Into<String>, pid: u32) -> Self {
        Self {
            bus_name: bus_name.into(),
            pid,
        }
    }
}
