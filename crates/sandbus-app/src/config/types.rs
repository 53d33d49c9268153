//! Configuration types for the sandbox
//!
//! Defines:
//! - `SandboxSettings` - Settings file contents (`config.toml`)
//! - `DaemonSettings`, `ServiceSettings`, `IndexSettings`, `LogSettings`

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sandbus_daemon::pipe::DEFAULT_SERVICE_LINE_PREFIX;
use sandbus_daemon::DEFAULT_SERVICE_NAME_PREFIX;

/// Settings file (`$XDG_CONFIG_HOME/sandbus/config.toml`)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SandboxSettings {
    #[serde(default)]
    pub daemon: DaemonSettings,

    #[serde(default)]
    pub services: ServiceSettings,

    #[serde(default)]
    pub index: IndexSettings,

    #[serde(default)]
    pub log: LogSettings,
}

/// Bus daemon launch settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DaemonSettings {
    /// Daemon executable
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// How long the daemon may take to print its address and pid
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Grace period after SIGTERM before the daemon is killed
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// How long to wait for the output readers after the daemon exited
    #[serde(default = "default_reader_join_timeout_ms")]
    pub reader_join_timeout_ms: u64,

    /// Run the daemon in its own process group
    #[serde(default = "default_true")]
    pub new_session: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            reader_join_timeout_ms: default_reader_join_timeout_ms(),
            new_session: true,
        }
    }
}

impl DaemonSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn reader_join_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_join_timeout_ms)
    }
}

/// The services supervised on the private bus
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServiceSettings {
    /// Bus names with this prefix are terminated at teardown
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Output lines starting with this are shown as service log lines
    #[serde(default = "default_line_prefix")]
    pub line_prefix: String,

    /// How long each service may take to exit after SIGTERM
    #[serde(default = "default_terminate_timeout_ms")]
    pub terminate_timeout_ms: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            line_prefix: default_line_prefix(),
            terminate_timeout_ms: default_terminate_timeout_ms(),
        }
    }
}

impl ServiceSettings {
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

/// Locations the file miner is told to index
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct IndexSettings {
    #[serde(default)]
    pub recursive_directories: Vec<String>,

    #[serde(default)]
    pub single_directories: Vec<String>,

    #[serde(default)]
    pub applications: bool,
}

/// Log file settings
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct LogSettings {
    /// Also write a log file into this directory
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_program() -> PathBuf {
    PathBuf::from("dbus-daemon")
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_stop_timeout_ms() -> u64 {
    5_000
}

fn default_reader_join_timeout_ms() -> u64 {
    2_000
}

fn default_true() -> bool {
    true
}

fn default_name_prefix() -> String {
    DEFAULT_SERVICE_NAME_PREFIX.to_string()
}

fn default_line_prefix() -> String {
    DEFAULT_SERVICE_LINE_PREFIX.to_string()
}

fn default_terminate_timeout_ms() -> u64 {
    5_000
}
