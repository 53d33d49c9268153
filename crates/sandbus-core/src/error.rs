//! Harness error types with rich context

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Harness error types organized by component
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ─────────────────────────────────────────────────────────────
    // Bus Daemon Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to start bus daemon: {reason}{}", format_stderr(.stderr))]
    DaemonStart { reason: String, stderr: String },

    #[error("Bus daemon has not been started")]
    DaemonNotStarted,

    #[error("Bus error: {message}")]
    Bus { message: String },

    #[error("Process {pid} has already exited")]
    ProcessAlreadyExited { pid: u32 },

    #[error("Process error: {message}")]
    Process { message: String },

    #[error("Invalid session file {path}: {reason}")]
    SessionFile { path: PathBuf, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Event Correlation Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Timed out after {waited:?} waiting for {predicate}")]
    EventTimeout { predicate: String, waited: Duration },

    #[error("Another wait is already outstanding on this correlator")]
    WaitInProgress,

    #[error("Wait for {predicate} was cancelled")]
    WaitCancelled { predicate: String },

    #[error("Query error: {message}")]
    Query { message: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

fn format_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!("\n{}", stderr)
    }
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn daemon_start(reason: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::DaemonStart {
            reason: reason.into(),
            stderr: stderr.into(),
        }
    }

    pub fn bus(message: impl Into<String>) -> Self {
        Self::Bus {
            message: message.into(),
        }
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
        }
    }

    pub fn session_file(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::SessionFile {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn event_timeout(predicate: impl Into<String>, waited: Duration) -> Self {
        Self::EventTimeout {
            predicate: predicate.into(),
            waited,
        }
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if this is a condition that teardown should swallow
    pub fn is_benign_teardown(&self) -> bool {
        matches!(self, Error::ProcessAlreadyExited { .. })
    }

    /// Check if this error should abort the whole sandbox
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DaemonStart { .. }
                | Error::DaemonNotStarted
                | Error::SessionFile { .. }
                | Error::Config { .. }
        )
    }
}
