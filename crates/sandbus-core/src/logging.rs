//! Logging configuration using tracing

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// Target for lines drained from the bus daemon's pipes.
///
/// Everything attached to the private bus inherits the daemon's stdout and
/// stderr, so service log output arrives here too.
pub const BUS_TARGET: &str = "sandbus::bus";

/// Environment variable that overrides the computed filter
pub const LOG_ENV: &str = "SANDBUS_LOG";

/// Which log channels are verbose
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Show debug output from the harness itself
    pub debug_sandbox: bool,
    /// Show every line from every process on the bus, not just prefixed service output
    pub debug_bus: bool,
    /// Also write a daily-rotated log file into this directory
    pub log_dir: Option<PathBuf>,
}

impl LogOptions {
    /// Filter directives used when `SANDBUS_LOG` is unset
    pub fn default_directives(&self) -> String {
        let harness = if self.debug_sandbox { "debug" } else { "warn" };
        let bus = if self.debug_bus { "debug" } else { "info" };
        format!("{},{}={}", harness, BUS_TARGET, bus)
    }
}

/// Initialize the logging subsystem
///
/// Log lines go to stderr. The filter is derived from [`LogOptions`] and can
/// be replaced with the `SANDBUS_LOG` environment variable.
///
/// # Examples
/// ```bash
/// SANDBUS_LOG=debug sandbus --prefix /usr
/// SANDBUS_LOG=sandbus::bus=trace sandbus --prefix /usr
/// ```
pub fn init(options: &LogOptions) -> Result<()> {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(options.default_directives()));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(options.debug_sandbox)
        .without_time();

    let file_layer = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "sandbus.log");
            Some(
                fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_timer(fmt::time::ChronoLocal::new(
                        "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                    )),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::config(format!("Failed to install log subscriber: {}", e)))?;

    tracing::debug!("═══════════════════════════════════════════════════════");
    tracing::debug!("sandbus starting");
    if let Some(dir) = &options.log_dir {
        tracing::debug!("Log directory: {}", dir.display());
    }
    tracing::debug!("═══════════════════════════════════════════════════════");

    Ok(())
}
