//! Configuration file parsing for the sandbox
//!
//! Settings come from an explicit `--config` file, else from
//! `$XDG_CONFIG_HOME/sandbus/config.toml` when present, else defaults.

pub mod types;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sandbus_core::prelude::*;
use sandbus_daemon::DaemonConfig;

pub use types::*;

/// Directory under the user config dir holding the settings file
pub const CONFIG_DIR: &str = "sandbus";

/// Settings file name
pub const CONFIG_FILENAME: &str = "config.toml";

/// Default settings file location, if the platform has a config dir
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILENAME))
}

/// Load settings
///
/// An explicit path must exist and parse. The default location is optional:
/// a missing file gives defaults, an unreadable one is reported and ignored.
pub fn load_settings(explicit: Option<&Path>) -> Result<SandboxSettings> {
    if let Some(path) = explicit {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let settings = toml::from_str(&content).map_err(|e| {
            Error::config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        debug!("Loaded settings from {:?}", path);
        return Ok(settings);
    }

    match default_settings_path() {
        Some(path) => Ok(load_settings_or_default(&path)),
        None => Ok(SandboxSettings::default()),
    }
}

/// Load settings from `path`, falling back to defaults on any problem
pub fn load_settings_or_default(path: &Path) -> SandboxSettings {
    if !path.exists() {
        debug!("No config file at {:?}, using defaults", path);
        return SandboxSettings::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", path, e);
                SandboxSettings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", path, e);
            SandboxSettings::default()
        }
    }
}

/// Daemon launch parameters for these settings
///
/// `config_file` selects a custom bus configuration (a build tree), `env` is
/// the overlay the daemon and everything it activates inherit.
pub fn daemon_config(
    settings: &SandboxSettings,
    config_file: Option<PathBuf>,
    env: BTreeMap<String, String>,
) -> DaemonConfig {
    DaemonConfig {
        program: settings.daemon.program.clone(),
        config_file,
        env,
        new_session: settings.daemon.new_session,
        service_line_prefix: settings.services.line_prefix.clone(),
        handshake_timeout: settings.daemon.handshake_timeout(),
        stop_timeout: settings.daemon.stop_timeout(),
        reader_join_timeout: settings.daemon.reader_join_timeout(),
        ..DaemonConfig::default()
    }
}
