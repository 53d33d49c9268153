//! Bus introspection capability
//!
//! The harness never speaks the bus wire protocol itself. It needs exactly
//! three calls on the bus driver: a no-op round trip (liveness), the list of
//! connected names, and the owning process of a name. [`BusConnection`]
//! captures that capability; [`DbusSendConnection`] implements it by driving
//! the stock `dbus-send` tool.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;

use sandbus_core::prelude::*;

/// Well-known name, object path and interface of the bus driver
pub const BUS_DRIVER_NAME: &str = "org.freedesktop.DBus";
pub const BUS_DRIVER_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_DRIVER_INTERFACE: &str = "org.freedesktop.DBus";

/// Default timeout of a single bus call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

static STRING_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*string "(.*)"\s*$"#).expect("Invalid string regex"));

static UINT32_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*uint32 (\d+)\s*$").expect("Invalid uint32 regex"));

/// Calls the harness makes on the bus driver
#[trait_variant::make(BusConnection: Send)]
pub trait LocalBusConnection {
    /// No-op round trip to the bus driver
    async fn ping(&self) -> Result<()>;

    /// Every name currently connected to the bus (unique and well-known)
    async fn list_names(&self) -> Result<Vec<String>>;

    /// Process id of the connection owning `name`
    async fn connection_unix_process_id(&self, name: &str) -> Result<u32>;
}

/// Opens connections to a bus address
pub trait BusConnector: Send + Sync + 'static {
    type Connection: BusConnection + Sync + 'static;

    fn connect(&self, address: &str) -> Result<Self::Connection>;
}

// ─────────────────────────────────────────────────────────────────
// dbus-send implementation
// ─────────────────────────────────────────────────────────────────

/// Connector producing [`DbusSendConnection`]s
#[derive(Debug, Clone)]
pub struct DbusSendConnector {
    program: PathBuf,
    call_timeout: Duration,
}

impl DbusSendConnector {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("dbus-send"),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }
}

impl Default for DbusSendConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl BusConnector for DbusSendConnector {
    type Connection = DbusSendConnection;

    fn connect(&self, address: &str) -> Result<Self::Connection> {
        if address.is_empty() {
            return Err(Error::bus("empty bus address"));
        }
        Ok(DbusSendConnection {
            address: address.to_string(),
            program: self.program.clone(),
            call_timeout: self.call_timeout,
        })
    }
}

/// A bus connection that runs one `dbus-send` per call
#[derive(Debug, Clone)]
pub struct DbusSendConnection {
    address: String,
    program: PathBuf,
    call_timeout: Duration,
}

impl DbusSendConnection {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Invoke a bus driver method and return the printed reply
    async fn call_driver(&self, method: &str, args: &[String]) -> Result<String> {
        let member = format!("{}.{}", BUS_DRIVER_INTERFACE, method);
        let mut command = Command::new(&self.program);
        command
            .arg(format!("--bus={}", self.address))
            .arg("--print-reply")
            .arg("--type=method_call")
            .arg(format!("--dest={}", BUS_DRIVER_NAME))
            .arg(BUS_DRIVER_PATH)
            .arg(&member)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        trace!("Bus call {} {:?}", member, args);

        let output = timeout(self.call_timeout, command.output())
            .await
            .map_err(|_| {
                Error::bus(format!(
                    "{} timed out after {:?}",
                    member, self.call_timeout
                ))
            })?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::bus(format!("{} not found", self.program.display()))
                } else {
                    Error::bus(format!("Failed to run {}: {}", self.program.display(), e))
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::bus(format!("{} failed: {}", member, stderr.trim())));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl BusConnection for DbusSendConnection {
    async fn ping(&self) -> Result<()> {
        let reply = self.call_driver("GetId", &[]).await?;
        let id = parse_string_values(&reply)
            .into_iter()
            .next()
            .ok_or_else(|| Error::bus("GetId reply carried no id"))?;
        debug!("Bus {} answered GetId with {}", self.address, id);
        Ok(())
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        let reply = self.call_driver("ListNames", &[]).await?;
        Ok(parse_string_values(&reply))
    }

    async fn connection_unix_process_id(&self, name: &str) -> Result<u32> {
        let reply = self
            .call_driver("GetConnectionUnixProcessID", &[format!("string:{}", name)])
            .await?;
        parse_uint32_value(&reply)
    }
}

// ─────────────────────────────────────────────────────────────────
// Reply parsing
// ─────────────────────────────────────────────────────────────────

/// Every `string "…"` value in a printed reply, in order
pub fn parse_string_values(reply: &str) -> Vec<String> {
    reply
        .lines()
        .filter_map(|line| STRING_VALUE.captures(line))
        .map(|caps| caps[1].to_string())
        .collect()
}

/// The first `uint32 N` value in a printed reply
pub fn parse_uint32_value(reply: &str) -> Result<u32> {
    reply
        .lines()
        .find_map(|line| UINT32_VALUE.captures(line))
        .ok_or_else(|| Error::bus("reply carried no uint32 value"))?[1]
        .parse::<u32>()
        .map_err(|e| Error::bus(format!("invalid uint32 in reply: {}", e)))
}
