//! Test utilities for daemon supervision
//!
//! Provides a scriptable in-memory bus ([`FakeBus`]) and shell scripts that
//! imitate the daemon's `--print-address=1 --print-pid=1` handshake.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::bus::{BusConnection, BusConnector};
use sandbus_core::prelude::*;

#[derive(Debug, Default)]
struct FakeBusState {
    /// Published names, `None` for a name that vanishes on resolution
    names: Vec<(String, Option<u32>)>,
    fail_ping: bool,
    ping_count: usize,
    connected: Vec<String>,
}

/// An in-memory bus that records calls and serves scripted answers
///
/// Cloning shares state, so a test can keep one handle while the supervisor
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeBus {
    state: Arc<Mutex<FakeBusState>>,
}

impl FakeBus {
    /// Address printed by [`fake_daemon_script`]
    pub const ADDRESS: &'static str = "unix:path=/tmp/sandbus-fake-bus";

    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeBusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_name(&self, name: &str, pid: u32) {
        self.lock().names.push((name.to_string(), Some(pid)));
    }

    /// A name that is listed but whose owner is gone by resolution time
    pub fn add_unresolvable_name(&self, name: &str) {
        self.lock().names.push((name.to_string(), None));
    }

    pub fn remove_name(&self, name: &str) {
        self.lock().names.retain(|(n, _)| n != name);
    }

    pub fn fail_ping(&self, fail: bool) {
        self.lock().fail_ping = fail;
    }

    pub fn ping_count(&self) -> usize {
        self.lock().ping_count
    }

    /// Addresses passed to `connect`, in order
    pub fn connected_addresses(&self) -> Vec<String> {
        self.lock().connected.clone()
    }

    /// A connection without going through `connect`
    pub fn connection(&self) -> FakeConnection {
        FakeConnection { bus: self.clone() }
    }
}

impl BusConnector for FakeBus {
    type Connection = FakeConnection;

    fn connect(&self, address: &str) -> Result<Self::Connection> {
        self.lock().connected.push(address.to_string());
        Ok(self.connection())
    }
}

#[derive(Debug, Clone)]
pub struct FakeConnection {
    bus: FakeBus,
}

impl BusConnection for FakeConnection {
    async fn ping(&self) -> Result<()> {
        let mut state = self.bus.lock();
        state.ping_count += 1;
        if state.fail_ping {
            Err(Error::bus("fake bus refuses to answer"))
        } else {
            Ok(())
        }
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        let state = self.bus.lock();
        let mut names: VecDeque<String> = state.names.iter().map(|(n, _)| n.clone()).collect();
        names.push_front("org.freedesktop.DBus".to_string());
        Ok(names.into())
    }

    async fn connection_unix_process_id(&self, name: &str) -> Result<u32> {
        let state = self.bus.lock();
        state
            .names
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, pid)| *pid)
            .ok_or_else(|| Error::bus(format!("name {} has no owner", name)))
    }
}

/// How a fake daemon script behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeDaemonBehaviour {
    /// Print address and pid, then idle until signalled
    Normal,
    /// Print a diagnostic on stderr and a garbage pid line
    BadPid,
    /// Print the address and exit
    ExitBeforeHandshake,
    /// Like `Normal` but ignore SIGTERM
    IgnoreSigterm,
}

/// Write an executable shell script imitating the daemon into `dir`
pub fn fake_daemon_script(dir: &Path, behaviour: FakeDaemonBehaviour) -> PathBuf {
    let body = match behaviour {
        FakeDaemonBehaviour::Normal => format!(
            "echo '{addr}'\necho $$\nexec sleep 60\n",
            addr = FakeBus::ADDRESS
        ),
        FakeDaemonBehaviour::BadPid => format!(
            "echo 'dbus-daemon: cannot open config' >&2\necho '{addr}'\necho notapid\nexec sleep 60\n",
            addr = FakeBus::ADDRESS
        ),
        FakeDaemonBehaviour::ExitBeforeHandshake => {
            format!("echo '{addr}'\nexit 1\n", addr = FakeBus::ADDRESS)
        }
        FakeDaemonBehaviour::IgnoreSigterm => format!(
            "trap '' TERM\necho '{addr}'\necho $$\nexec sleep 60\n",
            addr = FakeBus::ADDRESS
        ),
    };
    write_script(dir, "fake-dbus-daemon", &body)
}

/// Write an executable `sh` script named `name` into `dir`
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).expect("write fake script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod fake script");
    path
}
