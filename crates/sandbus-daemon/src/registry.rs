//! Discovery and termination of service processes attached to the bus
//!
//! Services activated on the private bus are not children of the harness, so
//! the only way to find them is to ask the bus which process owns each
//! published name. The mapping is rebuilt on every call and never cached.

use std::collections::BTreeSet;
use std::time::Duration;

use futures_util::future::join_all;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use tokio::time::{sleep, Instant};

use crate::bus::BusConnection;
use crate::session::{checked_pid, process_alive};
use sandbus_core::prelude::*;
use sandbus_core::ServiceProcessRecord;

/// Interval between liveness checks while waiting for a process to exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default prefix of the bus names owned by the supervised services
pub const DEFAULT_SERVICE_NAME_PREFIX: &str = "org.freedesktop.Tracker";

/// Outcome of [`terminate_all_attached`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    /// Pids that exited after SIGTERM
    pub terminated: Vec<u32>,
    /// Pids that were already gone before we signalled them
    pub already_exited: Vec<u32>,
    /// Pids that ignored SIGTERM and were killed
    pub killed: Vec<u32>,
    /// Pids the bus reported that do not name a single process
    pub invalid: Vec<u32>,
}

impl TerminationReport {
    pub fn is_empty(&self) -> bool {
        self.terminated.is_empty()
            && self.already_exited.is_empty()
            && self.killed.is_empty()
            && self.invalid.is_empty()
    }

    /// Every pid the report mentions
    pub fn pids(&self) -> BTreeSet<u32> {
        self.terminated
            .iter()
            .chain(&self.already_exited)
            .chain(&self.killed)
            .copied()
            .collect()
    }
}

/// Resolve every bus name starting with `prefix` to its owning process
///
/// Names that vanish between listing and resolution are skipped.
pub async fn resolve_attached<B>(conn: &B, prefix: &str) -> Result<Vec<ServiceProcessRecord>>
where
    B: BusConnection + Sync,
{
    let names = conn.list_names().await?;
    let mut records = Vec::new();

    for name in names.into_iter().filter(|n| n.starts_with(prefix)) {
        match conn.connection_unix_process_id(&name).await {
            Ok(pid) => {
                debug!("Bus name {} is owned by pid {}", name, pid);
                records.push(ServiceProcessRecord::new(name, pid));
            }
            Err(e) => debug!("Bus name {} vanished before resolution: {}", name, e),
        }
    }

    Ok(records)
}

/// Send SIGTERM to `pid`, reporting an already-gone process as such
pub fn terminate_process(pid: u32) -> Result<()> {
    match kill(checked_pid(pid)?, Signal::SIGTERM) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(Error::ProcessAlreadyExited { pid }),
        Err(e) => Err(Error::process(format!("failed to signal {}: {}", pid, e))),
    }
}

/// Poll until `pid` is gone or `limit` elapses; `true` if it exited
pub async fn wait_for_exit(pid: u32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if !process_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// Terminate every service process owning a bus name with `prefix`
///
/// All processes are signalled before any wait starts, so they shut down in
/// parallel and the total time is bounded by one `wait_timeout` (plus the
/// SIGKILL pass for stragglers). A process owning several names is signalled
/// once. Must run before the daemon is stopped.
pub async fn terminate_all_attached<B>(
    conn: &B,
    prefix: &str,
    wait_timeout: Duration,
) -> Result<TerminationReport>
where
    B: BusConnection + Sync,
{
    let records = resolve_attached(conn, prefix).await?;
    let pids: BTreeSet<u32> = records.iter().map(|r| r.pid).collect();

    let mut report = TerminationReport::default();
    if pids.is_empty() {
        debug!("No service processes attached under {}", prefix);
        return Ok(report);
    }

    let mut signalled = Vec::with_capacity(pids.len());
    for pid in pids {
        if checked_pid(pid).is_err() {
            warn!("Bus reported unusable pid {} under {}, not signalling it", pid, prefix);
            report.invalid.push(pid);
            continue;
        }
        match terminate_process(pid) {
            Ok(()) => {
                debug!("Sent SIGTERM to service process {}", pid);
                signalled.push(pid);
            }
            Err(e) if e.is_benign_teardown() => report.already_exited.push(pid),
            Err(e) => {
                warn!("{}", e);
                signalled.push(pid);
            }
        }
    }

    let exits = join_all(
        signalled
            .iter()
            .map(|&pid| async move { (pid, wait_for_exit(pid, wait_timeout).await) }),
    )
    .await;

    for (pid, exited) in exits {
        if exited {
            report.terminated.push(pid);
            continue;
        }
        warn!(
            "Service process {} did not exit within {:?}, force killing",
            pid, wait_timeout
        );
        match checked_pid(pid).map(|target| kill(target, Signal::SIGKILL)) {
            Ok(Ok(())) | Ok(Err(Errno::ESRCH)) => {}
            Ok(Err(e)) => warn!("Failed to kill service process {}: {}", pid, e),
            Err(e) => warn!("{}", e),
        }
        report.killed.push(pid);
    }

    info!(
        "Terminated {} service processes ({} killed)",
        report.terminated.len() + report.killed.len(),
        report.killed.len()
    );
    Ok(report)
}
