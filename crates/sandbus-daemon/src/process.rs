//! Private bus daemon process management

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::bus::{BusConnection, BusConnector, DbusSendConnector};
use crate::pipe::{
    read_line_lossy, spawn_drainer, LineClassifier, LogSink, OutputTail, PipeSource,
    DEFAULT_SERVICE_LINE_PREFIX,
};
use crate::session::{checked_pid, process_alive, SessionFile};
use crate::signals::SignalListener;
use sandbus_core::prelude::*;
use sandbus_core::{DaemonSession, DaemonState};

/// How long the daemon may take to print its address and pid
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `stop()` waits for a graceful exit before sending SIGKILL
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `stop()` waits for each pipe drainer after the daemon exited
pub const DEFAULT_READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound for collecting stderr after a failed handshake
const STDERR_COLLECT_TIMEOUT: Duration = Duration::from_secs(2);

/// How to launch the bus daemon
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Daemon executable, looked up on `PATH` when relative
    pub program: PathBuf,
    /// Custom daemon configuration; `--session` is used when absent
    pub config_file: Option<PathBuf>,
    /// Variables added to the inherited environment
    pub env: BTreeMap<String, String>,
    /// Put the daemon into its own process group
    pub new_session: bool,
    /// Prefix marking log lines of supervised services
    pub service_line_prefix: String,
    pub handshake_timeout: Duration,
    pub stop_timeout: Duration,
    pub reader_join_timeout: Duration,
    /// Forward SIGTERM received by the harness to the daemon while it runs
    pub forward_sigterm: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("dbus-daemon"),
            config_file: None,
            env: BTreeMap::new(),
            new_session: false,
            service_line_prefix: DEFAULT_SERVICE_LINE_PREFIX.to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            reader_join_timeout: DEFAULT_READER_JOIN_TIMEOUT,
            forward_sigterm: true,
        }
    }
}

impl DaemonConfig {
    /// Arguments asking the daemon to announce address and pid on stdout first
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "--print-address=1".to_string(),
            "--print-pid=1".to_string(),
        ];
        match &self.config_file {
            Some(file) => args.push(format!("--config-file={}", file.display())),
            None => args.push("--session".to_string()),
        }
        args
    }
}

/// How `start_if_needed` obtained a running daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// A new daemon was spawned and is owned by this supervisor
    Spawned,
    /// An existing daemon named by the session file was reused
    Attached,
}

/// Process-level resources of a daemon this supervisor spawned
struct OwnedDaemon {
    child: Child,
    readers: Vec<JoinHandle<usize>>,
    signal_watcher: Option<JoinHandle<()>>,
    stderr_tail: OutputTail,
    stop_timeout: Duration,
    reader_join_timeout: Duration,
}

impl OwnedDaemon {
    /// SIGTERM, bounded wait, SIGKILL on timeout, then join the drainers
    async fn shutdown(mut self) {
        if let Some(watcher) = self.signal_watcher.take() {
            watcher.abort();
            // Resolves once the task and its listener are dropped, which puts
            // the previous SIGTERM disposition back.
            let _ = watcher.await;
        }

        if let Some(pid) = self.child.id() {
            match checked_pid(pid).map(|target| kill(target, Signal::SIGTERM)) {
                Ok(Ok(())) => debug!(pid, "sent SIGTERM to bus daemon"),
                Ok(Err(Errno::ESRCH)) => debug!(pid, "bus daemon already exited"),
                Ok(Err(e)) => warn!(pid, "failed to signal bus daemon: {}", e),
                Err(e) => warn!("{}", e),
            }
        }

        match timeout(self.stop_timeout, self.child.wait()).await {
            Ok(Ok(status)) => info!("Bus daemon exited with status: {:?}", status),
            Ok(Err(e)) => error!("Error waiting for bus daemon: {}", e),
            Err(_) => {
                warn!(
                    "Bus daemon did not exit within {:?}, force killing",
                    self.stop_timeout
                );
                if let Err(e) = self.child.kill().await {
                    error!("Failed to kill bus daemon: {}", e);
                }
            }
        }

        debug!("Stopping {} pipe drainers", self.readers.len());
        for mut reader in self.readers.drain(..) {
            match timeout(self.reader_join_timeout, &mut reader).await {
                Ok(Ok(lines)) => trace!("drainer joined after {} lines", lines),
                Ok(Err(e)) => warn!("drainer task failed: {}", e),
                Err(_) => {
                    // Some grandchild still holds the pipe open.
                    warn!(
                        "drainer still running after {:?}, abandoning it",
                        self.reader_join_timeout
                    );
                    reader.abort();
                }
            }
        }
    }
}

/// Supervises the private message-bus daemon.
///
/// The address and pid are only readable once the handshake parsed **and**
/// a liveness round trip to the bus succeeded. A supervisor is single use:
/// after `Stopped` or `Failed` it cannot be started again.
pub struct BusDaemon<C: BusConnector = DbusSendConnector> {
    connector: C,
    state: DaemonState,
    session: Option<DaemonSession>,
    connection: Option<Arc<C::Connection>>,
    owned: Option<OwnedDaemon>,
}

impl BusDaemon<DbusSendConnector> {
    pub fn new() -> Self {
        Self::with_connector(DbusSendConnector::new())
    }
}

impl Default for BusDaemon<DbusSendConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: BusConnector> BusDaemon<C> {
    pub fn with_connector(connector: C) -> Self {
        Self {
            connector,
            state: DaemonState::NotStarted,
            session: None,
            connection: None,
            owned: None,
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Connection address, only once `Running`
    pub fn address(&self) -> Result<&str> {
        Ok(&self.session()?.address)
    }

    /// Daemon process id as announced in the handshake, only once `Running`
    pub fn pid(&self) -> Result<u32> {
        Ok(self.session()?.pid)
    }

    pub fn session(&self) -> Result<&DaemonSession> {
        match (&self.session, self.state) {
            (Some(session), DaemonState::Running) => Ok(session),
            _ => Err(Error::DaemonNotStarted),
        }
    }

    /// Shared bus connection, only once `Running`
    pub fn connection(&self) -> Result<Arc<C::Connection>> {
        match (&self.connection, self.state) {
            (Some(conn), DaemonState::Running) => Ok(Arc::clone(conn)),
            _ => Err(Error::DaemonNotStarted),
        }
    }

    /// Whether `stop()` will terminate the daemon process
    pub fn is_owned(&self) -> bool {
        self.owned.is_some()
    }

    /// Recent stderr lines of an owned daemon
    pub fn stderr_tail(&self) -> Option<String> {
        self.owned.as_ref().map(|o| o.stderr_tail.contents())
    }

    /// Spawn the daemon, parse its handshake and probe it
    pub async fn start(&mut self, config: &DaemonConfig) -> Result<()> {
        if self.state != DaemonState::NotStarted {
            return Err(Error::daemon_start(
                format!("supervisor is {} and cannot be started again", self.state),
                "",
            ));
        }

        self.state = DaemonState::Starting;
        match self.spawn_and_probe(config).await {
            Ok(()) => {
                self.state = DaemonState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = DaemonState::Failed;
                Err(e)
            }
        }
    }

    /// Reuse the daemon named by `session_file` if it is alive, else start one
    /// and record it there
    pub async fn start_if_needed(
        &mut self,
        config: &DaemonConfig,
        session_file: &SessionFile,
    ) -> Result<StartMode> {
        match session_file.read()? {
            Some(existing) if process_alive(existing.pid) => {
                if self.state != DaemonState::NotStarted {
                    return Err(Error::daemon_start(
                        format!("supervisor is {} and cannot be started again", self.state),
                        "",
                    ));
                }
                self.state = DaemonState::Starting;
                match self.attach(existing).await {
                    Ok(()) => {
                        self.state = DaemonState::Running;
                        Ok(StartMode::Attached)
                    }
                    Err(e) => {
                        self.state = DaemonState::Failed;
                        Err(e)
                    }
                }
            }
            Some(stale) => {
                warn!(
                    pid = stale.pid,
                    file = %session_file.path().display(),
                    "daemon from session file is gone; starting a new one"
                );
                session_file.remove()?;
                self.start(config).await?;
                session_file.write(self.session()?)?;
                Ok(StartMode::Spawned)
            }
            None => {
                self.start(config).await?;
                session_file.write(self.session()?)?;
                Ok(StartMode::Spawned)
            }
        }
    }

    async fn attach(&mut self, existing: DaemonSession) -> Result<()> {
        let connection = self
            .connector
            .connect(&existing.address)
            .map_err(|e| Error::daemon_start(format!("cannot connect to {}: {}", existing.address, e), ""))?;
        connection.ping().await.map_err(|e| {
            Error::daemon_start(
                format!(
                    "daemon {} from session file did not answer: {}",
                    existing.pid, e
                ),
                "",
            )
        })?;

        info!(
            pid = existing.pid,
            address = %existing.address,
            "Reusing running D-Bus daemon"
        );
        self.connection = Some(Arc::new(connection));
        self.session = Some(existing);
        Ok(())
    }

    async fn spawn_and_probe(&mut self, config: &DaemonConfig) -> Result<()> {
        let program = which::which(&config.program).map_err(|e| {
            Error::daemon_start(format!("{}: {}", config.program.display(), e), "")
        })?;
        let args = config.command_args();
        debug!("Running: {} {}", program.display(), args.join(" "));

        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if config.new_session {
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::daemon_start(format!("failed to spawn {}: {}", program.display(), e), "")
        })?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(Error::daemon_start("daemon pipes were not captured", ""));
            }
        };
        let mut stdout = BufReader::new(stdout);

        let handshake = match timeout(config.handshake_timeout, read_handshake(&mut stdout)).await
        {
            Ok(result) => result,
            Err(_) => Err(format!(
                "no handshake within {:?}",
                config.handshake_timeout
            )),
        };

        let session = match handshake {
            Ok(session) => session,
            Err(reason) => {
                let _ = child.start_kill();
                let stderr_text = collect_stderr(stderr).await;
                if let Err(e) = timeout(STDERR_COLLECT_TIMEOUT, child.wait()).await {
                    warn!("bus daemon not reaped after failed handshake: {}", e);
                }
                return Err(Error::daemon_start(reason, stderr_text));
            }
        };

        if child.id() != Some(session.pid) {
            debug!(
                "handshake pid {} differs from spawned pid {:?}",
                session.pid,
                child.id()
            );
        }
        debug!(
            "Using new D-Bus session with address '{}' with PID {}",
            session.address, session.pid
        );

        // The daemon blocks once a pipe buffer fills, so drain both from now on.
        let classifier = LineClassifier::new(config.service_line_prefix.clone());
        let stderr_tail = OutputTail::default();
        let readers = vec![
            spawn_drainer(stdout, PipeSource::Stdout, LogSink::new(classifier.clone())),
            spawn_drainer(
                BufReader::new(stderr),
                PipeSource::Stderr,
                LogSink::new(classifier).with_tail(stderr_tail.clone()),
            ),
        ];

        let signal_watcher = if config.forward_sigterm {
            child.id().and_then(spawn_sigterm_forwarder)
        } else {
            None
        };

        let owned = OwnedDaemon {
            child,
            readers,
            signal_watcher,
            stderr_tail,
            stop_timeout: config.stop_timeout,
            reader_join_timeout: config.reader_join_timeout,
        };

        debug!("Pinging the new D-Bus daemon...");
        let probe = match self.connector.connect(&session.address) {
            Ok(connection) => connection.ping().await.map(|()| connection),
            Err(e) => Err(e),
        };

        match probe {
            Ok(connection) => {
                self.connection = Some(Arc::new(connection));
                self.session = Some(session);
                self.owned = Some(owned);
                Ok(())
            }
            Err(e) => {
                let tail = owned.stderr_tail.clone();
                owned.shutdown().await;
                Err(Error::daemon_start(
                    format!("liveness probe failed: {}", e),
                    tail.contents(),
                ))
            }
        }
    }

    /// Terminate the daemon (if owned) and join its drainers
    ///
    /// Idempotent: a no-op before `start()` and after a previous `stop()`.
    /// An attached daemon is left running for its owner.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state {
            DaemonState::NotStarted | DaemonState::Stopped => return Ok(()),
            DaemonState::Failed if self.owned.is_none() => return Ok(()),
            _ => {}
        }

        self.state = DaemonState::Stopping;
        self.connection = None;

        match self.owned.take() {
            Some(owned) => {
                debug!("Stopping D-Bus daemon");
                owned.shutdown().await;
            }
            None => debug!("Detaching from shared D-Bus daemon"),
        }

        self.session = None;
        self.state = DaemonState::Stopped;
        info!("D-Bus daemon stopped");
        Ok(())
    }
}

impl<C: BusConnector> Drop for BusDaemon<C> {
    fn drop(&mut self) {
        if let Some(owned) = self.owned.as_mut() {
            warn!("BusDaemon dropped while the daemon may still be running");
            if let Some(watcher) = owned.signal_watcher.take() {
                watcher.abort();
            }
            let _ = owned.child.start_kill();
        }
    }
}

/// Read the two handshake lines: address, then decimal pid
async fn read_handshake<R>(stdout: &mut BufReader<R>) -> std::result::Result<DaemonSession, String>
where
    R: AsyncRead + Unpin,
{
    let address = read_line_lossy(stdout)
        .await
        .map_err(|e| format!("failed to read address: {}", e))?
        .ok_or_else(|| "daemon closed stdout before printing its address".to_string())?;
    let address = address.trim().to_string();
    if address.is_empty() {
        return Err("daemon printed an empty address".to_string());
    }

    let pid_line = read_line_lossy(stdout)
        .await
        .map_err(|e| format!("failed to read pid: {}", e))?
        .ok_or_else(|| "daemon closed stdout before printing its pid".to_string())?;
    let pid = pid_line
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("daemon printed invalid pid {:?}", pid_line.trim()))?;

    Ok(DaemonSession::new(address, pid))
}

async fn collect_stderr(stderr: ChildStderr) -> String {
    let mut raw = Vec::new();
    let mut stderr = stderr;
    match timeout(STDERR_COLLECT_TIMEOUT, stderr.read_to_end(&mut raw)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("failed to read daemon stderr: {}", e),
        Err(_) => warn!("daemon stderr still open after {:?}", STDERR_COLLECT_TIMEOUT),
    }
    String::from_utf8_lossy(&raw).trim().to_string()
}

/// Forward SIGTERM delivered to the harness to the daemon
///
/// The listener lives inside the task, so aborting the task restores the
/// previous SIGTERM disposition.
fn spawn_sigterm_forwarder(pid: u32) -> Option<JoinHandle<()>> {
    let target = match checked_pid(pid) {
        Ok(target) => target,
        Err(e) => {
            warn!("not forwarding SIGTERM: {}", e);
            return None;
        }
    };
    let mut sigterm = match SignalListener::install(Signal::SIGTERM) {
        Ok(listener) => listener,
        Err(e) => {
            warn!("cannot watch SIGTERM: {}", e);
            return None;
        }
    };

    Some(tokio::spawn(async move {
        while sigterm.recv().await.is_some() {
            info!("Received SIGTERM, forwarding to bus daemon {}", pid);
            if let Err(e) = kill(target, Signal::SIGTERM) {
                debug!(pid, "failed to forward SIGTERM: {}", e);
            }
        }
    }))
}
