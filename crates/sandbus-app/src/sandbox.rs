//! Sandbox lifecycle
//!
//! [`Sandbox`] owns everything one sandbox run allocates: the index
//! directory, the bus daemon, the session file and the environment given to
//! the workload. Setup order:
//!
//! 1. index directory and XDG layout
//! 2. environment overlay
//! 3. bus daemon (spawned, or attached through the session file)
//! 4. miner config and MIME data link
//!
//! Teardown runs exactly once, in this order: session file removal, service
//! termination, daemon stop, temporary index removal. Teardown problems are
//! logged and never replace the error that caused the teardown.

use std::fmt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use sandbus_core::prelude::*;
use sandbus_daemon::session::SESSION_FILE_NAME;
use sandbus_daemon::{
    terminate_all_attached, BusConnector, BusDaemon, DbusSendConnector, SessionFile, StartMode,
};

use crate::config::{self, SandboxSettings};
use crate::environment::{link_mime_data, EnvOverlay, HostEnv, SandboxLayout, Verbosity};
use crate::miner_config::apply_miner_config;
use crate::workload::{Workload, WorkloadOutcome, WorkloadRunner};

/// Prefix of a temporary index directory
pub const TEMP_INDEX_PREFIX: &str = "tracker-sandbox";

/// Where the services come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonSource {
    /// A build tree, located through a custom bus configuration file
    BuildTree { dbus_config: PathBuf },
    /// An install prefix (`/usr` for the system installation)
    Prefix(PathBuf),
}

impl DaemonSource {
    /// Exactly one of `dbus_config` and `prefix` must be given
    pub fn from_options(dbus_config: Option<PathBuf>, prefix: Option<PathBuf>) -> Result<Self> {
        match (dbus_config, prefix) {
            (Some(dbus_config), None) => Ok(DaemonSource::BuildTree { dbus_config }),
            (None, Some(prefix)) => Ok(DaemonSource::Prefix(prefix)),
            (None, None) => Err(Error::config(
                "You must specify either --dbus-config (to run Tracker from a build tree) \
                 or --prefix (to run an installed Tracker).",
            )),
            (Some(_), Some(_)) => Err(Error::config(
                "You cannot specify --dbus-config and --prefix at the same time. Note that \
                 running Tracker from the build tree implies --dbus-config.",
            )),
        }
    }

    pub fn dbus_config(&self) -> Option<&Path> {
        match self {
            DaemonSource::BuildTree { dbus_config } => Some(dbus_config),
            DaemonSource::Prefix(_) => None,
        }
    }

    pub fn prefix(&self) -> Option<&Path> {
        match self {
            DaemonSource::BuildTree { .. } => None,
            DaemonSource::Prefix(prefix) => Some(prefix),
        }
    }
}

impl fmt::Display for DaemonSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonSource::BuildTree { dbus_config } => write!(
                f,
                "Using Tracker daemons from build tree with D-Bus config {}",
                dbus_config.display()
            ),
            DaemonSource::Prefix(prefix) => {
                write!(f, "Using Tracker daemons from prefix {}", prefix.display())
            }
        }
    }
}

/// Where the index (and every private XDG directory) lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexLocation {
    /// A directory that is kept after the run
    Fixed(PathBuf),
    /// A fresh temporary directory, deleted at teardown
    Temporary,
}

impl IndexLocation {
    /// `--index-tmpdir` conflicts with an explicit `--index`
    pub fn from_options(index: Option<PathBuf>, tmpdir: bool) -> Result<Self> {
        match (index, tmpdir) {
            (Some(_), true) => Err(Error::config(
                "The --index-tmpdir flag is enabled, but --index= was also passed.",
            )),
            (None, true) => Ok(IndexLocation::Temporary),
            (Some(index), false) => Ok(IndexLocation::Fixed(index)),
            (None, false) => Ok(IndexLocation::Fixed(PathBuf::from(
                crate::environment::DEFAULT_INDEX_LOCATION,
            ))),
        }
    }
}

/// Everything needed to bring a sandbox up
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub source: DaemonSource,
    pub index: IndexLocation,
    pub verbosity: Verbosity,
    pub settings: SandboxSettings,
    /// Environment of the harness, read once
    pub host: HostEnv,
    /// Base for relative index locations in the miner config
    pub working_dir: PathBuf,
}

/// A running sandbox
pub struct Sandbox<C: BusConnector = DbusSendConnector> {
    layout: SandboxLayout,
    temp_index: Option<TempDir>,
    daemon: BusDaemon<C>,
    session_file: SessionFile,
    start_mode: Option<StartMode>,
    base_env: EnvOverlay,
    workload_env: Option<EnvOverlay>,
    shell: PathBuf,
    options: SandboxOptions,
    torn_down: bool,
}

impl Sandbox<DbusSendConnector> {
    /// Bring up a sandbox whose bus is reached through `dbus-send`
    pub async fn start(options: SandboxOptions) -> Result<Self> {
        Self::start_with_connector(options, DbusSendConnector::new()).await
    }
}

impl<C: BusConnector> Sandbox<C> {
    /// Bring up a sandbox using `connector` for bus calls
    ///
    /// A failure after the index directory exists tears down whatever was
    /// started before the error is returned.
    pub async fn start_with_connector(options: SandboxOptions, connector: C) -> Result<Self> {
        let (index, temp_index) = match &options.index {
            IndexLocation::Fixed(path) => (path.clone(), None),
            IndexLocation::Temporary => {
                let dir = tempfile::Builder::new()
                    .prefix(TEMP_INDEX_PREFIX)
                    .tempdir()?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };

        let layout = SandboxLayout::new(index);
        let session_file = SessionFile::in_runtime_dir(&layout.runtime_dir());
        let base_env = EnvOverlay::for_sandbox(
            &layout,
            options.source.prefix(),
            options.verbosity,
            &options.host,
        );

        let mut sandbox = Self {
            layout,
            temp_index,
            daemon: BusDaemon::with_connector(connector),
            session_file,
            start_mode: None,
            base_env,
            workload_env: None,
            shell: options.host.shell(),
            options,
            torn_down: false,
        };

        if let Err(e) = sandbox.setup().await {
            error!("Sandbox setup failed: {}", e);
            sandbox.teardown().await;
            return Err(e);
        }
        Ok(sandbox)
    }

    async fn setup(&mut self) -> Result<()> {
        self.layout.create()?;

        let daemon_config = config::daemon_config(
            &self.options.settings,
            self.options.source.dbus_config().map(Path::to_path_buf),
            self.base_env.to_map(),
        );
        let mode = self
            .daemon
            .start_if_needed(&daemon_config, &self.session_file)
            .await?;
        self.start_mode = Some(mode);

        let address = self.daemon.address()?.to_string();
        match mode {
            StartMode::Spawned => info!(address = %address, "Started private bus"),
            StartMode::Attached => info!(address = %address, "Reusing private bus"),
        }
        self.workload_env = Some(self.base_env.for_workload(&address));

        apply_miner_config(
            &self.layout.config_home(),
            &self.options.settings.index,
            &self.options.working_dir,
        )?;

        if let Some(original) = self.options.host.user_data_dir() {
            link_mime_data(&original, &self.layout.data_home())?;
        }
        Ok(())
    }

    pub fn layout(&self) -> &SandboxLayout {
        &self.layout
    }

    pub fn source(&self) -> &DaemonSource {
        &self.options.source
    }

    pub fn start_mode(&self) -> Option<StartMode> {
        self.start_mode
    }

    pub fn daemon(&self) -> &BusDaemon<C> {
        &self.daemon
    }

    pub fn address(&self) -> Result<&str> {
        self.daemon.address()
    }

    pub fn session_file(&self) -> &SessionFile {
        &self.session_file
    }

    /// Environment given to the workload, only while running
    pub fn workload_env(&self) -> Result<&EnvOverlay> {
        match (&self.workload_env, self.torn_down) {
            (Some(env), false) => Ok(env),
            _ => Err(Error::DaemonNotStarted),
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Run `workload` with the sandbox environment
    pub async fn run(&self, workload: &Workload) -> Result<WorkloadOutcome> {
        let runner = WorkloadRunner::new(&self.shell, self.workload_env()?.clone());
        runner.run(workload).await
    }

    /// Tear down and consume the sandbox
    pub async fn shutdown(mut self) {
        self.teardown().await;
    }

    /// Release everything this sandbox started; later calls do nothing
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        debug!("Cleaning up sandbox");

        let owned = self.start_mode == Some(StartMode::Spawned);
        if owned {
            debug!("Removing {} file", SESSION_FILE_NAME);
            if let Err(e) = self.session_file.remove() {
                warn!("Failed to remove session file: {}", e);
            }

            match self.daemon.connection() {
                Ok(conn) => {
                    let services = &self.options.settings.services;
                    match terminate_all_attached(
                        conn.as_ref(),
                        &services.name_prefix,
                        services.terminate_timeout(),
                    )
                    .await
                    {
                        Ok(report) if !report.is_empty() => debug!(
                            "Terminated services: {} exited, {} already gone, {} killed",
                            report.terminated.len(),
                            report.already_exited.len(),
                            report.killed.len()
                        ),
                        Ok(_) => {}
                        Err(e) => warn!("Failed to terminate services: {}", e),
                    }
                }
                Err(_) => debug!("No bus connection, skipping service termination"),
            }
        }

        if let Err(e) = self.daemon.stop().await {
            warn!("Failed to stop bus daemon: {}", e);
        }

        if let Some(dir) = self.temp_index.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!("Removed temporary index {:?}", path),
                Err(e) => warn!("Failed to remove temporary index {:?}: {}", path, e),
            }
        }
    }
}

impl<C: BusConnector> Drop for Sandbox<C> {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        // The daemon is killed by its own Drop, the temporary index by TempDir's
        warn!("Sandbox dropped without teardown");
        if self.start_mode == Some(StartMode::Spawned) {
            let _ = self.session_file.remove();
        }
    }
}

/// Bring up a sandbox, run `workload` in it and tear it down again
pub async fn run_sandboxed(options: SandboxOptions, workload: &Workload) -> Result<WorkloadOutcome> {
    run_sandboxed_with_connector(options, DbusSendConnector::new(), workload).await
}

pub async fn run_sandboxed_with_connector<C: BusConnector>(
    options: SandboxOptions,
    connector: C,
    workload: &Workload,
) -> Result<WorkloadOutcome> {
    let mut sandbox = Sandbox::start_with_connector(options, connector).await?;
    let outcome = sandbox.run(workload).await;
    sandbox.teardown().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbus_core::{DaemonSession, DaemonState};
    use sandbus_daemon::test_utils::{fake_daemon_script, FakeBus, FakeDaemonBehaviour};
    use sandbus_daemon::{process_alive, wait_for_exit};
    use serial_test::serial;
    use std::time::Duration;
    use tempfile::tempdir;

    fn options(dir: &Path, behaviour: FakeDaemonBehaviour, index: IndexLocation) -> SandboxOptions {
        let mut settings = SandboxSettings::default();
        settings.daemon.program = fake_daemon_script(dir, behaviour);
        settings.daemon.stop_timeout_ms = 500;
        settings.daemon.handshake_timeout_ms = 2_000;
        settings.services.terminate_timeout_ms = 500;

        SandboxOptions {
            source: DaemonSource::Prefix(PathBuf::from("/usr")),
            index,
            verbosity: Verbosity::Errors,
            settings,
            host: HostEnv::from_pairs([
                ("HOME", dir.to_string_lossy().into_owned()),
                ("SHELL", "/bin/sh".to_string()),
            ]),
            working_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_daemon_source_requires_exactly_one() {
        assert!(matches!(
            DaemonSource::from_options(None, None),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            DaemonSource::from_options(Some("/a".into()), Some("/b".into())),
            Err(Error::Config { .. })
        ));
        let source = DaemonSource::from_options(None, Some("/opt/t".into())).unwrap();
        assert_eq!(source.prefix(), Some(Path::new("/opt/t")));
        assert_eq!(source.to_string(), "Using Tracker daemons from prefix /opt/t");
    }

    #[test]
    fn test_index_location_options() {
        assert_eq!(
            IndexLocation::from_options(None, false).unwrap(),
            IndexLocation::Fixed(PathBuf::from("/tmp/tracker-sandbox"))
        );
        assert_eq!(
            IndexLocation::from_options(None, true).unwrap(),
            IndexLocation::Temporary
        );
        assert!(IndexLocation::from_options(Some("/x".into()), true).is_err());
    }

    #[tokio::test]
    async fn test_start_and_teardown_with_fixed_index() {
        let temp = tempdir().unwrap();
        let index = temp.path().join("index");
        let opts = options(
            temp.path(),
            FakeDaemonBehaviour::Normal,
            IndexLocation::Fixed(index.clone()),
        );

        let mut sandbox = Sandbox::start_with_connector(opts, FakeBus::new())
            .await
            .unwrap();
        assert_eq!(sandbox.start_mode(), Some(StartMode::Spawned));
        assert_eq!(sandbox.address().unwrap(), FakeBus::ADDRESS);
        assert!(sandbox.session_file().path().exists());
        assert!(index.join("config/tracker/tracker-miner-fs.cfg").exists());

        let env = sandbox.workload_env().unwrap();
        assert_eq!(env.get("DBUS_SESSION_BUS_ADDRESS"), Some(FakeBus::ADDRESS));
        assert_eq!(env.get("TRACKER_SANDBOX"), Some("1"));

        let pid = sandbox.daemon().pid().unwrap();
        sandbox.teardown().await;
        sandbox.teardown().await;

        assert!(sandbox.is_torn_down());
        assert_eq!(sandbox.daemon().state(), DaemonState::Stopped);
        assert!(!sandbox.session_file().path().exists());
        assert!(wait_for_exit(pid, Duration::from_secs(1)).await);
        // A fixed index survives the run
        assert!(index.join("data").is_dir());
    }

    #[tokio::test]
    async fn test_temporary_index_is_removed() {
        let temp = tempdir().unwrap();
        let opts = options(temp.path(), FakeDaemonBehaviour::Normal, IndexLocation::Temporary);

        let sandbox = Sandbox::start_with_connector(opts, FakeBus::new())
            .await
            .unwrap();
        let index = sandbox.layout().index().to_path_buf();
        assert!(index
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(TEMP_INDEX_PREFIX));
        assert!(index.is_dir());

        sandbox.shutdown().await;
        assert!(!index.exists());
    }

    #[tokio::test]
    async fn test_failed_start_cleans_up() {
        let temp = tempdir().unwrap();
        let index = temp.path().join("index");
        let opts = options(
            temp.path(),
            FakeDaemonBehaviour::BadPid,
            IndexLocation::Fixed(index.clone()),
        );

        let err = Sandbox::start_with_connector(opts, FakeBus::new())
            .await
            .err()
            .expect("start must fail");
        assert!(matches!(err, Error::DaemonStart { .. }));
        assert!(err.to_string().contains("cannot open config"));
        assert!(!index.join("run").join(SESSION_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_failed_probe_stops_daemon() {
        let temp = tempdir().unwrap();
        let opts = options(temp.path(), FakeDaemonBehaviour::Normal, IndexLocation::Temporary);
        let bus = FakeBus::new();
        bus.fail_ping(true);

        let err = Sandbox::start_with_connector(opts, bus)
            .await
            .err()
            .expect("probe failure must abort setup");
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_teardown_terminates_services() {
        let temp = tempdir().unwrap();
        let opts = options(temp.path(), FakeDaemonBehaviour::Normal, IndexLocation::Temporary);
        let bus = FakeBus::new();

        let mut service = tokio::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .unwrap();
        let service_pid = service.id().unwrap();
        let (exited_tx, exited_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let _ = exited_tx.send(service.wait().await);
        });
        bus.add_name("org.freedesktop.Tracker3.Miner.Files", service_pid);
        bus.add_name("org.example.Unrelated", std::process::id());

        let mut sandbox = Sandbox::start_with_connector(opts, bus.clone())
            .await
            .unwrap();
        sandbox.teardown().await;

        let status = tokio::time::timeout(Duration::from_secs(2), exited_rx)
            .await
            .expect("service must be terminated")
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(process_alive(std::process::id()));
    }

    #[tokio::test]
    async fn test_attached_daemon_is_left_running() {
        let temp = tempdir().unwrap();
        let index = temp.path().join("index");

        let first = Sandbox::start_with_connector(
            options(
                temp.path(),
                FakeDaemonBehaviour::Normal,
                IndexLocation::Fixed(index.clone()),
            ),
            FakeBus::new(),
        )
        .await
        .unwrap();
        let owner_pid = first.daemon().pid().unwrap();

        let second = Sandbox::start_with_connector(
            options(
                temp.path(),
                FakeDaemonBehaviour::Normal,
                IndexLocation::Fixed(index.clone()),
            ),
            FakeBus::new(),
        )
        .await
        .unwrap();
        assert_eq!(second.start_mode(), Some(StartMode::Attached));
        assert_eq!(second.daemon().pid().unwrap(), owner_pid);

        second.shutdown().await;
        assert!(process_alive(owner_pid));
        assert_eq!(
            first.session_file().read().unwrap(),
            Some(DaemonSession {
                address: FakeBus::ADDRESS.to_string(),
                pid: owner_pid,
            })
        );

        first.shutdown().await;
        assert!(wait_for_exit(owner_pid, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    #[serial]
    async fn test_run_sandboxed_propagates_exit_status() {
        let temp = tempdir().unwrap();
        let opts = options(temp.path(), FakeDaemonBehaviour::Normal, IndexLocation::Temporary);
        let workload = Workload::Command(vec!["printenv".to_string(), "TRACKER_SANDBOX".to_string()]);
        let outcome = run_sandboxed_with_connector(opts, FakeBus::new(), &workload)
            .await
            .unwrap();
        assert_eq!(outcome, WorkloadOutcome::Exited(0));

        let opts = options(temp.path(), FakeDaemonBehaviour::Normal, IndexLocation::Temporary);
        let workload = Workload::Command(vec!["exit".to_string(), "7".to_string()]);
        let outcome = run_sandboxed_with_connector(opts, FakeBus::new(), &workload)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code(), 7);
    }
}
