//! Sandbox directories and environment overlay
//!
//! The harness never changes its own environment. Everything a child needs is
//! collected in an [`EnvOverlay`] and applied to each command explicitly.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use sandbus_core::prelude::*;

pub const TRACKER_VERBOSITY: &str = "TRACKER_VERBOSITY";
pub const TRACKER_SANDBOX: &str = "TRACKER_SANDBOX";
pub const DBUS_SESSION_BUS_ADDRESS: &str = "DBUS_SESSION_BUS_ADDRESS";

/// Prefix whose binaries are already on the default search paths
pub const SYSTEM_PREFIX: &str = "/usr";

/// Default index location when neither `--index` nor `--index-tmpdir` is given
pub const DEFAULT_INDEX_LOCATION: &str = "/tmp/tracker-sandbox";

// ─────────────────────────────────────────────────────────────────
// Verbosity
// ─────────────────────────────────────────────────────────────────

/// Log verbosity passed to the services
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    #[default]
    Errors,
    Minimal,
    Detailed,
    Debug,
}

impl Verbosity {
    pub fn level(self) -> u8 {
        match self {
            Verbosity::Errors => 0,
            Verbosity::Minimal => 1,
            Verbosity::Detailed => 2,
            Verbosity::Debug => 3,
        }
    }
}

impl FromStr for Verbosity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "0" | "errors" => Ok(Verbosity::Errors),
            "1" | "minimal" => Ok(Verbosity::Minimal),
            "2" | "detailed" => Ok(Verbosity::Detailed),
            "3" | "debug" => Ok(Verbosity::Debug),
            other => Err(Error::config(format!("Invalid verbosity: {:?}", other))),
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// Combine `--verbosity` with an inherited `TRACKER_VERBOSITY`
///
/// Without the flag the inherited value is used (default `0`). With both, they
/// must agree.
pub fn resolve_verbosity(flag: Option<&str>, inherited: Option<&str>) -> Result<Verbosity> {
    let inherited = inherited.map(str::parse::<Verbosity>).transpose()?;
    match flag {
        None => Ok(inherited.unwrap_or_default()),
        Some(flag) => {
            let verbosity = flag.parse::<Verbosity>()?;
            match inherited {
                Some(existing) if existing != verbosity => Err(Error::config(
                    "Incompatible values for TRACKER_VERBOSITY from environment and from \
                     --verbosity parameter.",
                )),
                _ => Ok(verbosity),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Host environment snapshot
// ─────────────────────────────────────────────────────────────────

/// The harness's environment as read once at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEnv {
    vars: BTreeMap<String, String>,
}

impl HostEnv {
    /// Snapshot the current process environment
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Login shell, `/bin/bash` when `SHELL` is unset
    pub fn shell(&self) -> PathBuf {
        PathBuf::from(self.get("SHELL").unwrap_or("/bin/bash"))
    }

    /// The user's real data directory, before any sandbox override
    pub fn user_data_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = self.get("XDG_DATA_HOME").filter(|d| !d.is_empty()) {
            return Some(PathBuf::from(dir));
        }
        self.get("HOME")
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .map(|home| home.join(".local").join("share"))
    }
}

// ─────────────────────────────────────────────────────────────────
// Directory layout
// ─────────────────────────────────────────────────────────────────

/// Private XDG directories under the index location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLayout {
    index: PathBuf,
}

impl SandboxLayout {
    pub fn new(index: impl Into<PathBuf>) -> Self {
        Self {
            index: index.into(),
        }
    }

    pub fn index(&self) -> &Path {
        &self.index
    }

    pub fn data_home(&self) -> PathBuf {
        self.index.join("data")
    }

    pub fn config_home(&self) -> PathBuf {
        self.index.join("config")
    }

    pub fn cache_home(&self) -> PathBuf {
        self.index.join("cache")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.index.join("run")
    }

    /// Create every directory; the runtime dir is private to the user
    pub fn create(&self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        for dir in [self.data_home(), self.config_home(), self.cache_home()] {
            std::fs::create_dir_all(&dir)?;
        }
        let runtime = self.runtime_dir();
        std::fs::create_dir_all(&runtime)?;
        std::fs::set_permissions(&runtime, std::fs::Permissions::from_mode(0o700))?;

        debug!("Using index location {:?}", self.index);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Environment overlay
// ─────────────────────────────────────────────────────────────────

/// Variables set on top of the inherited environment of a child
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverlay {
    vars: BTreeMap<String, String>,
}

impl EnvOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay for the daemon and the services it activates
    pub fn for_sandbox(
        layout: &SandboxLayout,
        prefix: Option<&Path>,
        verbosity: Verbosity,
        host: &HostEnv,
    ) -> Self {
        let mut overlay = Self::new();

        overlay.set("XDG_DATA_HOME", path_string(&layout.data_home()));
        overlay.set("XDG_CONFIG_HOME", path_string(&layout.config_home()));
        overlay.set("XDG_CACHE_HOME", path_string(&layout.cache_home()));
        overlay.set("XDG_RUNTIME_DIR", path_string(&layout.runtime_dir()));

        if let Some(prefix) = prefix.filter(|p| *p != Path::new(SYSTEM_PREFIX)) {
            debug!("Using prefix location {:?}", prefix);
            overlay.prepend_path(host, "PATH", &prefix.join("bin"));
            overlay.prepend_path(host, "LD_LIBRARY_PATH", &prefix.join("lib"));
            overlay.prepend_path(host, "XDG_DATA_DIRS", &prefix.join("share"));
        }

        overlay.set("G_MESSAGES_PREFIXED", "all");
        overlay.set("GVFS_DISABLE_FUSE", "1");
        overlay.set("TRACKER_USE_CONFIG_FILES", "yes");
        overlay.set(TRACKER_VERBOSITY, verbosity.to_string());
        overlay
    }

    /// This overlay plus the bus address and the sandbox marker
    pub fn for_workload(&self, bus_address: &str) -> Self {
        let mut overlay = self.clone();
        overlay.set(DBUS_SESSION_BUS_ADDRESS, bus_address);
        overlay.set(TRACKER_SANDBOX, "1");
        overlay
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.vars.clone()
    }

    /// Set every variable on `command`
    pub fn apply(&self, command: &mut tokio::process::Command) {
        command.envs(&self.vars);
    }

    fn prepend_path(&mut self, host: &HostEnv, name: &str, entry: &Path) {
        let entry = path_string(entry);
        let value = match host.get(name).filter(|v| !v.is_empty()) {
            Some(existing) => format!("{}:{}", entry, existing),
            None => entry,
        };
        self.set(name, value);
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Link the user's MIME database into the sandbox data home
///
/// MIME type detection breaks without `$XDG_DATA_HOME/mime`. Nothing happens
/// when the user has no MIME data, or when the sandbox already has an entry
/// (even a dangling link). Returns whether a link was created.
pub fn link_mime_data(original_data_home: &Path, sandbox_data_home: &Path) -> Result<bool> {
    let original = original_data_home.join("mime");
    if !original.exists() {
        return Ok(false);
    }

    let link = sandbox_data_home.join("mime");
    if link.symlink_metadata().is_ok() {
        return Ok(false);
    }

    std::fs::create_dir_all(sandbox_data_home)?;
    std::os::unix::fs::symlink(&original, &link)?;
    debug!("Linked {:?} -> {:?}", link, original);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn test_verbosity_parses_digits_and_names() {
        assert_eq!("0".parse::<Verbosity>().unwrap(), Verbosity::Errors);
        assert_eq!("detailed".parse::<Verbosity>().unwrap(), Verbosity::Detailed);
        assert_eq!("3".parse::<Verbosity>().unwrap(), Verbosity::Debug);
        assert!("loud".parse::<Verbosity>().is_err());
        assert_eq!(Verbosity::Minimal.to_string(), "1");
    }

    #[test]
    fn test_resolve_verbosity() {
        assert_eq!(resolve_verbosity(None, None).unwrap(), Verbosity::Errors);
        assert_eq!(resolve_verbosity(None, Some("2")).unwrap(), Verbosity::Detailed);
        assert_eq!(resolve_verbosity(Some("debug"), None).unwrap(), Verbosity::Debug);
        assert_eq!(resolve_verbosity(Some("minimal"), Some("1")).unwrap(), Verbosity::Minimal);
    }

    #[test]
    fn test_conflicting_verbosity_is_config_error() {
        let err = resolve_verbosity(Some("3"), Some("0")).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("TRACKER_VERBOSITY"));
    }

    #[test]
    fn test_layout_paths_and_create() {
        let temp = tempdir().unwrap();
        let layout = SandboxLayout::new(temp.path().join("index"));
        layout.create().unwrap();

        assert!(layout.data_home().is_dir());
        assert!(layout.cache_home().is_dir());
        assert!(layout.config_home().ends_with("index/config"));

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(layout.runtime_dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_overlay_with_custom_prefix() {
        let layout = SandboxLayout::new("/tmp/box");
        let host = HostEnv::from_pairs([("PATH", "/usr/bin:/bin")]);
        let overlay = EnvOverlay::for_sandbox(
            &layout,
            Some(Path::new("/opt/tracker")),
            Verbosity::Detailed,
            &host,
        );

        assert_eq!(overlay.get("XDG_DATA_HOME"), Some("/tmp/box/data"));
        assert_eq!(overlay.get("XDG_RUNTIME_DIR"), Some("/tmp/box/run"));
        assert_eq!(overlay.get("PATH"), Some("/opt/tracker/bin:/usr/bin:/bin"));
        assert_eq!(overlay.get("LD_LIBRARY_PATH"), Some("/opt/tracker/lib"));
        assert_eq!(overlay.get("XDG_DATA_DIRS"), Some("/opt/tracker/share"));
        assert_eq!(overlay.get("G_MESSAGES_PREFIXED"), Some("all"));
        assert_eq!(overlay.get(TRACKER_VERBOSITY), Some("2"));
        assert_eq!(overlay.get(TRACKER_SANDBOX), None);
    }

    #[test]
    fn test_system_prefix_leaves_paths_alone() {
        let layout = SandboxLayout::new("/tmp/box");
        let host = HostEnv::from_pairs([("PATH", "/usr/bin")]);
        let overlay =
            EnvOverlay::for_sandbox(&layout, Some(Path::new("/usr")), Verbosity::Errors, &host);
        assert_eq!(overlay.get("PATH"), None);
        assert_eq!(overlay.get("LD_LIBRARY_PATH"), None);
    }

    #[test]
    fn test_workload_overlay_adds_bus_address() {
        let base = EnvOverlay::for_sandbox(
            &SandboxLayout::new("/tmp/box"),
            None,
            Verbosity::Errors,
            &HostEnv::default(),
        );
        let workload = base.for_workload("unix:path=/tmp/box/run/bus");

        assert_eq!(workload.get(DBUS_SESSION_BUS_ADDRESS), Some("unix:path=/tmp/box/run/bus"));
        assert_eq!(workload.get(TRACKER_SANDBOX), Some("1"));
        assert_eq!(base.get(DBUS_SESSION_BUS_ADDRESS), None);
    }

    #[test]
    #[serial]
    fn test_capture_reads_process_environment() {
        std::env::set_var("SANDBUS_TEST_CAPTURE", "yes");
        let host = HostEnv::capture();
        std::env::remove_var("SANDBUS_TEST_CAPTURE");

        assert_eq!(host.get("SANDBUS_TEST_CAPTURE"), Some("yes"));
        assert_eq!(HostEnv::capture().get("SANDBUS_TEST_CAPTURE"), None);
    }

    #[test]
    fn test_user_data_dir() {
        let host = HostEnv::from_pairs([("XDG_DATA_HOME", "/data"), ("HOME", "/home/u")]);
        assert_eq!(host.user_data_dir(), Some(PathBuf::from("/data")));

        let host = HostEnv::from_pairs([("HOME", "/home/u")]);
        assert_eq!(host.user_data_dir(), Some(PathBuf::from("/home/u/.local/share")));
        assert_eq!(host.shell(), PathBuf::from("/bin/bash"));
    }

    #[test]
    fn test_link_mime_data_once() {
        let temp = tempdir().unwrap();
        let original = temp.path().join("home-data");
        std::fs::create_dir_all(original.join("mime")).unwrap();
        let sandbox = temp.path().join("box-data");

        assert!(link_mime_data(&original, &sandbox).unwrap());
        assert!(sandbox.join("mime").is_dir());
        assert!(!link_mime_data(&original, &sandbox).unwrap());
    }

    #[test]
    fn test_link_mime_data_without_mime_dir() {
        let temp = tempdir().unwrap();
        let sandbox = temp.path().join("box-data");
        assert!(!link_mime_data(temp.path(), &sandbox).unwrap());
        assert!(!sandbox.exists());
    }

    #[test]
    fn test_link_mime_data_keeps_existing_entry() {
        let temp = tempdir().unwrap();
        let original = temp.path().join("home-data");
        std::fs::create_dir_all(original.join("mime")).unwrap();
        let sandbox = temp.path().join("box-data");
        std::fs::create_dir_all(sandbox.join("mime")).unwrap();

        assert!(!link_mime_data(&original, &sandbox).unwrap());
        assert!(!sandbox.join("mime").symlink_metadata().unwrap().file_type().is_symlink());
    }
}
