//! Session file: lets a second harness share an already-running daemon
//!
//! The format is two lines, `address\npid\n`. An absent file means "start
//! fresh"; a file that exists but does not parse is corrupt and is reported
//! as [`Error::SessionFile`].

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use sandbus_core::prelude::*;
use sandbus_core::DaemonSession;

/// Conventional file name inside the sandbox runtime directory
pub const SESSION_FILE_NAME: &str = "dbus-session";

#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Session file at its conventional place inside a runtime directory
    pub fn in_runtime_dir(runtime_dir: &Path) -> Self {
        Self::new(runtime_dir.join(SESSION_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, session: &DaemonSession) -> Result<()> {
        if session.address.contains('\n') {
            return Err(Error::session_file(
                &self.path,
                "address must be a single line",
            ));
        }

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        write!(file, "{}\n{}\n", session.address, session.pid)?;
        file.sync_all()?;

        debug!(
            pid = session.pid,
            file = %self.path.display(),
            "session file written"
        );
        Ok(())
    }

    /// Read the session, `Ok(None)` if the file does not exist
    pub fn read(&self) -> Result<Option<DaemonSession>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        parse_session(&content)
            .map(Some)
            .map_err(|reason| Error::session_file(&self.path, reason))
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(file = %self.path.display(), "session file removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_session(content: &str) -> std::result::Result<DaemonSession, String> {
    let mut lines = content.lines();

    let address = lines
        .next()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| "missing address line".to_string())?;

    let pid_line = lines
        .next()
        .map(str::trim)
        .ok_or_else(|| "missing pid line".to_string())?;

    let pid = pid_line
        .parse::<u32>()
        .map_err(|_| format!("pid {:?} is not a number", pid_line))?;
    if checked_pid(pid).is_err() {
        return Err(format!("pid {} is out of range", pid));
    }

    if lines.any(|l| !l.trim().is_empty()) {
        return Err("unexpected trailing content".to_string());
    }

    Ok(DaemonSession::new(address, pid))
}

/// Convert a pid to the form `kill` takes
///
/// Zero and values above `i32::MAX` would address a process group or every
/// process, so they are rejected.
pub fn checked_pid(pid: u32) -> Result<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(Error::process(format!("pid {} is out of range", pid))),
    }
}

/// Whether a process with this pid currently exists
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = checked_pid(pid) else {
        return false;
    };
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
