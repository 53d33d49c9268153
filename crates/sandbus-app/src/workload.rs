//! Running the caller's workload inside the sandbox
//!
//! A command workload runs as `$SHELL -c '<quoted args>'`. An interactive
//! workload starts `$SHELL` itself. Both inherit the sandbox environment.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use nix::sys::signal::Signal;
use tokio::process::Command;

use sandbus_core::prelude::*;
use sandbus_daemon::SignalListener;

use crate::environment::EnvOverlay;

/// What to run once the sandbox is up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workload {
    /// Run these arguments through the shell
    Command(Vec<String>),
    /// Start an interactive shell after printing `banner`
    Interactive { banner: String },
}

impl Workload {
    /// A command workload, or an interactive one when `args` is empty
    pub fn from_args(args: Vec<String>, banner: impl Into<String>) -> Self {
        if args.is_empty() {
            Workload::Interactive {
                banner: banner.into(),
            }
        } else {
            Workload::Command(args)
        }
    }
}

/// How the workload ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadOutcome {
    Exited(i32),
    /// Killed by a signal other than through our SIGINT handling
    Signalled(i32),
    /// The harness saw SIGINT while the command ran
    Interrupted,
}

impl WorkloadOutcome {
    /// Exit status for the harness process
    pub fn exit_code(self) -> i32 {
        match self {
            WorkloadOutcome::Exited(code) => code,
            WorkloadOutcome::Signalled(signal) => 128 + signal,
            WorkloadOutcome::Interrupted => 0,
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => WorkloadOutcome::Exited(code),
            (None, Some(signal)) => WorkloadOutcome::Signalled(signal),
            (None, None) => WorkloadOutcome::Exited(1),
        }
    }
}

/// Quote `arg` for a POSIX shell
pub fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let safe = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r#"'"'"'"#))
    }
}

/// Join `args` into a single shell command line
pub fn command_line(args: &[String]) -> String {
    args.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs workloads with a shell and an environment
#[derive(Debug, Clone)]
pub struct WorkloadRunner {
    shell: PathBuf,
    env: EnvOverlay,
}

impl WorkloadRunner {
    pub fn new(shell: impl Into<PathBuf>, env: EnvOverlay) -> Self {
        Self {
            shell: shell.into(),
            env,
        }
    }

    pub fn shell(&self) -> &Path {
        &self.shell
    }

    pub async fn run(&self, workload: &Workload) -> Result<WorkloadOutcome> {
        match workload {
            Workload::Command(args) => self.run_command(args).await,
            Workload::Interactive { banner } => self.run_interactive(banner).await,
        }
    }

    /// Run `args` through `$SHELL -c`
    ///
    /// SIGINT reaches the child through the terminal; the harness waits for it
    /// to finish and reports [`WorkloadOutcome::Interrupted`].
    pub async fn run_command(&self, args: &[String]) -> Result<WorkloadOutcome> {
        let line = command_line(args);
        let mut command = Command::new(&self.shell);
        command.arg("-c").arg(&line);
        self.env.apply(&mut command);

        debug!("Running: {:?} -c {:?}", self.shell, line);
        let mut interrupt = SignalListener::install(Signal::SIGINT)?;
        let mut child = command.spawn().map_err(|e| {
            Error::process(format!("Failed to run {}: {}", self.shell.display(), e))
        })?;

        tokio::select! {
            status = child.wait() => {
                let outcome = WorkloadOutcome::from_status(status?);
                debug!("Process finished with {:?}", outcome);
                Ok(outcome)
            }
            _ = interrupt.recv() => {
                let status = child.wait().await?;
                debug!("Process exited due to SIGINT ({})", status);
                Ok(WorkloadOutcome::Interrupted)
            }
        }
    }

    /// Print `banner` and run an interactive shell, ignoring SIGINT meanwhile
    ///
    /// The SIGINT disposition in place before the call is restored on return.
    pub async fn run_interactive(&self, banner: &str) -> Result<WorkloadOutcome> {
        println!("{}", banner);
        println!("Starting interactive Tracker sandbox shell... (type 'exit' to finish)");
        println!();

        let mut command = Command::new(&self.shell);
        self.env.apply(&mut command);

        let mut interrupt = SignalListener::install(Signal::SIGINT)?;
        let mut child = command.spawn().map_err(|e| {
            Error::process(format!("Failed to run {}: {}", self.shell.display(), e))
        })?;

        loop {
            tokio::select! {
                status = child.wait() => {
                    return Ok(WorkloadOutcome::from_status(status?));
                }
                _ = interrupt.recv() => trace!("Ignoring SIGINT while the shell runs"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn runner() -> WorkloadRunner {
        let mut env = EnvOverlay::new();
        env.set("TRACKER_SANDBOX", "1");
        WorkloadRunner::new("/bin/sh", env)
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("ls"), "ls");
        assert_eq!(shell_quote("/tmp/a-b_c.txt"), "/tmp/a-b_c.txt");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_command_line() {
        let args = vec!["echo".to_string(), "a b".to_string(), "c".to_string()];
        assert_eq!(command_line(&args), "echo 'a b' c");
    }

    #[test]
    fn test_workload_from_args() {
        assert!(matches!(
            Workload::from_args(vec![], "banner"),
            Workload::Interactive { .. }
        ));
        assert_eq!(
            Workload::from_args(vec!["true".to_string()], "banner"),
            Workload::Command(vec!["true".to_string()])
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(WorkloadOutcome::Exited(4).exit_code(), 4);
        assert_eq!(WorkloadOutcome::Interrupted.exit_code(), 0);
        assert_eq!(WorkloadOutcome::Signalled(15).exit_code(), 143);
    }

    #[tokio::test]
    #[serial]
    async fn test_command_exit_status_is_propagated() {
        let outcome = runner()
            .run_command(&["exit 3".to_string()])
            .await
            .unwrap();
        // A single argument with a space is quoted, so the shell looks for a
        // program named "exit 3"
        assert_eq!(outcome, WorkloadOutcome::Exited(127));

        let outcome = runner()
            .run_command(&["exit".to_string(), "3".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome, WorkloadOutcome::Exited(3));
    }

    #[tokio::test]
    #[serial]
    async fn test_command_sees_overlay() {
        let args = vec!["printenv".to_string(), "TRACKER_SANDBOX".to_string()];
        let outcome = runner().run_command(&args).await.unwrap();
        assert_eq!(outcome, WorkloadOutcome::Exited(0));

        let args = vec!["printenv".to_string(), "SANDBUS_UNSET_VARIABLE".to_string()];
        let outcome = runner().run_command(&args).await.unwrap();
        assert_eq!(outcome, WorkloadOutcome::Exited(1));
    }

    #[tokio::test]
    async fn test_killed_child_reports_signal() {
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg("kill -9 $$")
            .status()
            .await
            .unwrap();
        assert_eq!(
            WorkloadOutcome::from_status(status),
            WorkloadOutcome::Signalled(9)
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_missing_shell_is_process_error() {
        let runner = WorkloadRunner::new("/nonexistent/shell", EnvOverlay::new());
        let err = runner.run_command(&["true".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::Process { .. }));
    }

    #[tokio::test]
    #[serial]
    async fn test_sigint_disposition_is_restored_after_runs() {
        use nix::sys::signal::SigHandler;
        use sandbus_daemon::signals::disposition;

        assert_eq!(disposition(Signal::SIGINT).unwrap(), SigHandler::SigDfl);

        let outcome = runner().run_command(&["true".to_string()]).await.unwrap();
        assert_eq!(outcome, WorkloadOutcome::Exited(0));
        assert_eq!(disposition(Signal::SIGINT).unwrap(), SigHandler::SigDfl);

        let shell = WorkloadRunner::new("/bin/true", EnvOverlay::new());
        shell.run_interactive("Using test daemons").await.unwrap();
        assert_eq!(disposition(Signal::SIGINT).unwrap(), SigHandler::SigDfl);
    }

    #[tokio::test]
    #[serial]
    async fn test_interactive_waits_for_shell() {
        let runner = WorkloadRunner::new("/bin/true", EnvOverlay::new());
        let outcome = runner.run_interactive("Using test daemons").await.unwrap();
        assert_eq!(outcome, WorkloadOutcome::Exited(0));
    }
}
