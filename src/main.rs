//! sandbus - Run Tracker daemons against a private bus and private data
//!
//! This is the binary entry point. All logic lives in the library crates.

use std::path::{Path, PathBuf};

use clap::Parser;
use sandbus_app::environment::TRACKER_VERBOSITY;
use sandbus_app::{
    load_settings, resolve_verbosity, run_sandboxed, DaemonSource, HostEnv, IndexLocation,
    SandboxOptions, Workload,
};
use sandbus_core::logging::{self, LogOptions};
use sandbus_core::prelude::*;

/// Tracker sandbox developer tool
#[derive(Parser, Debug)]
#[command(name = "sandbus")]
#[command(about = "Tracker sandbox developer tool", long_about = None)]
struct Args {
    /// Use a custom D-Bus config file to locate the Tracker daemons, e.g. the
    /// generated ./tests/test-bus.conf of a build tree
    #[arg(long, value_name = "FILE")]
    dbus_config: Option<PathBuf>,

    /// Run Tracker from the given install prefix (`--prefix=/usr` for the
    /// system version)
    #[arg(short, long, value_name = "DIR")]
    prefix: Option<PathBuf>,

    /// Show debugging info from Tracker processes
    #[arg(
        short,
        long,
        value_parser = ["0", "1", "2", "3", "errors", "minimal", "detailed", "debug"]
    )]
    verbosity: Option<String>,

    /// Directory of the index [default: /tmp/tracker-sandbox]
    #[arg(short, long = "index", value_name = "DIR")]
    index: Option<PathBuf>,

    /// Create the index in a temporary directory and delete it on exit
    #[arg(long)]
    index_tmpdir: bool,

    /// Show output of every process on the sandbox bus, not only Tracker daemons
    #[arg(long, alias = "debug-dbus")]
    debug_bus: bool,

    /// Show debugging info from the sandbox itself
    #[arg(long)]
    debug_sandbox: bool,

    /// Settings file [default: $XDG_CONFIG_HOME/sandbus/config.toml]
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Command to run inside the sandbox; an interactive shell when absent
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(e @ Error::Config { .. }) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

async fn run(args: Args) -> Result<i32> {
    let host = HostEnv::capture();
    let cwd = std::env::current_dir()?;
    let home = host.get("HOME").map(PathBuf::from).or_else(dirs::home_dir);
    let expand = |path: PathBuf| expand_path(&path, &cwd, home.as_deref());

    let source = DaemonSource::from_options(args.dbus_config.map(expand), args.prefix.map(expand))?;
    let verbosity = resolve_verbosity(args.verbosity.as_deref(), host.get(TRACKER_VERBOSITY))?;
    let index = IndexLocation::from_options(args.index.map(expand), args.index_tmpdir)?;
    let settings = load_settings(args.config.as_deref())?;

    logging::init(&LogOptions {
        debug_sandbox: args.debug_sandbox,
        debug_bus: args.debug_bus,
        log_dir: settings.log.directory.clone(),
    })?;
    debug!("Index location: {:?}", index);

    let workload = Workload::from_args(args.command, source.to_string());
    let options = SandboxOptions {
        source,
        index,
        verbosity,
        settings,
        host,
        working_dir: cwd.clone(),
    };

    let outcome = run_sandboxed(options, &workload).await?;
    debug!("Workload finished: {:?}", outcome);
    Ok(outcome.exit_code())
}

/// Absolute form of a path given on the command line, with `~` expanded
fn expand_path(path: &Path, cwd: &Path, home: Option<&Path>) -> PathBuf {
    let expanded = match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    };
    if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    }
}
