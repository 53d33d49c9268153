//! sandbus-app - Sandbox orchestration for the sandbus harness
//!
//! Brings up an isolated environment (private XDG directories, a private bus
//! daemon, a miner configuration), runs a workload in it and tears everything
//! down again on every exit path.

pub mod config;
pub mod environment;
pub mod miner_config;
pub mod sandbox;
pub mod workload;

pub use config::{load_settings, SandboxSettings};
pub use environment::{resolve_verbosity, EnvOverlay, HostEnv, SandboxLayout, Verbosity};
pub use sandbox::{
    run_sandboxed, run_sandboxed_with_connector, DaemonSource, IndexLocation, Sandbox,
    SandboxOptions,
};
pub use workload::{Workload, WorkloadOutcome, WorkloadRunner};
