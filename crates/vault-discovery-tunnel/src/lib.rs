//! Tunnel construction and primary election
//!
//! Opens one tunnel per candidate node, probes each for Vault's health and
//! keeps the tunnel that reaches the active (non-standby) node.

pub mod election;
pub mod health;
pub mod port;
pub mod process;
pub mod readiness;

pub use election::{
    AttemptOutcome, AttemptReport, AttemptState, ElectedTunnel, Election, ElectionError,
    ElectionRound, WinnerSlot,
};
pub use health::{
    parse_bool, ConfigError, HealthProber, HealthResponse, HealthStatus, ProbeConfig, ProbeError,
};
pub use port::PortAllocator;
pub use process::{ProcessLauncher, TunnelHandle, TunnelLauncher, TunnelProcess};
pub use readiness::ReadinessWaiter;

use std::time::Duration;
use thiserror::Error;

/// Errors scoped to a single tunnel attempt.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Could not find an available local TCP port after {attempts} attempts")]
    NoPortAvailable { attempts: u32 },

    #[error("Could not find executable '{program}' in PATH")]
    ExecutableNotFound { program: String },

    #[error("Failed to start tunnel to {node}: {source}")]
    SpawnFailed {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not connect to the tunnel on 127.0.0.1:{local_port} within {waited:?}")]
    ReadinessTimeout { local_port: u16, waited: Duration },

    #[error("Tunnel to {node} exited before becoming ready (exit code {code:?})")]
    TunnelExited { node: String, code: Option<i32> },

    #[error("Health probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
