//! Tunnel subprocess supervision
//!
//! One `gcloud compute start-iap-tunnel` child per candidate node. The child
//! binds a loopback port and relays it to the node's service port.

use crate::TunnelError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use vault_discovery_inventory::CandidateNode;

/// How long an interrupted tunnel gets to exit before it is killed.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Starts tunnels to candidate nodes.
#[async_trait]
pub trait TunnelLauncher: Send + Sync + 'static {
    type Tunnel: TunnelHandle;

    /// Start a tunnel exposing `node`'s service port on `127.0.0.1:local_port`.
    async fn launch(
        &self,
        node: &CandidateNode,
        local_port: u16,
    ) -> Result<Self::Tunnel, TunnelError>;
}

/// A running tunnel owned by exactly one attempt (or by the elected tunnel).
#[async_trait]
pub trait TunnelHandle: Send + 'static {
    /// Resolves when the tunnel exits on its own, with its exit code if any.
    async fn closed(&mut self) -> Option<i32>;

    /// Interrupt the tunnel and release its resources.
    ///
    /// Failures are logged, never returned: a tunnel that refuses to die must
    /// not abort the election.
    async fn stop(&mut self);
}

/// Launches tunnels as child processes of the configured executable.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    project: String,
    remote_port: u16,
    debug: bool,
}

impl ProcessLauncher {
    /// Resolves `program` on `PATH` up front; a missing executable fails here,
    /// once, instead of in every attempt.
    pub fn new(
        program: impl AsRef<Path>,
        project: impl Into<String>,
        remote_port: u16,
    ) -> Result<Self, TunnelError> {
        let program = resolve_executable(program.as_ref())?;
        Ok(Self {
            program,
            project: project.into(),
            remote_port,
            debug: false,
        })
    }

    /// Pass the tunnel's stdout/stderr through instead of discarding them.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn args(&self, node: &CandidateNode, local_port: u16) -> Vec<String> {
        vec![
            "compute".to_string(),
            "start-iap-tunnel".to_string(),
            node.name.clone(),
            self.remote_port.to_string(),
            "--project".to_string(),
            self.project.clone(),
            "--local-host-port".to_string(),
            format!("127.0.0.1:{}", local_port),
            "--zone".to_string(),
            node.zone.clone(),
        ]
    }
}

#[async_trait]
impl TunnelLauncher for ProcessLauncher {
    type Tunnel = TunnelProcess;

    async fn launch(
        &self,
        node: &CandidateNode,
        local_port: u16,
    ) -> Result<TunnelProcess, TunnelError> {
        let mut command = Command::new(&self.program);
        command.args(self.args(node, local_port));
        if self.debug {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        TunnelProcess::spawn(command, node, local_port)
    }
}

/// A tunnel child process.
#[derive(Debug)]
pub struct TunnelProcess {
    node: CandidateNode,
    local_port: u16,
    child: Child,
}

impl TunnelProcess {
    pub(crate) fn spawn(
        mut command: Command,
        node: &CandidateNode,
        local_port: u16,
    ) -> Result<Self, TunnelError> {
        let child = command
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::SpawnFailed {
                node: node.to_string(),
                source,
            })?;

        debug!(
            node = %node,
            local_port,
            pid = child.id().unwrap_or(0),
            "Started tunnel process"
        );

        Ok(Self {
            node: node.clone(),
            local_port,
            child,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    #[cfg(unix)]
    fn interrupt(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return;
        };
        #[allow(clippy::cast_possible_wrap)]
        let target = Pid::from_raw(pid as i32);
        if let Err(e) = kill(target, Signal::SIGINT) {
            warn!(
                node = %self.node,
                local_port = self.local_port,
                pid,
                "Could not gracefully interrupt the tunnel: {}", e
            );
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(
                node = %self.node,
                local_port = self.local_port,
                "Could not interrupt the tunnel: {}", e
            );
        }
    }
}

#[async_trait]
impl TunnelHandle for TunnelProcess {
    async fn closed(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(node = %self.node, "Could not wait for tunnel process: {}", e);
                None
            }
        }
    }

    async fn stop(&mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(node = %self.node, %status, "Tunnel process already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(node = %self.node, "Could not poll tunnel process: {}", e),
        }

        self.interrupt();

        match timeout(STOP_GRACE_PERIOD, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(
                    node = %self.node,
                    local_port = self.local_port,
                    %status,
                    "Tunnel process stopped"
                );
            }
            Ok(Err(e)) => {
                warn!(
                    node = %self.node,
                    "Could not release tunnel OS resources: {}", e
                );
            }
            Err(_) => {
                warn!(
                    node = %self.node,
                    grace_secs = STOP_GRACE_PERIOD.as_secs(),
                    "Tunnel ignored interrupt, killing it"
                );
                if let Err(e) = self.child.kill().await {
                    warn!(node = %self.node, "Could not kill tunnel process: {}", e);
                }
            }
        }
    }
}

/// Find `program` the way a shell would: paths with a separator are taken as
/// is, bare names are searched in `PATH`.
pub fn resolve_executable(program: &Path) -> Result<PathBuf, TunnelError> {
    let not_found = || TunnelError::ExecutableNotFound {
        program: program.display().to_string(),
    };

    if program.components().count() > 1 {
        return if is_executable(program) {
            Ok(program.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    let path = std::env::var_os("PATH").ok_or_else(not_found)?;
    let found = std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(not_found)?;

    info!(program = %found.display(), "Resolved tunnel executable");
    Ok(found)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}
