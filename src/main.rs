//! Vault discovery - expose the primary Vault node on a local port
//!
//! Tunnels to every candidate node at once, keeps the tunnel whose node
//! reports itself as the active primary and relays local clients through it.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vault_discovery_inventory::{
    discover_candidates, CandidateNode, GcloudInventory, InstanceFilter, InstanceRecord,
    StaticInventory,
};
use vault_discovery_relay::{RelayConfig, RelayError, RelayServer};
use vault_discovery_tunnel::{
    parse_bool, Election, HealthProber, ProbeConfig, ProcessLauncher, TunnelHandle,
};

/// Vault discovery - reach the primary Vault node through an IAP tunnel
#[derive(Parser, Debug)]
#[command(name = "vault-discovery")]
#[command(about = "Vault discovery - reach the primary Vault node through an IAP tunnel")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
Vault discovery opens an IAP tunnel to every candidate Vault node in a
Google Cloud project, probes each one's health endpoint and keeps the tunnel
to the active (non-standby) node. That node is then exposed on a local
address so ordinary Vault clients can use it as if it were local.

EXAMPLES:
  # Discover among every instance in the project
  GOOGLE_PROJECT=my-project vault-discovery

  # Only instances tagged `vault` whose name contains `prod`
  vault-discovery --project my-project --tag-filter vault --name-filter prod

  # Skip inventory listing and race two known nodes
  vault-discovery --project my-project \
    --instance europe-west1-b/vault-1 --instance europe-west1-c/vault-2

ENVIRONMENT VARIABLES:
  GOOGLE_PROJECT         Project to discover instances in (required)
  TAG_INSTANCE_FILTER    Network tag instances must carry
  LABEL_INSTANCE_FILTER  Label value (or key=value) instances must carry
  NAME_INSTANCE_FILTER   Substring instance names must contain
  TLS_SKIP_VERIFY        Skip TLS verification of the health probe (true/false)
  TUNNEL_DEBUG           Show the tunnel processes' output (true/false)
"#)]
struct Args {
    /// Google Cloud project
    #[arg(long, env = "GOOGLE_PROJECT")]
    project: String,

    /// Keep instances with this network tag (case-insensitive)
    #[arg(long, env = "TAG_INSTANCE_FILTER")]
    tag_filter: Option<String>,

    /// Keep instances with this label value, or `key=value` (case-insensitive)
    #[arg(long, env = "LABEL_INSTANCE_FILTER")]
    label_filter: Option<String>,

    /// Keep instances whose name contains this substring
    #[arg(long, env = "NAME_INSTANCE_FILTER")]
    name_filter: Option<String>,

    /// Skip TLS certificate verification for the health probe
    #[arg(long, env = "TLS_SKIP_VERIFY", num_args = 0..=1, default_missing_value = "true")]
    tls_skip_verify: Option<String>,

    /// Pass the tunnel processes' stdout/stderr through
    #[arg(long, env = "TUNNEL_DEBUG", num_args = 0..=1, default_missing_value = "true")]
    tunnel_debug: Option<String>,

    /// Local address clients connect to
    #[arg(long, env = "VAULT_LISTEN_ADDR", default_value = "127.0.0.1:8200")]
    listen: SocketAddr,

    /// Vault port on the instances
    #[arg(long, env = "VAULT_REMOTE_PORT", default_value_t = 8200)]
    remote_port: u16,

    /// Scheme of the Vault API
    #[arg(long, env = "VAULT_SCHEME", default_value = "https")]
    scheme: String,

    /// Health endpoint path
    #[arg(long, env = "VAULT_HEALTH_PATH", default_value = "/v1/sys/health")]
    health_path: String,

    /// gcloud executable used for listing instances and tunnelling
    #[arg(long, env = "GCLOUD_BIN", default_value = "gcloud")]
    gcloud: PathBuf,

    /// Candidate instance as zone/name; skips inventory listing (repeatable)
    #[arg(long = "instance", env = "VAULT_INSTANCES", value_delimiter = ',')]
    instances: Vec<CandidateNode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Boolean switches default to false when unset.
fn flag(name: &str, value: Option<&str>) -> Result<bool> {
    match value {
        Some(value) => Ok(parse_bool(name, value)?),
        None => Ok(false),
    }
}

fn instance_filter(args: &Args) -> InstanceFilter {
    InstanceFilter {
        tag: args.tag_filter.clone(),
        label: args.label_filter.clone(),
        name: args.name_filter.clone(),
    }
}

/// Start listening for Ctrl-C right away; the returned token is cancelled
/// on the first interrupt.
fn interrupt_listener() -> Result<CancellationToken> {
    let interrupted = CancellationToken::new();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        // Registered synchronously, before any tunnel is spawned.
        let mut sigint =
            signal(SignalKind::interrupt()).context("Could not listen for interrupts")?;
        let token = interrupted.clone();
        tokio::spawn(async move {
            if sigint.recv().await.is_some() {
                token.cancel();
            }
        });
    }

    #[cfg(not(unix))]
    {
        let token = interrupted.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => token.cancel(),
                Err(e) => tracing::error!("Could not listen for interrupts: {}", e),
            }
        });
    }

    Ok(interrupted)
}

/// Run `fut` unless an interrupt arrives first. On interrupt the future is
/// dropped, which tears down whatever it owns.
async fn until_interrupted<F: Future>(
    interrupted: &CancellationToken,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = interrupted.cancelled() => None,
        output = fut => Some(output),
    }
}

enum Stopped {
    Interrupted,
    TunnelExited(Option<i32>),
    Relay(Result<Result<(), RelayError>, tokio::task::JoinError>),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;
    let interrupted = interrupt_listener()?;

    info!(
        version = env!("GIT_TAG"),
        commit = env!("GIT_HASH"),
        "Vault discovery starting"
    );

    let tls_skip_verify = flag("TLS_SKIP_VERIFY", args.tls_skip_verify.as_deref())?;
    let tunnel_debug = flag("TUNNEL_DEBUG", args.tunnel_debug.as_deref())?;
    if tls_skip_verify {
        warn!("TLS verification of the health probe is disabled");
    }

    let launcher = ProcessLauncher::new(&args.gcloud, &args.project, args.remote_port)
        .with_context(|| format!("Could not find {} in PATH", args.gcloud.display()))?
        .with_debug(tunnel_debug);

    let discovery = async {
        if args.instances.is_empty() {
            let inventory = GcloudInventory::new(launcher.program());
            discover_candidates(&inventory, &args.project, &instance_filter(&args)).await
        } else {
            info!(
                count = args.instances.len(),
                "Using instances from the command line"
            );
            let records = args
                .instances
                .iter()
                .cloned()
                .map(InstanceRecord::from)
                .collect();
            let inventory = StaticInventory::new(records);
            discover_candidates(&inventory, &args.project, &InstanceFilter::default()).await
        }
    };
    let candidates = match until_interrupted(&interrupted, discovery).await {
        Some(candidates) => candidates.context("Could not get candidate instances")?,
        None => {
            info!("Received an interrupt during discovery, stopping...");
            return Ok(());
        }
    };

    let prober = HealthProber::new(ProbeConfig {
        scheme: args.scheme.clone(),
        path: args.health_path.clone(),
        tls_skip_verify,
        ..Default::default()
    })
    .context("Could not build the health probe client")?;

    let election = Election::new(launcher, prober);
    // Dropping an unfinished election stops every tunnel it started.
    let mut elected = match until_interrupted(&interrupted, election.run(candidates)).await {
        Some(elected) => elected.context("Primary election failed")?,
        None => {
            info!("Received an interrupt during the election, stopping...");
            return Ok(());
        }
    };

    info!(
        node = %elected.node,
        local_port = elected.local_port,
        "Tunnel to primary Vault instance is up"
    );

    let relay = match RelayServer::bind(RelayConfig {
        bind_addr: args.listen,
        upstream_addr: elected.upstream_addr(),
    })
    .await
    {
        Ok(relay) => relay,
        Err(e) => {
            elected.shutdown().await;
            return Err(e).context("Could not start listener");
        }
    };

    let shutdown = CancellationToken::new();
    let mut relay_task = tokio::spawn(relay.serve(shutdown.clone()));

    let stopped = tokio::select! {
        _ = interrupted.cancelled() => Stopped::Interrupted,
        code = elected.tunnel.closed() => Stopped::TunnelExited(code),
        result = &mut relay_task => Stopped::Relay(result),
    };

    shutdown.cancel();

    let outcome = match stopped {
        Stopped::Interrupted => {
            info!("Received an interrupt, stopping...");
            if let Err(e) = relay_task.await {
                warn!("Relay listener task failed during shutdown: {}", e);
            }
            Ok(())
        }
        Stopped::TunnelExited(code) => {
            let _ = relay_task.await;
            Err(anyhow!(
                "Tunnel to primary {} exited unexpectedly (exit code {:?})",
                elected.node,
                code
            ))
        }
        Stopped::Relay(Ok(Ok(()))) => Ok(()),
        Stopped::Relay(Ok(Err(e))) => Err(e).context("Relay listener failed"),
        Stopped::Relay(Err(e)) => Err(anyhow!("Relay listener task panicked: {}", e)),
    };

    elected.shutdown().await;
    info!("Vault discovery stopped");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_parsing() {
        assert!(!flag("TLS_SKIP_VERIFY", None).unwrap());
        assert!(flag("TLS_SKIP_VERIFY", Some("true")).unwrap());
        assert!(flag("TLS_SKIP_VERIFY", Some("1")).unwrap());
        assert!(!flag("TLS_SKIP_VERIFY", Some("False")).unwrap());

        let err = flag("TLS_SKIP_VERIFY", Some("maybe")).unwrap_err();
        assert!(err.to_string().contains("TLS_SKIP_VERIFY"));
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["vault-discovery", "--project", "p"]).unwrap();
        assert_eq!(args.listen, "127.0.0.1:8200".parse::<SocketAddr>().unwrap());
        assert_eq!(args.remote_port, 8200);
        assert_eq!(args.scheme, "https");
        assert_eq!(args.health_path, "/v1/sys/health");
        assert_eq!(args.gcloud, PathBuf::from("gcloud"));
        assert!(args.instances.is_empty());
    }

    #[test]
    fn test_args_flags_and_instances() {
        let args = Args::try_parse_from([
            "vault-discovery",
            "--project",
            "p",
            "--tls-skip-verify",
            "--tunnel-debug",
            "false",
            "--name-filter",
            "vault-2",
            "--instance",
            "europe-west1-b/vault-1",
            "--instance",
            "europe-west1-c/vault-2",
        ])
        .unwrap();

        assert_eq!(args.tls_skip_verify.as_deref(), Some("true"));
        assert_eq!(args.tunnel_debug.as_deref(), Some("false"));
        assert_eq!(args.instances.len(), 2);
        assert_eq!(args.instances[1].zone, "europe-west1-c");

        let filter = instance_filter(&args);
        assert_eq!(filter.name.as_deref(), Some("vault-2"));
        assert!(filter.tag.is_none());
    }

    #[test]
    fn test_args_reject_bad_instance() {
        let result = Args::try_parse_from([
            "vault-discovery",
            "--project",
            "p",
            "--instance",
            "vault-1",
        ]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_until_interrupted_drops_pending_work() {
        let interrupted = CancellationToken::new();

        struct Guard(std::sync::Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let guard = Guard(dropped.clone());
        let work = async move {
            let _guard = guard;
            std::future::pending::<()>().await
        };

        let canceller = interrupted.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            until_interrupted(&interrupted, work),
        )
        .await
        .expect("interrupt should end the wait");
        assert!(result.is_none());
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_until_interrupted_passes_output_through() {
        let interrupted = CancellationToken::new();
        let result = until_interrupted(&interrupted, async { 7 }).await;
        assert_eq!(result, Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interrupt_listener_catches_sigint() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::getpid;

        let interrupted = interrupt_listener().unwrap();
        kill(getpid(), Signal::SIGINT).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(2), interrupted.cancelled())
            .await
            .expect("SIGINT should cancel the token");
    }
}
