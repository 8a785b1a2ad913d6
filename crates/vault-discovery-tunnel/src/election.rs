//! Primary election
//!
//! Every candidate node gets its own attempt, all started at once:
//!
//! ```text
//! Spawning -> AwaitingSocket -> Probing -> Won | Lost
//!     \              \              \
//!      `-> Failed     `-> Failed     `-> Failed
//! ```
//!
//! The first attempt to reach `Won` hands its tunnel to a [`WinnerSlot`].
//! Admission is single-shot, so any later winner gets its tunnel back and
//! stops it. Once a winner is in, the remaining attempts are cancelled and
//! stop their own tunnels; the round only returns after every attempt has
//! finished, so no loser outlives it.

use crate::health::{HealthProber, HealthStatus};
use crate::port::PortAllocator;
use crate::process::{TunnelHandle, TunnelLauncher};
use crate::readiness::ReadinessWaiter;
use crate::TunnelError;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vault_discovery_inventory::CandidateNode;

#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("No candidate nodes to elect a primary from")]
    NoCandidates,

    #[error("No primary found among {attempted} candidate(s): {standby} standby, {failed} failed")]
    NoPrimaryFound {
        attempted: usize,
        standby: usize,
        failed: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Spawning,
    AwaitingSocket,
    Probing,
    Won,
    Lost,
    Failed,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptState::Spawning => "spawning",
            AttemptState::AwaitingSocket => "awaiting-socket",
            AttemptState::Probing => "probing",
            AttemptState::Won => "won",
            AttemptState::Lost => "lost",
            AttemptState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How an attempt ended.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Probed as primary and admitted as the winner.
    Won,
    /// Probed as standby.
    Standby,
    Failed(TunnelError),
    /// Interrupted because another attempt already won.
    Cancelled,
    /// Probed as primary after the slot was already taken.
    Redundant,
}

impl AttemptOutcome {
    pub fn state(&self) -> AttemptState {
        match self {
            AttemptOutcome::Won => AttemptState::Won,
            AttemptOutcome::Failed(_) => AttemptState::Failed,
            AttemptOutcome::Standby | AttemptOutcome::Cancelled | AttemptOutcome::Redundant => {
                AttemptState::Lost
            }
        }
    }
}

#[derive(Debug)]
pub struct AttemptReport {
    pub node: CandidateNode,
    pub local_port: Option<u16>,
    pub outcome: AttemptOutcome,
}

/// The winning attempt's tunnel and its open socket.
pub struct ElectedTunnel<T> {
    pub node: CandidateNode,
    pub local_port: u16,
    pub tunnel: T,
    connection: TcpStream,
}

impl<T: TunnelHandle> ElectedTunnel<T> {
    /// Loopback address the elected tunnel listens on.
    pub fn upstream_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.local_port))
    }

    pub fn connection(&self) -> &TcpStream {
        &self.connection
    }

    /// Close the socket and stop the tunnel.
    pub async fn shutdown(self) {
        let ElectedTunnel {
            node,
            mut tunnel,
            connection,
            ..
        } = self;
        drop(connection);
        tunnel.stop().await;
        info!(node = %node, "Elected tunnel closed");
    }
}

impl<T> fmt::Debug for ElectedTunnel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElectedTunnel")
            .field("node", &self.node)
            .field("local_port", &self.local_port)
            .finish_non_exhaustive()
    }
}

/// Single-admission hand-off for the election winner.
///
/// `offer` succeeds for exactly one caller; everyone else gets their value
/// back and must release it.
pub struct WinnerSlot<T> {
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> WinnerSlot<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    pub fn offer(&self, value: T) -> Result<(), T> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(tx) => tx.send(value),
            None => Err(value),
        }
    }

    pub fn is_taken(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

/// Result of one round: the winner (if any) and what happened to each node.
#[derive(Debug)]
pub struct ElectionRound<T> {
    pub winner: Option<ElectedTunnel<T>>,
    pub reports: Vec<AttemptReport>,
}

/// Races tunnels to every candidate and keeps the one in front of the primary.
pub struct Election<L: TunnelLauncher> {
    launcher: Arc<L>,
    prober: Arc<HealthProber>,
    allocator: PortAllocator,
    readiness: ReadinessWaiter,
}

impl<L: TunnelLauncher> Election<L> {
    pub fn new(launcher: L, prober: HealthProber) -> Self {
        Self {
            launcher: Arc::new(launcher),
            prober: Arc::new(prober),
            allocator: PortAllocator::new(),
            readiness: ReadinessWaiter::new(),
        }
    }

    pub fn with_allocator(mut self, allocator: PortAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessWaiter) -> Self {
        self.readiness = readiness;
        self
    }

    /// Elect the primary, failing if no candidate probes as primary.
    pub async fn run(
        &self,
        candidates: Vec<CandidateNode>,
    ) -> Result<ElectedTunnel<L::Tunnel>, ElectionError> {
        if candidates.is_empty() {
            return Err(ElectionError::NoCandidates);
        }
        let attempted = candidates.len();

        let round = self.run_round(candidates).await;
        match round.winner {
            Some(elected) => Ok(elected),
            None => {
                let standby = round
                    .reports
                    .iter()
                    .filter(|r| matches!(r.outcome, AttemptOutcome::Standby))
                    .count();
                Err(ElectionError::NoPrimaryFound {
                    attempted,
                    standby,
                    failed: attempted - standby,
                })
            }
        }
    }

    /// Run one round to completion. Every losing tunnel has been stopped by the
    /// time this returns.
    pub async fn run_round(&self, candidates: Vec<CandidateNode>) -> ElectionRound<L::Tunnel> {
        let round_id = Uuid::new_v4();
        let (slot, mut winner_rx) = WinnerSlot::new();
        let slot = Arc::new(slot);
        let cancel = CancellationToken::new();

        info!(
            round = %round_id,
            candidates = candidates.len(),
            "Starting primary election"
        );

        let mut attempts = JoinSet::new();
        for node in candidates {
            let attempt = Attempt {
                node,
                launcher: Arc::clone(&self.launcher),
                prober: Arc::clone(&self.prober),
                allocator: self.allocator.clone(),
                readiness: self.readiness,
                slot: Arc::clone(&slot),
                cancel: cancel.clone(),
            };
            attempts.spawn(attempt.run());
        }
        // Attempts hold the only remaining references, so the receiver
        // resolves with an error once they have all finished without a winner.
        drop(slot);

        let mut winner = None;
        let mut awaiting_winner = true;
        let mut reports = Vec::new();

        loop {
            tokio::select! {
                received = &mut winner_rx, if awaiting_winner => {
                    awaiting_winner = false;
                    if let Ok(elected) = received {
                        info!(
                            round = %round_id,
                            node = %elected.node,
                            "Primary elected, interrupting remaining attempts"
                        );
                        winner = Some(elected);
                        cancel.cancel();
                    }
                }
                joined = attempts.join_next() => match joined {
                    Some(Ok(report)) => reports.push(report),
                    Some(Err(e)) => error!(round = %round_id, "Election attempt task failed: {}", e),
                    None => break,
                },
            }
        }

        if awaiting_winner {
            if let Ok(elected) = winner_rx.try_recv() {
                winner = Some(elected);
            }
        }

        for report in &reports {
            debug!(
                round = %round_id,
                node = %report.node,
                local_port = ?report.local_port,
                state = %report.outcome.state(),
                outcome = ?report.outcome,
                "Attempt finished"
            );
        }

        ElectionRound { winner, reports }
    }
}

enum Waited {
    Ready(Result<TcpStream, TunnelError>),
    Exited(Option<i32>),
    Cancelled,
}

/// One candidate's pass through the state machine. Owns its tunnel until it
/// either hands it to the slot or stops it.
struct Attempt<L: TunnelLauncher> {
    node: CandidateNode,
    launcher: Arc<L>,
    prober: Arc<HealthProber>,
    allocator: PortAllocator,
    readiness: ReadinessWaiter,
    slot: Arc<WinnerSlot<ElectedTunnel<L::Tunnel>>>,
    cancel: CancellationToken,
}

impl<L: TunnelLauncher> Attempt<L> {
    async fn run(self) -> AttemptReport {
        let mut local_port = None;
        let outcome = self.drive(&mut local_port).await;

        match &outcome {
            AttemptOutcome::Failed(e) => warn!(
                node = %self.node,
                local_port = ?local_port,
                "Attempt failed: {}", e
            ),
            AttemptOutcome::Standby => info!(
                node = %self.node,
                local_port = ?local_port,
                "Node is a standby"
            ),
            _ => {}
        }

        AttemptReport {
            node: self.node,
            local_port,
            outcome,
        }
    }

    fn transition(&self, state: AttemptState, local_port: Option<u16>) {
        debug!(node = %self.node, local_port = ?local_port, state = %state, "Attempt state");
    }

    async fn drive(&self, local_port_out: &mut Option<u16>) -> AttemptOutcome {
        self.transition(AttemptState::Spawning, None);

        let local_port = match self.allocator.allocate().await {
            Ok(port) => port,
            Err(e) => return AttemptOutcome::Failed(e),
        };
        *local_port_out = Some(local_port);

        if self.cancel.is_cancelled() {
            return AttemptOutcome::Cancelled;
        }

        let mut tunnel = match self.launcher.launch(&self.node, local_port).await {
            Ok(tunnel) => tunnel,
            Err(e) => return AttemptOutcome::Failed(e),
        };

        self.transition(AttemptState::AwaitingSocket, Some(local_port));
        let waited = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Waited::Cancelled,
            code = tunnel.closed() => Waited::Exited(code),
            ready = self.readiness.await_ready(local_port) => Waited::Ready(ready),
        };

        let connection = match waited {
            Waited::Ready(Ok(connection)) => connection,
            Waited::Ready(Err(e)) => {
                tunnel.stop().await;
                return AttemptOutcome::Failed(e);
            }
            Waited::Exited(code) => {
                tunnel.stop().await;
                return AttemptOutcome::Failed(TunnelError::TunnelExited {
                    node: self.node.to_string(),
                    code,
                });
            }
            Waited::Cancelled => {
                tunnel.stop().await;
                return AttemptOutcome::Cancelled;
            }
        };

        self.transition(AttemptState::Probing, Some(local_port));
        let probed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            health = self.prober.probe(local_port) => Some(health),
        };

        let status = match probed {
            Some(Ok(health)) => health.status(),
            Some(Err(e)) => {
                drop(connection);
                tunnel.stop().await;
                return AttemptOutcome::Failed(e.into());
            }
            None => {
                drop(connection);
                tunnel.stop().await;
                return AttemptOutcome::Cancelled;
            }
        };

        match status {
            HealthStatus::Standby => {
                drop(connection);
                tunnel.stop().await;
                AttemptOutcome::Standby
            }
            HealthStatus::Primary => {
                let elected = ElectedTunnel {
                    node: self.node.clone(),
                    local_port,
                    tunnel,
                    connection,
                };
                match self.slot.offer(elected) {
                    Ok(()) => {
                        info!(node = %self.node, local_port, "Primary Vault instance detected");
                        AttemptOutcome::Won
                    }
                    Err(elected) => {
                        warn!(
                            node = %self.node,
                            "Node also reports primary but a winner is already elected, discarding"
                        );
                        elected.shutdown().await;
                        AttemptOutcome::Redundant
                    }
                }
            }
        }
    }
}
