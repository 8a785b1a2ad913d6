use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const BIND_ATTEMPTS: u32 = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  - Check if another process is using this port: lsof -i :{port}\n  - Try using a different listen address")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to connect to upstream {address}: {source}")]
    Upstream {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Where local clients connect.
    pub bind_addr: SocketAddr,
    /// The elected tunnel's loopback address.
    pub upstream_addr: SocketAddr,
}

/// Session ids for logging.
#[derive(Clone)]
pub struct SessionIdGenerator {
    next_session_id: Arc<AtomicU64>,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_session_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RelayServer {
    config: RelayConfig,
    listener: TcpListener,
    session_ids: SessionIdGenerator,
}

impl RelayServer {
    /// Bind the listening socket.
    ///
    /// `AddrInUse` is retried a few times since a previous run may have left
    /// the port in TIME_WAIT.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let listener = Self::bind_with_retry(config.bind_addr).await?;
        Ok(Self {
            config,
            listener,
            session_ids: SessionIdGenerator::new(),
        })
    }

    async fn bind_with_retry(bind_addr: SocketAddr) -> Result<TcpListener, RelayError> {
        let bind_error = |reason: String| RelayError::BindError {
            address: bind_addr.ip().to_string(),
            port: bind_addr.port(),
            reason,
        };

        for attempt in 1..=BIND_ATTEMPTS {
            match TcpListener::bind(bind_addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!(
                            "Successfully bound to {} on attempt {}/{}",
                            bind_addr, attempt, BIND_ATTEMPTS
                        );
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                    warn!(
                        "Port {} is in use (attempt {}/{}), retrying in {}s...",
                        bind_addr.port(),
                        attempt,
                        BIND_ATTEMPTS,
                        BIND_RETRY_DELAY.as_secs()
                    );
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
                Err(e) => return Err(bind_error(e.to_string())),
            }
        }

        Err(bind_error(format!(
            "Address in use after {} attempts",
            BIND_ATTEMPTS
        )))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until `shutdown` is cancelled.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let addr = self.listener.local_addr()?;
        info!(
            addr = %addr,
            upstream = %self.config.upstream_addr,
            "Relay listener started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(addr = %addr, "Relay listener stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let session = self.session_ids.generate();
                        let upstream_addr = self.config.upstream_addr;
                        debug!(session, peer = %peer_addr, "Accepted client connection");

                        tokio::spawn(async move {
                            if let Err(e) =
                                Self::handle_session(stream, peer_addr, upstream_addr, session).await
                            {
                                warn!(session, peer = %peer_addr, "Relay session failed: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept client connection: {}", e);
                    }
                },
            }
        }
    }

    /// Relay one client over its own upstream connection.
    ///
    /// A client EOF is passed on as a half-close and replies keep flowing.
    /// Once the upstream leg ends, or either leg errors, the session is over
    /// and both sockets close.
    async fn handle_session(
        client: TcpStream,
        peer_addr: SocketAddr,
        upstream_addr: SocketAddr,
        session: u64,
    ) -> Result<(), RelayError> {
        let upstream = TcpStream::connect(upstream_addr)
            .await
            .map_err(|source| RelayError::Upstream {
                address: upstream_addr,
                source,
            })?;
        if let Err(e) = client.set_nodelay(true) {
            debug!(session, "Could not set TCP_NODELAY on client socket: {}", e);
        }
        if let Err(e) = upstream.set_nodelay(true) {
            debug!(session, "Could not set TCP_NODELAY on upstream socket: {}", e);
        }

        let (mut client_read, mut client_write) = client.into_split();
        let (mut upstream_read, mut upstream_write) = upstream.into_split();

        let client_to_upstream = async {
            let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
            let _ = upstream_write.shutdown().await;
            copied
        };
        let upstream_to_client = async {
            let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
            let _ = client_write.shutdown().await;
            copied
        };
        tokio::pin!(client_to_upstream, upstream_to_client);

        let mut bytes_to_upstream = None;
        let bytes_to_client = tokio::select! {
            copied = &mut upstream_to_client => copied,
            copied = &mut client_to_upstream => match copied {
                Ok(n) => {
                    debug!(session, "Client finished sending, waiting for upstream");
                    bytes_to_upstream = Some(n);
                    (&mut upstream_to_client).await
                }
                Err(e) => Err(e),
            },
        }?;

        info!(
            session,
            peer = %peer_addr,
            bytes_to_upstream = ?bytes_to_upstream,
            bytes_to_client,
            "Relay session closed"
        );
        Ok(())
    }
}
