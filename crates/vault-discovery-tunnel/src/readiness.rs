use crate::TunnelError;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};

pub const READINESS_INTERVAL: Duration = Duration::from_secs(1);
pub const READINESS_DEADLINE: Duration = Duration::from_secs(10);

/// Polls a loopback port until the tunnel process has bound it.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessWaiter {
    interval: Duration,
    deadline: Duration,
}

impl ReadinessWaiter {
    pub fn new() -> Self {
        Self {
            interval: READINESS_INTERVAL,
            deadline: READINESS_DEADLINE,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Dial `127.0.0.1:local_port` every interval until it answers or the
    /// deadline (measured from the first dial) passes.
    ///
    /// The returned connection is left open for the caller.
    pub async fn await_ready(&self, local_port: u16) -> Result<TcpStream, TunnelError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match timeout(self.interval, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!(
                        local_port,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Tunnel socket is ready"
                    );
                    return Ok(stream);
                }
                Ok(Err(e)) => trace!(local_port, attempt, "Tunnel socket not ready: {}", e),
                Err(_) => trace!(local_port, attempt, "Tunnel socket dial timed out"),
            }

            if started.elapsed() + self.interval > self.deadline {
                return Err(TunnelError::ReadinessTimeout {
                    local_port,
                    waited: started.elapsed(),
                });
            }
            sleep(self.interval).await;
        }
    }
}

impl Default for ReadinessWaiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_defaults() {
        let waiter = ReadinessWaiter::new();
        assert_eq!(waiter.interval, Duration::from_secs(1));
        assert_eq!(waiter.deadline, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_ready_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let started = std::time::Instant::now();
        let stream = ReadinessWaiter::new().await_ready(port).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_times_out_when_nothing_binds() {
        let port = unused_port().await;
        let waiter = ReadinessWaiter::new()
            .with_interval(Duration::from_millis(50))
            .with_deadline(Duration::from_millis(300));

        let started = std::time::Instant::now();
        match waiter.await_ready(port).await {
            Err(TunnelError::ReadinessTimeout { local_port, .. }) => assert_eq!(local_port, port),
            other => panic!("expected ReadinessTimeout, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_ready_once_listener_binds() {
        let port = unused_port().await;
        let bind_after = Duration::from_millis(200);
        let interval = Duration::from_millis(50);

        let server = tokio::spawn(async move {
            sleep(bind_after).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let _ = listener.accept().await;
        });

        let started = std::time::Instant::now();
        let waiter = ReadinessWaiter::new()
            .with_interval(interval)
            .with_deadline(Duration::from_secs(5));
        waiter.await_ready(port).await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= bind_after);
        assert!(elapsed < bind_after + Duration::from_millis(500));
        server.await.unwrap();
    }
}
