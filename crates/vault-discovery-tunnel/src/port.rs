use crate::TunnelError;
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::Range;
use tokio::net::TcpStream;
use tracing::debug;

pub const DEFAULT_PORT_RANGE: Range<u16> = 1024..65534;
pub const MAX_PORT_ATTEMPTS: u32 = 10;

/// Picks free loopback ports for tunnel processes to bind.
///
/// Candidates are drawn at random rather than scanned so that concurrent
/// attempts rarely collide on the same port.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: Range<u16>,
    max_attempts: u32,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            range: DEFAULT_PORT_RANGE,
            max_attempts: MAX_PORT_ATTEMPTS,
        }
    }

    pub fn with_range(mut self, range: Range<u16>) -> Self {
        self.range = range;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Returns a port nothing on loopback answered on.
    ///
    /// A refused connect means the port is free. An accepted connect means it
    /// is taken; that probe connection is closed immediately.
    pub async fn allocate(&self) -> Result<u16, TunnelError> {
        if self.range.is_empty() {
            return Err(TunnelError::NoPortAvailable { attempts: 0 });
        }

        for attempt in 1..=self.max_attempts {
            let port = rand::thread_rng().gen_range(self.range.clone());
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

            match TcpStream::connect(addr).await {
                Err(_) => {
                    debug!(local_port = port, attempt, "Allocated local port");
                    return Ok(port);
                }
                Ok(stream) => {
                    debug!(
                        local_port = port,
                        attempt,
                        max_attempts = self.max_attempts,
                        "Local port in use, retrying"
                    );
                    drop(stream);
                }
            }
        }

        Err(TunnelError::NoPortAvailable {
            attempts: self.max_attempts,
        })
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_allocator_defaults() {
        let allocator = PortAllocator::new();
        assert_eq!(allocator.range, 1024..65534);
        assert_eq!(allocator.max_attempts, 10);
    }

    #[tokio::test]
    async fn test_allocated_port_is_not_listening() {
        let port = PortAllocator::new().allocate().await.unwrap();
        assert!(DEFAULT_PORT_RANGE.contains(&port));
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_fully_occupied_range_exhausts_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = listener.local_addr().unwrap().port();

        let allocator = PortAllocator::new()
            .with_range(taken..taken + 1)
            .with_max_attempts(3);

        match allocator.allocate().await {
            Err(TunnelError::NoPortAvailable { attempts }) => assert_eq!(attempts, 3),
            other => panic!("expected NoPortAvailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_range() {
        let allocator = PortAllocator::new().with_range(2000..2000);
        assert!(matches!(
            allocator.allocate().await,
            Err(TunnelError::NoPortAvailable { attempts: 0 })
        ));
    }
}
