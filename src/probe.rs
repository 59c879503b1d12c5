use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;

/// Cheap reachability check consulted before network delivery and replay.
///
/// Implementations must never fail: anything unexpected means "not reachable".
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Probe that opens (and immediately drops) a TCP connection to a well-known
/// address, bounded by a short timeout.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: SocketAddr,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(address: SocketAddr, timeout: Duration) -> Self {
        Self { address, timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(SocketAddr::from(([8, 8, 8, 8], 53)), Duration::from_millis(500))
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn is_reachable(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(self.address)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(err)) => {
                tracing::debug!(address = %self.address, error = %err, "connectivity probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(address = %self.address, "connectivity probe timed out");
                false
            }
        }
    }
}

/// Probe with a fixed, switchable answer.
#[derive(Debug)]
pub struct StaticProbe {
    reachable: AtomicBool,
}

impl StaticProbe {
    pub fn new(reachable: bool) -> Self {
        Self { reachable: AtomicBool::new(reachable) }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}
