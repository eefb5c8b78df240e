//! Pre-warmed TCP connections to the local carrier endpoint.
//!
//! A pool entry is used for exactly one CONNECT; no SOCKS5 handshake state
//! is ever cached.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket_factory::Protect;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POOL_SIZE: usize = 3;

const REFILL_INTERVAL: Duration = Duration::from_millis(500);
const ENTRY_EXPIRY: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

struct PooledConn {
    stream: TcpStream,
    created_at: Instant,
}

pub struct ConnectionPool {
    endpoint: SocketAddr,
    protect: Protect,
    capacity: usize,
    entries: Mutex<VecDeque<PooledConn>>,
}

impl ConnectionPool {
    pub fn new(endpoint: SocketAddr, protect: Protect, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            protect,
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        })
    }

    /// Takes a pre-connected socket, if a fresh one is available.
    ///
    /// Callers fall back to a direct connect on `None`.
    pub async fn take(&self) -> Option<TcpStream> {
        let mut entries = self.entries.lock().await;

        while let Some(conn) = entries.pop_front() {
            if conn.created_at.elapsed() < ENTRY_EXPIRY {
                return Some(conn.stream);
            }
        }

        None
    }

    /// Tops the pool up to capacity every 500 ms until cancelled.
    pub fn spawn_refill(self: &Arc<Self>, cancel: CancellationToken) {
        let pool = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFILL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                pool.refill_once().await;
            }

            pool.entries.lock().await.clear();
        });
    }

    async fn refill_once(&self) {
        loop {
            {
                let mut entries = self.entries.lock().await;

                entries.retain(|conn| conn.created_at.elapsed() < ENTRY_EXPIRY);

                if entries.len() >= self.capacity {
                    return;
                }
            }

            // Connect outside the lock.
            match socket_factory::connect_tcp(&self.protect, self.endpoint, CONNECT_TIMEOUT).await
            {
                Ok(stream) => {
                    self.entries.lock().await.push_back(PooledConn {
                        stream,
                        created_at: Instant::now(),
                    });
                }
                Err(e) => {
                    tracing::debug!(endpoint = %self.endpoint, "Pool refill failed: {e}");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refill_reaches_capacity_and_take_drains() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                // Park accepted sockets so they stay open.
                tokio::spawn(async move {
                    let _stream = stream;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
            }
        });

        let pool = ConnectionPool::new(endpoint, Protect::none(), 3);
        pool.refill_once().await;

        assert!(pool.take().await.is_some());
        assert!(pool.take().await.is_some());
        assert!(pool.take().await.is_some());
        assert!(pool.take().await.is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_skipped() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let _accepted = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let pool = ConnectionPool::new(endpoint, Protect::none(), 1);
        pool.refill_once().await;

        pool.entries.lock().await[0].created_at = Instant::now() - Duration::from_secs(121);

        assert!(pool.take().await.is_none());
    }
}
