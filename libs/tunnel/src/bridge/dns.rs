//! Adapters between the bridges and the DNS machinery.

use std::sync::Arc;

use anyhow::Result;
use dns_pool::{BoxedDnsStream, DnsStreamConnector, DnsWorkerPool, DohFallback};
use parking_lot::Mutex;
use socks5_proto::Dest;

use super::{DnsResolver, StreamDialer};

/// Lets the worker pool open its long-lived streams through the bridge's
/// own dialer, i.e. through the covert carrier.
pub(super) struct DialerDnsConnector {
    pub dialer: Arc<dyn StreamDialer>,
}

#[async_trait::async_trait]
impl DnsStreamConnector for DialerDnsConnector {
    async fn connect(&self, dns_host: std::net::Ipv4Addr) -> Result<BoxedDnsStream> {
        let stream = self
            .dialer
            .open_stream(&Dest::ipv4(dns_host, 53))
            .await
            .map_err(anyhow::Error::new)?;

        Ok(Box::new(stream))
    }
}

/// The worker pool plus its background keepalive, wired as a bridge's DNS
/// resolver.
pub(super) struct PooledDns {
    pool: Arc<DnsWorkerPool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl PooledDns {
    /// Spawns prewarm and keepalive in the background; early queries simply
    /// fall through to the inline-recreate phase.
    pub(super) fn start(pool: Arc<DnsWorkerPool>) -> Arc<Self> {
        let prewarm = {
            let pool = Arc::clone(&pool);

            tokio::spawn(async move { pool.prewarm().await })
        };
        let keepalive = pool.spawn_keepalive();

        Arc::new(Self {
            pool,
            tasks: Mutex::new(vec![prewarm, keepalive]),
        })
    }
}

#[async_trait::async_trait]
impl DnsResolver for PooledDns {
    async fn query(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.pool.query(message).await
    }

    async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        self.pool.shutdown().await;
    }
}

/// Phase-4 fallback: DoH ridden over the covert carrier, so nothing leaves
/// an unprotected socket even when every DNS worker is gone.
pub(super) struct CarrierDoh {
    pub doh: Arc<doh_client::DohClient>,
    pub dialer: Arc<dyn StreamDialer>,
}

#[async_trait::async_trait]
impl DohFallback for CarrierDoh {
    async fn query(&self, message: &[u8]) -> Result<Vec<u8>> {
        let stream = self
            .dialer
            .open_stream(&Dest::domain(self.doh.host(), 443))
            .await
            .map_err(anyhow::Error::new)?;

        self.doh.query_over(stream, message).await
    }
}
