//! The Tor bridge: CONNECT chains to the local Tor SOCKS5 (no auth); DNS is
//! a one-shot DNS-over-TCP exchange via Tor, cached for 60 s, with at most
//! eight lookups in flight.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use socks5_proto::Dest;
use tokio_util::sync::CancellationToken;

use crate::dns_cache::DnsCache;
use crate::pool::{ConnectionPool, DEFAULT_POOL_SIZE};

use super::{BridgeConfig, BridgeHandle, DnsResolver, SocksChainDialer, StreamDialer};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded DNS dispatch: at most this many Tor circuits resolving at once.
const MAX_DNS_IN_FLIGHT: usize = 8;

pub struct TorCarrier {
    /// The local Tor SOCKS5 endpoint (the pluggable transport sits behind
    /// it).
    pub endpoint: SocketAddr,
    /// The resolver reached through Tor, `8.8.8.8` unless overridden.
    pub resolver: Ipv4Addr,
}

pub async fn tor_bridge(config: BridgeConfig, carrier: TorCarrier) -> Result<BridgeHandle> {
    let cancel = CancellationToken::new();

    let pool = ConnectionPool::new(carrier.endpoint, config.protect.clone(), DEFAULT_POOL_SIZE);
    pool.spawn_refill(cancel.clone());

    let dialer: Arc<dyn StreamDialer> = Arc::new(SocksChainDialer {
        endpoint: carrier.endpoint,
        auth: None,
        pool: Some(pool),
        protect: config.protect.clone(),
        handshake_timeout: HANDSHAKE_TIMEOUT,
        attempts: 1,
        retry_delay: Duration::ZERO,
    });

    let dns = Arc::new(TorDns {
        dialer: Arc::clone(&dialer),
        resolver: carrier.resolver,
        cache: DnsCache::new(),
        permits: tokio::sync::Semaphore::new(MAX_DNS_IN_FLIGHT),
    });

    BridgeHandle::start(config, dialer, dns, cancel).await
}

struct TorDns {
    dialer: Arc<dyn StreamDialer>,
    resolver: Ipv4Addr,
    cache: DnsCache,
    permits: tokio::sync::Semaphore,
}

#[async_trait::async_trait]
impl DnsResolver for TorDns {
    async fn query(&self, message: &[u8]) -> Result<Vec<u8>> {
        if let Some(response) = self.cache.lookup(message) {
            return Ok(response);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .context("Tor DNS dispatch is shutting down")?;

        let mut stream = self
            .dialer
            .open_stream(&Dest::ipv4(self.resolver, 53))
            .await
            .map_err(anyhow::Error::new)
            .context("Failed to reach the resolver via Tor")?;

        dns_pool::codec::send_message(&mut stream, message)
            .await
            .context("Failed to send DNS query via Tor")?;
        let response = dns_pool::codec::recv_message(&mut stream)
            .await
            .context("Failed to read DNS response via Tor")?;

        self.cache.store(message, &response);

        Ok(response)
    }
}
