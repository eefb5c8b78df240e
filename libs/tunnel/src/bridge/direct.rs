//! The direct-carrier bridge (DNSTT style).
//!
//! The carrier exposes a raw TCP tunnel on a local port; the remote end of
//! that tunnel already terminates at a SOCKS5 server, so CONNECT simply
//! chains a second carrier session through it. DNS tunnels are slow, hence
//! the lengthened handshake budget and the extra CONNECT attempts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dns_pool::{DnsPoolConfig, DnsWorkerPool, DohFallback};
use socks5_proto::client::Auth;
use tokio_util::sync::CancellationToken;

use crate::pool::{ConnectionPool, DEFAULT_POOL_SIZE};

use super::dns::{DialerDnsConnector, PooledDns};
use super::{BridgeConfig, BridgeHandle, SocksChainDialer, StreamDialer};

const DNS_TUNNEL_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);
const DNS_TUNNEL_CONNECT_ATTEMPTS: u32 = 3;
const DNS_TUNNEL_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct DirectCarrier {
    /// Local endpoint of the raw TCP tunnel.
    pub endpoint: SocketAddr,
    /// Optional user/pass sub-negotiation with the remote SOCKS5.
    pub auth: Option<Auth>,
    pub dns: DnsPoolConfig,
    /// Phase-4 DoH fallback; `None` under leak prevention.
    pub doh_fallback: Option<Arc<doh_client::DohClient>>,
}

pub async fn direct_bridge(config: BridgeConfig, carrier: DirectCarrier) -> Result<BridgeHandle> {
    let cancel = CancellationToken::new();

    let pool = ConnectionPool::new(carrier.endpoint, config.protect.clone(), DEFAULT_POOL_SIZE);
    pool.spawn_refill(cancel.clone());

    let dialer: Arc<dyn StreamDialer> = Arc::new(SocksChainDialer {
        endpoint: carrier.endpoint,
        auth: carrier.auth,
        pool: Some(pool),
        protect: config.protect.clone(),
        handshake_timeout: DNS_TUNNEL_HANDSHAKE_TIMEOUT,
        attempts: DNS_TUNNEL_CONNECT_ATTEMPTS,
        retry_delay: DNS_TUNNEL_RETRY_DELAY,
    });

    let doh_fallback = carrier.doh_fallback.map(|doh| {
        Arc::new(super::dns::CarrierDoh {
            doh,
            dialer: Arc::clone(&dialer),
        }) as Arc<dyn DohFallback>
    });

    let workers = DnsWorkerPool::new(
        carrier.dns,
        Arc::new(DialerDnsConnector {
            dialer: Arc::clone(&dialer),
        }),
        doh_fallback,
    );

    BridgeHandle::start(config, dialer, PooledDns::start(workers), cancel).await
}
