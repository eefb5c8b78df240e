//! The SOCKS5-carrier bridge (Slipstream style).
//!
//! Like the direct-carrier bridge, but the remote SOCKS5 always requires
//! user/pass, and the DNS workers target a public resolver IP because the
//! remote end may refuse CONNECT to its own localhost.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dns_pool::{DnsPoolConfig, DnsWorkerPool};
use socks5_proto::client::Auth;
use tokio_util::sync::CancellationToken;

use crate::pool::{ConnectionPool, DEFAULT_POOL_SIZE};

use super::dns::{DialerDnsConnector, PooledDns};
use super::{BridgeConfig, BridgeHandle, SocksChainDialer, StreamDialer};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);
const CONNECT_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct SocksCarrier {
    pub endpoint: SocketAddr,
    pub auth: Auth,
    pub dns: DnsPoolConfig,
}

pub async fn socks_carrier_bridge(
    config: BridgeConfig,
    carrier: SocksCarrier,
) -> Result<BridgeHandle> {
    let cancel = CancellationToken::new();

    let pool = ConnectionPool::new(carrier.endpoint, config.protect.clone(), DEFAULT_POOL_SIZE);
    pool.spawn_refill(cancel.clone());

    let dialer: Arc<dyn StreamDialer> = Arc::new(SocksChainDialer {
        endpoint: carrier.endpoint,
        auth: Some(carrier.auth),
        pool: Some(pool),
        protect: config.protect.clone(),
        handshake_timeout: HANDSHAKE_TIMEOUT,
        attempts: CONNECT_ATTEMPTS,
        retry_delay: RETRY_DELAY,
    });

    // Leak prevention: no DoH fallback for covert-carrier DNS.
    let workers = DnsWorkerPool::new(
        carrier.dns,
        Arc::new(DialerDnsConnector {
            dialer: Arc::clone(&dialer),
        }),
        None,
    );

    BridgeHandle::start(config, dialer, PooledDns::start(workers), cancel).await
}
