//! The DoH bridge: the carrier only covers DNS, so CONNECT uses plain
//! direct sockets while every query goes to the HTTP/2 DoH client.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use doh_client::DohClient;
use tokio_util::sync::CancellationToken;

use super::{BridgeConfig, BridgeHandle, DirectDialer, DnsResolver};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn doh_bridge(config: BridgeConfig, doh: Arc<DohClient>) -> Result<BridgeHandle> {
    let dialer = Arc::new(DirectDialer {
        protect: config.protect.clone(),
        connect_timeout: CONNECT_TIMEOUT,
    });

    BridgeHandle::start(
        config,
        dialer,
        Arc::new(DohDns { doh }),
        CancellationToken::new(),
    )
    .await
}

struct DohDns {
    doh: Arc<DohClient>,
}

#[async_trait::async_trait]
impl DnsResolver for DohDns {
    async fn query(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.doh.query(message).await
    }
}
