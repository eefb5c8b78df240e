//! The SSH bridge: CONNECT opens a `direct-tcpip` channel, DNS workers are
//! long-lived channels to the resolver.
//!
//! The SSH session itself lives behind [`SshTransport`]; the bridge only
//! consumes the channel-opening contract.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use dns_pool::{DnsPoolConfig, DnsWorkerPool};
use socks5_proto::Dest;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::dns::{DialerDnsConnector, PooledDns};
use super::{BoxedStream, BridgeConfig, BridgeHandle, DialError, StreamDialer};

/// Upper bound on concurrently open channels per session.
const MAX_CHANNELS: usize = 32;

/// Transient "channel not opened" failures are retried twice.
const CHANNEL_OPEN_ATTEMPTS: u32 = 3;
const CHANNEL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The contract of an established SSH session.
#[async_trait::async_trait]
pub trait SshTransport: Send + Sync + 'static {
    /// Opens a `direct-tcpip` channel to `(host, port)`.
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<BoxedStream>;
}

pub struct SshCarrier {
    pub transport: Arc<dyn SshTransport>,
    pub dns: DnsPoolConfig,
}

pub async fn ssh_bridge(config: BridgeConfig, carrier: SshCarrier) -> Result<BridgeHandle> {
    let cancel = CancellationToken::new();

    let dialer: Arc<dyn StreamDialer> = Arc::new(SshDialer {
        transport: carrier.transport,
        permits: Arc::new(Semaphore::new(MAX_CHANNELS)),
    });

    // Leak prevention: DNS goes through channels or not at all.
    let workers = DnsWorkerPool::new(
        carrier.dns,
        Arc::new(DialerDnsConnector {
            dialer: Arc::clone(&dialer),
        }),
        None,
    );

    BridgeHandle::start(config, dialer, PooledDns::start(workers), cancel).await
}

struct SshDialer {
    transport: Arc<dyn SshTransport>,
    permits: Arc<Semaphore>,
}

#[async_trait::async_trait]
impl StreamDialer for SshDialer {
    async fn open_stream(&self, dest: &Dest) -> Result<BoxedStream, DialError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DialError::Carrier("SSH session is shutting down".to_owned()))?;

        let host = dest.host();
        let mut last = None;

        for attempt in 1..=CHANNEL_OPEN_ATTEMPTS {
            match self.transport.open_direct_tcpip(&host, dest.port).await {
                Ok(stream) => {
                    return Ok(Box::new(ChannelStream {
                        inner: stream,
                        _permit: permit,
                    }));
                }
                Err(e) => {
                    tracing::debug!(%dest, attempt, "direct-tcpip open failed: {e:#}");
                    last = Some(e);
                }
            }

            if attempt < CHANNEL_OPEN_ATTEMPTS {
                tokio::time::sleep(CHANNEL_RETRY_DELAY).await;
            }
        }

        Err(DialError::Carrier(
            last.map(|e| format!("{e:#}"))
                .unwrap_or_else(|| "channel open failed".to_owned()),
        ))
    }
}

/// A channel stream holding its semaphore permit for its whole lifetime.
struct ChannelStream {
    inner: BoxedStream,
    _permit: OwnedSemaphorePermit,
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
