//! The egress bridges: one uniform SOCKS5 front per covert transport.
//!
//! Every bridge speaks the same wire protocol to its downstream (CONNECT
//! plus FWD_UDP); they differ only in how a stream reaches the far side and
//! in how DNS queries are answered.

mod dialer;
mod direct;
mod dns;
mod doh;
mod socks_carrier;
mod ssh;
mod tor;

pub use dialer::{DialError, DirectDialer, SocksChainDialer};
pub use direct::{DirectCarrier, direct_bridge};
pub use doh::doh_bridge;
pub use socks_carrier::{SocksCarrier, socks_carrier_bridge};
pub use ssh::{SshCarrier, SshTransport, ssh_bridge};
pub use tor::{TorCarrier, tor_bridge};

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context as _, Result};
use domain_router::Router;
use socket_factory::Protect;
use socks5_proto::server::{self, HandshakeError};
use socks5_proto::{Cmd, Dest, ReplyCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A byte stream through a covert carrier.
pub trait CarrierIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<S> CarrierIo for S where S: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn CarrierIo>;

/// How a bridge opens remote streams.
#[async_trait::async_trait]
pub trait StreamDialer: Send + Sync + 'static {
    async fn open_stream(&self, dest: &Dest) -> Result<BoxedStream, DialError>;
}

/// How a bridge answers DNS queries arriving via FWD_UDP.
#[async_trait::async_trait]
pub trait DnsResolver: Send + Sync + 'static {
    async fn query(&self, message: &[u8]) -> Result<Vec<u8>>;

    /// Tears down pooled resources on bridge stop.
    async fn shutdown(&self) {}
}

/// Timeout for the direct socket of a bypassed flow.
const BYPASS_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `stop` waits for handlers to drain before abandoning them.
const STOP_DRAIN_BUDGET: Duration = Duration::from_secs(5);

pub struct BridgeConfig {
    pub listen: SocketAddr,
    pub router: Arc<Router>,
    pub protect: Protect,
}

/// One running SOCKS5 front over a carrier. Owns the acceptor, every
/// handler task and the DNS machinery; dropped resources are reclaimed by
/// [`BridgeHandle::stop`].
pub struct BridgeHandle {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    dns: Arc<dyn DnsResolver>,
}

impl BridgeHandle {
    /// Binds the listener (with the rebind retry policy) and spawns the
    /// acceptor.
    ///
    /// `cancel` is shared with any background machinery the variant wired
    /// up beforehand (connection-pool refill, DNS keepalive); `stop` fires
    /// it for all of them.
    pub async fn start(
        config: BridgeConfig,
        dialer: Arc<dyn StreamDialer>,
        dns: Arc<dyn DnsResolver>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = socket_factory::bind_listener(config.listen)
            .await
            .with_context(|| format!("Failed to bind bridge on {}", config.listen))?;
        let local_addr = listener
            .local_addr()
            .context("Listener has no local addr")?;

        let running = Arc::new(AtomicBool::new(true));
        let tracker = TaskTracker::new();

        let acceptor = Acceptor {
            dialer,
            dns: Arc::clone(&dns),
            router: config.router,
            protect: config.protect,
            running: Arc::clone(&running),
            cancel: cancel.clone(),
            tracker: tracker.clone(),
        };

        tracker.spawn(acceptor.run(listener));

        tracing::info!(%local_addr, "Bridge listening");

        Ok(Self {
            local_addr,
            running,
            cancel,
            tracker,
            dns,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, interrupts every handler (closing the carrier
    /// streams they own), and drains the DNS workers.
    pub async fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        self.cancel.cancel();

        self.tracker.close();

        if tokio::time::timeout(STOP_DRAIN_BUDGET, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("Bridge handlers did not drain in time");
        }

        self.dns.shutdown().await;
    }
}

struct Acceptor {
    dialer: Arc<dyn StreamDialer>,
    dns: Arc<dyn DnsResolver>,
    router: Arc<Router>,
    protect: Protect,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        while self.running.load(Ordering::Relaxed) {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.cancel.cancelled() => break,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    if self.running.load(Ordering::Relaxed) {
                        tracing::warn!("Accept failed: {e}");
                    }
                    continue;
                }
            };

            let handler = Handler {
                dialer: Arc::clone(&self.dialer),
                dns: Arc::clone(&self.dns),
                router: Arc::clone(&self.router),
                protect: self.protect.clone(),
                running: Arc::clone(&self.running),
                cancel: self.cancel.clone(),
            };

            self.tracker.spawn(async move {
                if let Err(e) = handler.run(stream).await {
                    tracing::debug!(%peer, "Handler finished with error: {e:#}");
                }
            });
        }
    }
}

struct Handler {
    dialer: Arc<dyn StreamDialer>,
    dns: Arc<dyn DnsResolver>,
    router: Arc<Router>,
    protect: Protect,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Handler {
    async fn run(self, mut stream: TcpStream) -> Result<()> {
        let request = match server::handshake(&mut stream).await {
            Ok(request) => request,
            Err(HandshakeError::UnsupportedCommand(cmd)) => {
                server::send_reply(&mut stream, ReplyCode::CommandNotSupported).await?;

                anyhow::bail!("unsupported command {cmd:#04x}");
            }
            Err(e) => {
                // Malformed framing from the shim: drop the connection, do
                // not crash the bridge.
                tracing::warn!("SOCKS5 handshake failed: {e}");

                return Ok(());
            }
        };

        match request.cmd {
            Cmd::Connect => self.handle_connect(stream, request.dest).await,
            Cmd::FwdUdp => self.handle_fwd_udp(stream, request.dest).await,
        }
    }

    async fn handle_connect(self, mut stream: TcpStream, dest: Dest) -> Result<()> {
        // The client only sends its first bytes after our reply, so a
        // routing decision that needs them implies answering success
        // optimistically. Without a router we dial first and report an
        // accurate reply code.
        let sniffed = if self.router.is_enabled() {
            server::send_reply(&mut stream, ReplyCode::Succeeded).await?;

            sniffer::peek(&mut stream).await
        } else {
            sniffer::Sniffed::default()
        };

        let host = sniffed.domain.clone().unwrap_or_else(|| dest.host());
        let bypass = self.router.should_bypass(&host);

        tracing::debug!(%dest, %host, bypass, "CONNECT");

        let dialed = if bypass {
            self.open_bypass(&dest).await
        } else {
            self.dialer.open_stream(&dest).await
        };

        let mut upstream = match dialed {
            Ok(upstream) => upstream,
            Err(e) => {
                if !self.router.is_enabled() {
                    server::send_reply(&mut stream, e.reply_code()).await?;
                }
                // Success already went out otherwise; dropping the
                // connection resets the flow instead.
                anyhow::bail!("failed to reach {dest}: {e}");
            }
        };

        if !self.router.is_enabled() {
            server::send_reply(&mut stream, ReplyCode::Succeeded).await?;
        }

        if !sniffed.buffered.is_empty() {
            upstream
                .write_all(&sniffed.buffered)
                .await
                .context("Failed to replay sniffed bytes")?;
        }

        tokio::select! {
            result = tokio::io::copy_bidirectional(&mut stream, &mut upstream) => {
                result.context("Relay failed")?;
            }
            _ = self.cancel.cancelled() => {}
        }

        Ok(())
    }

    async fn open_bypass(&self, dest: &Dest) -> Result<BoxedStream, DialError> {
        let addr = match dest.socket_addr() {
            Some(addr) => addr,
            None => {
                // A sniffed bypass decision on a domain CONNECT; resolve it
                // outside the tunnel.
                tokio::net::lookup_host((dest.host(), dest.port))
                    .await?
                    .next()
                    .ok_or_else(|| DialError::Unreachable(dest.to_string()))?
            }
        };

        let stream = socket_factory::connect_tcp(&self.protect, addr, BYPASS_CONNECT_TIMEOUT).await?;

        Ok(Box::new(stream))
    }

    async fn handle_fwd_udp(self, mut stream: TcpStream, _dest: Dest) -> Result<()> {
        server::send_reply(&mut stream, ReplyCode::Succeeded).await?;

        while self.running.load(Ordering::Relaxed) {
            let frame = tokio::select! {
                frame = socks5_proto::fwd_udp::read_frame(&mut stream) => frame,
                _ = self.cancel.cancelled() => break,
            };

            let Some(frame) = frame.context("FWD_UDP framing error")? else {
                break; // Clean EOF.
            };

            if frame.dest.port != 53 {
                // All UDP except DNS is dropped by design.
                tracing::debug!(dest = %frame.dest, "Dropping non-DNS FWD_UDP frame");
                continue;
            }

            let response = match self.dns.query(&frame.payload).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!("DNS query failed: {e:#}");
                    continue; // The client's resolver will retry.
                }
            };

            socks5_proto::fwd_udp::write_frame(&mut stream, &frame.dest, &response)
                .await
                .context("Failed to write FWD_UDP reply")?;
        }

        Ok(())
    }
}
