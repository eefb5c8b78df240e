//! The UDP splitter: DNS to the bridge (or a direct resolver socket), QUIC
//! blocked, everything else over a per-flow direct datagram socket.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use ip_packet::{FlowKey, IpPacket, make};
use parking_lot::Mutex;
use socket_factory::Protect;
use socks5_proto::{Cmd, Dest};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tun::TunWriter;
use veilnet_model::TrafficStats;

use crate::nat::{EntryKind, NatTable};

/// Datagrams queued per flow before backpressure drops apply.
const FLOW_QUEUE_CAPACITY: usize = 64;

/// Idle budget after which a UDP flow task retires itself.
const FLOW_IDLE_EXPIRY: Duration = Duration::from_secs(60);

const BRIDGE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How DNS queries leave the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsMode {
    /// FWD_UDP session on the bridge; the bridge picks workers/DoH/Tor.
    Bridge,
    /// A direct datagram socket, protected from the tunnel.
    Direct,
}

pub(crate) struct UdpSplitter {
    writer: TunWriter,
    protect: Protect,
    nat: Arc<NatTable>,
    stats: Arc<TrafficStats>,
    bridge_addr: SocketAddr,
    dns_mode: DnsMode,
    flows: Mutex<HashMap<FlowKey, mpsc::Sender<Vec<u8>>>>,
    cancel: CancellationToken,
}

impl UdpSplitter {
    pub(crate) fn new(
        writer: TunWriter,
        protect: Protect,
        nat: Arc<NatTable>,
        stats: Arc<TrafficStats>,
        bridge_addr: SocketAddr,
        dns_mode: DnsMode,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            writer,
            protect,
            nat,
            stats,
            bridge_addr,
            dns_mode,
            flows: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// Classifies one outbound datagram by destination port.
    pub(crate) fn handle(self: &Arc<Self>, packet: &IpPacket) {
        let Some(udp) = packet.as_udp() else {
            return;
        };
        let Some(key) = packet.flow_key() else {
            return;
        };

        match key.dst.port() {
            // QUIC: no egress at all, applications fall back to TCP.
            443 => {
                tracing::trace!(%key, "Dropping UDP:443");
            }
            53 if self.dns_mode == DnsMode::Bridge => {
                self.dispatch(key, udp.payload().to_vec(), UdpPath::BridgeDns);
            }
            _ => {
                self.dispatch(key, udp.payload().to_vec(), UdpPath::Direct);
            }
        }
    }

    /// Drops the flow task for an entry the NAT cleanup expired.
    pub(crate) fn evict(&self, key: &FlowKey) {
        self.flows.lock().remove(key);
    }

    fn dispatch(self: &Arc<Self>, key: FlowKey, payload: Vec<u8>, path: UdpPath) {
        self.nat.get_or_create(key, EntryKind::Udp);
        self.nat.touch(&key);

        let sender = {
            let mut flows = self.flows.lock();

            match flows.get(&key) {
                Some(sender) => sender.clone(),
                None => {
                    let (tx, rx) = mpsc::channel(FLOW_QUEUE_CAPACITY);
                    flows.insert(key, tx.clone());

                    let splitter = Arc::clone(self);
                    tokio::spawn(async move {
                        let result = match path {
                            UdpPath::BridgeDns => splitter.run_bridge_dns_flow(key, rx).await,
                            UdpPath::Direct => splitter.run_direct_flow(key, rx).await,
                        };

                        if let Err(e) = result {
                            tracing::debug!(%key, "UDP flow ended with error: {e:#}");
                        }

                        splitter.flows.lock().remove(&key);
                        splitter.nat.remove(&key);
                    });

                    tx
                }
            }
        };

        // A full queue applies drop-based backpressure; UDP has no delivery
        // promise to keep.
        if sender.try_send(payload).is_err() {
            tracing::trace!(%key, "UDP flow queue full, dropping datagram");
        }
    }

    /// One FWD_UDP session on the bridge per DNS flow.
    async fn run_bridge_dns_flow(
        self: &Arc<Self>,
        key: FlowKey,
        mut queries: mpsc::Receiver<Vec<u8>>,
    ) -> Result<()> {
        let dest = Dest::ipv4(*key.dst.ip(), key.dst.port());

        let mut stream = tokio::time::timeout(BRIDGE_HANDSHAKE_TIMEOUT, async {
            let mut stream = TcpStream::connect(self.bridge_addr)
                .await
                .context("Failed to reach the bridge")?;
            stream.set_nodelay(true).ok();

            socks5_proto::client::request(&mut stream, Cmd::FwdUdp, &dest, None)
                .await
                .context("Bridge refused FWD_UDP")?;

            anyhow::Ok(stream)
        })
        .await
        .context("FWD_UDP session setup timed out")??;

        loop {
            let query = tokio::select! {
                _ = self.cancel.cancelled() => break,
                query = tokio::time::timeout(FLOW_IDLE_EXPIRY, queries.recv()) => {
                    match query {
                        Ok(Some(query)) => query,
                        Ok(None) | Err(_) => break, // Evicted or idle.
                    }
                }
            };

            self.nat.touch(&key);

            socks5_proto::fwd_udp::write_frame(&mut stream, &dest, &query)
                .await
                .context("Failed to send FWD_UDP query")?;

            let reply = tokio::time::timeout(
                BRIDGE_HANDSHAKE_TIMEOUT,
                socks5_proto::fwd_udp::read_frame(&mut stream),
            )
            .await
            .context("FWD_UDP reply timed out")?
            .context("FWD_UDP framing error")?;

            let Some(frame) = reply else {
                break;
            };

            self.reply_to_client(key, &frame.payload).await?;
        }

        Ok(())
    }

    /// Anything that is not DNS-via-bridge: a protected direct socket.
    async fn run_direct_flow(
        self: &Arc<Self>,
        key: FlowKey,
        mut outbound: mpsc::Receiver<Vec<u8>>,
    ) -> Result<()> {
        let socket = socket_factory::bind_udp(
            &self.protect,
            SocketAddr::V4(SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0)),
        )
        .context("Failed to bind a direct UDP socket")?;

        socket
            .connect(SocketAddr::V4(key.dst))
            .await
            .context("Failed to connect the direct UDP socket")?;

        let mut recv_buf = vec![0u8; ip_packet::MTU];

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                datagram = tokio::time::timeout(FLOW_IDLE_EXPIRY, outbound.recv()) => {
                    match datagram {
                        Ok(Some(datagram)) => {
                            self.nat.touch(&key);

                            if let Err(e) = socket.send(&datagram).await {
                                tracing::debug!(%key, "Direct UDP send failed: {e}");
                            }
                        }
                        Ok(None) | Err(_) => break, // Evicted or idle.
                    }
                }
                received = socket.recv(&mut recv_buf) => {
                    let n = received.context("Direct UDP recv failed")?;

                    self.nat.touch(&key);
                    self.reply_to_client(key, &recv_buf[..n]).await?;
                }
            }
        }

        Ok(())
    }

    /// Synthesises the response datagram back onto the TUN device.
    async fn reply_to_client(&self, key: FlowKey, payload: &[u8]) -> Result<()> {
        let packet = make::udp(key.dst, key.src, payload)?;

        self.stats.record_rx(packet.len());
        self.writer.send(packet).await
    }
}

enum UdpPath {
    BridgeDns,
    Direct,
}
