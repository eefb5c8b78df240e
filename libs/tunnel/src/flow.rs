//! The per-flow TCP state machine.
//!
//! Each flow is one task: it answers the handshake locally, chains the flow
//! into a SOCKS5 CONNECT on the bridge, and shuttles bytes until either
//! side closes. There is no retransmission queue; the TUN side is loopback
//! and the host TCP stack retransmits through the same flow.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use hmac::{Hmac, Mac as _};
use ip_packet::make::{self, TcpFlags};
use ip_packet::{FlowKey, MAX_TCP_PAYLOAD};
use parking_lot::Mutex;
use sha2::Sha256;
use socks5_proto::Dest;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tun::TunWriter;
use veilnet_model::TrafficStats;

use crate::nat::{NatTable, TcpState};

/// The receive window we advertise. Real flow control comes from the
/// carrier socket's backpressure.
const WINDOW: u16 = u16::MAX;

/// Bytes a pending flow may buffer while the carrier CONNECT is in flight.
const PENDING_BUFFER_CAP: usize = 256 * 1024;

/// How long a half-closed flow keeps draining the carrier.
const DRAIN_BUDGET: Duration = Duration::from_secs(10);

/// Read size towards the carrier; segmented to [`MAX_TCP_PAYLOAD`] on the
/// way out.
const UPSTREAM_READ_SIZE: usize = 64 * 1024;

/// Capacity of the engine-to-flow event channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

pub(crate) type FlowMap = Arc<Mutex<HashMap<FlowKey, FlowHandle>>>;

pub(crate) struct FlowHandle {
    pub events: mpsc::Sender<FlowEvent>,
    pub stream_id: u64,
}

pub(crate) enum FlowEvent {
    /// A segment carrying payload and/or FIN.
    Segment {
        seq: u32,
        payload: Vec<u8>,
        fin: bool,
    },
    /// A pure ACK.
    Ack(u32),
    /// The client retransmitted its SYN while we are still pending.
    SynRetransmit,
    Rst,
}

pub(crate) struct FlowConfig {
    pub key: FlowKey,
    pub stream_id: u64,
    pub client_isn: u32,
    pub bridge_addr: SocketAddr,
    pub connect_timeout: Duration,
    pub writer: TunWriter,
    pub nat: Arc<NatTable>,
    pub flows: FlowMap,
    pub stats: Arc<TrafficStats>,
    pub cancel: CancellationToken,
}

pub(crate) fn spawn(config: FlowConfig, events: mpsc::Receiver<FlowEvent>) {
    tokio::spawn(async move {
        let key = config.key;

        if let Err(e) = Flow::new(config).run(events).await {
            tracing::debug!(%key, "Flow ended with error: {e:#}");
        }
    });
}

/// Sequence bookkeeping of one flow.
struct SeqState {
    our_isn: u32,
    /// The next sequence number we send.
    our_seq: u32,
    /// The next client sequence number we expect, i.e. our ACK.
    peer_ack: u32,
    /// The client's latest acknowledgement of our data.
    peer_acked_up_to: u32,
    client_fin_seen: bool,
    tunnel_eof_seen: bool,
}

struct Flow {
    key: FlowKey,
    seq: SeqState,
    config: FlowConfig,
}

impl Flow {
    fn new(config: FlowConfig) -> Self {
        let our_isn = initial_sequence_number(&config.key);

        Self {
            key: config.key,
            seq: SeqState {
                our_isn,
                our_seq: our_isn.wrapping_add(1),
                peer_ack: config.client_isn.wrapping_add(1),
                peer_acked_up_to: our_isn,
                client_fin_seen: false,
                tunnel_eof_seen: false,
            },
            config,
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<FlowEvent>) -> Result<()> {
        self.config.stats.flow_opened();

        let result = self.shuttle(&mut events).await;

        // TIME_WAIT, then the cleanup tick purges us.
        self.config.nat.release(&self.key);
        self.config.stats.flow_closed();

        let mut flows = self.config.flows.lock();
        if flows
            .get(&self.key)
            .is_some_and(|handle| handle.stream_id == self.config.stream_id)
        {
            flows.remove(&self.key);
        }

        result
    }

    async fn shuttle(&mut self, events: &mut mpsc::Receiver<FlowEvent>) -> Result<()> {
        // SYN-ACK goes out before the carrier CONNECT even starts.
        self.send_syn_ack().await?;

        let Some(upstream) = self.pending_phase(events).await? else {
            return Ok(());
        };

        self.established_phase(events, upstream).await
    }

    /// Waits for the carrier CONNECT while ACKing client data into a
    /// bounded buffer. Returns `None` when the flow died during pending.
    async fn pending_phase(
        &mut self,
        events: &mut mpsc::Receiver<FlowEvent>,
    ) -> Result<Option<TcpStream>> {
        let connect = connect_via_bridge(
            self.config.bridge_addr,
            self.key,
            self.config.connect_timeout,
        );
        tokio::pin!(connect);

        let mut buffered: Vec<u8> = Vec::new();

        let mut upstream = loop {
            tokio::select! {
                _ = self.config.cancel.cancelled() => return Ok(None),
                result = &mut connect => match result {
                    Ok(stream) => break stream,
                    Err(e) => {
                        tracing::debug!(key = %self.key, "Carrier CONNECT failed: {e:#}");
                        self.send_rst().await?;

                        return Ok(None);
                    }
                },
                event = events.recv() => match event {
                    None => return Ok(None),
                    Some(FlowEvent::SynRetransmit) => self.send_syn_ack().await?,
                    Some(FlowEvent::Ack(n)) => self.seq.peer_acked_up_to = n,
                    Some(FlowEvent::Rst) => return Ok(None),
                    Some(FlowEvent::Segment { seq, payload, fin }) => {
                        if seq == self.seq.peer_ack {
                            if buffered.len() + payload.len() > PENDING_BUFFER_CAP {
                                tracing::warn!(key = %self.key, "Pending buffer overflow");
                                self.send_rst().await?;

                                return Ok(None);
                            }

                            self.seq.peer_ack =
                                self.seq.peer_ack.wrapping_add(payload.len() as u32);
                            buffered.extend_from_slice(&payload);

                            if fin {
                                self.seq.client_fin_seen = true;
                                self.seq.peer_ack = self.seq.peer_ack.wrapping_add(1);
                            }
                        }

                        // ACK at the TCP layer even though the CONNECT is
                        // still in flight (and re-ACK duplicates).
                        self.send_ack().await?;
                    }
                },
            }
        };

        self.config.nat.set_tcp_state(&self.key, TcpState::Established);

        if !buffered.is_empty() {
            upstream
                .write_all(&buffered)
                .await
                .context("Failed to flush the pending buffer")?;
        }

        if self.seq.client_fin_seen {
            upstream
                .shutdown()
                .await
                .context("Failed to half-close the carrier")?;
        }

        Ok(Some(upstream))
    }

    async fn established_phase(
        &mut self,
        events: &mut mpsc::Receiver<FlowEvent>,
        upstream: TcpStream,
    ) -> Result<()> {
        let (mut up_read, mut up_write) = upstream.into_split();
        let mut read_buf = vec![0u8; UPSTREAM_READ_SIZE];

        // A FIN during pending starts the drain budget right away.
        let mut drain_deadline = self
            .seq
            .client_fin_seen
            .then(|| Instant::now() + DRAIN_BUDGET);

        loop {
            let force_close = async {
                match drain_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.config.cancel.cancelled() => break,
                _ = force_close => break,
                event = events.recv() => match event {
                    None => break,
                    Some(FlowEvent::SynRetransmit) => {} // Stale; already established.
                    Some(FlowEvent::Rst) => break,
                    Some(FlowEvent::Ack(n)) => {
                        self.seq.peer_acked_up_to = n;

                        if self.fully_closed() {
                            break;
                        }
                    }
                    Some(FlowEvent::Segment { seq, payload, fin }) => {
                        if seq == self.seq.peer_ack {
                            if !payload.is_empty() {
                                if up_write.write_all(&payload).await.is_err() {
                                    self.send_rst().await?;
                                    break;
                                }

                                self.seq.peer_ack =
                                    self.seq.peer_ack.wrapping_add(payload.len() as u32);
                            }

                            if fin && !self.seq.client_fin_seen {
                                self.seq.client_fin_seen = true;
                                self.seq.peer_ack = self.seq.peer_ack.wrapping_add(1);
                                self.config.nat.set_tcp_state(&self.key, TcpState::Closing);

                                // Half-close towards the carrier; keep
                                // draining late server bytes.
                                let _ = up_write.shutdown().await;
                                drain_deadline = Some(Instant::now() + DRAIN_BUDGET);
                            }
                        }

                        // Out-of-order segments are not reassembled; the
                        // current ACK triggers the client's retransmit.
                        self.send_ack().await?;

                        if self.fully_closed() {
                            break;
                        }
                    }
                },
                read = up_read.read(&mut read_buf), if !self.seq.tunnel_eof_seen => match read {
                    Ok(0) => {
                        self.seq.tunnel_eof_seen = true;
                        self.send_fin_ack().await?;
                        self.config.nat.set_tcp_state(&self.key, TcpState::Closing);
                        drain_deadline = Some(Instant::now() + DRAIN_BUDGET);
                    }
                    Ok(n) => self.send_data(&read_buf[..n]).await?,
                    Err(e) => {
                        tracing::debug!(key = %self.key, "Carrier read failed: {e}");
                        self.send_rst().await?;
                        break;
                    }
                },
            }
        }

        Ok(())
    }

    fn fully_closed(&self) -> bool {
        self.seq.client_fin_seen
            && self.seq.tunnel_eof_seen
            && self.seq.peer_acked_up_to == self.seq.our_seq
    }

    /// Segments `data` and emits it towards the client.
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(MAX_TCP_PAYLOAD) {
            let packet = make::tcp(
                self.key.dst,
                self.key.src,
                self.seq.our_seq,
                self.seq.peer_ack,
                TcpFlags {
                    ack: true,
                    psh: chunk.len() < MAX_TCP_PAYLOAD,
                    ..Default::default()
                },
                WINDOW,
                chunk,
            )?;

            self.seq.our_seq = self.seq.our_seq.wrapping_add(chunk.len() as u32);
            self.config.stats.record_rx(packet.len());
            self.config.writer.send(packet).await?;
        }

        Ok(())
    }

    async fn send_syn_ack(&mut self) -> Result<()> {
        self.emit(self.seq.our_isn, TcpFlags::SYN_ACK).await
    }

    async fn send_ack(&mut self) -> Result<()> {
        self.emit(self.seq.our_seq, TcpFlags::ACK).await
    }

    async fn send_fin_ack(&mut self) -> Result<()> {
        self.emit(self.seq.our_seq, TcpFlags::FIN_ACK).await?;
        self.seq.our_seq = self.seq.our_seq.wrapping_add(1);

        Ok(())
    }

    async fn send_rst(&mut self) -> Result<()> {
        self.emit(self.seq.our_seq, TcpFlags::RST).await
    }

    async fn emit(&mut self, seq: u32, flags: TcpFlags) -> Result<()> {
        let packet = make::tcp(
            self.key.dst,
            self.key.src,
            seq,
            self.seq.peer_ack,
            flags,
            WINDOW,
            &[],
        )?;

        self.config.writer.send(packet).await
    }
}

/// Opens the carrier leg: loopback TCP to the bridge, then a SOCKS5 CONNECT
/// for the flow's original destination, always as an IPv4 address type.
async fn connect_via_bridge(
    bridge_addr: SocketAddr,
    key: FlowKey,
    timeout: Duration,
) -> Result<TcpStream> {
    let dest = Dest::ipv4(*key.dst.ip(), key.dst.port());

    tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect(bridge_addr)
            .await
            .context("Failed to reach the bridge")?;
        stream.set_nodelay(true).ok();

        socks5_proto::client::connect(&mut stream, &dest, None)
            .await
            .context("Bridge refused the CONNECT")?;

        Ok(stream)
    })
    .await
    .context("Carrier CONNECT timed out")?
}

/// RFC 6528 style: a keyed hash over the flow key plus a slowly moving
/// clock term, so ISNs are neither guessable nor reused across quick
/// reconnects of the same 4-tuple.
fn initial_sequence_number(key: &FlowKey) -> u32 {
    static BOOT_SECRET: LazyLock<[u8; 32]> = LazyLock::new(rand::random);
    static BOOT_TIME: LazyLock<Instant> = LazyLock::new(Instant::now);

    #[allow(clippy::expect_used)]
    let mut mac = Hmac::<Sha256>::new_from_slice(BOOT_SECRET.as_slice())
        .expect("HMAC accepts any key length");

    mac.update(&key.src.ip().octets());
    mac.update(&key.src.port().to_be_bytes());
    mac.update(&key.dst.ip().octets());
    mac.update(&key.dst.port().to_be_bytes());

    let digest = mac.finalize().into_bytes();
    let base = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);

    let ticks = (BOOT_TIME.elapsed().as_micros() / 4) as u32;

    base.wrapping_add(ticks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn key(src_port: u16) -> FlowKey {
        FlowKey {
            src: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), src_port),
            dst: SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443),
        }
    }

    #[test]
    fn isn_is_stable_per_flow_key_modulo_clock() {
        let a = initial_sequence_number(&key(1));
        let b = initial_sequence_number(&key(1));

        // Same key: only the 4 µs clock term moves.
        assert!(b.wrapping_sub(a) < 1_000_000);
    }

    #[test]
    fn isn_differs_across_flow_keys() {
        // The keyed hash separates adjacent ports by far more than the
        // clock term moves between the two calls.
        let a = initial_sequence_number(&key(1));
        let b = initial_sequence_number(&key(2));

        assert!(a.wrapping_sub(b) > 4096 && b.wrapping_sub(a) > 4096);
    }
}
