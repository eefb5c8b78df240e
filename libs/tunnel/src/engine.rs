//! The engine: reads parsed packets off the TUN device and drives the TCP
//! flow tasks and the UDP splitter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ip_packet::IpPacket;
use parking_lot::Mutex;
use socket_factory::Protect;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tun::TunDevice;
use veilnet_model::TrafficStats;

use crate::flow::{self, FlowEvent, FlowHandle, FlowMap};
use crate::nat::{EntryKind, NatTable, TcpState};
use crate::udp::{DnsMode, UdpSplitter};

/// NAT cleanup cadence.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct EngineConfig {
    /// The active bridge's SOCKS5 endpoint.
    pub bridge_addr: SocketAddr,
    /// Budget for the bridge CONNECT chain, carrier handshake included.
    pub connect_timeout: Duration,
    pub dns_mode: DnsMode,
    pub protect: Protect,
}

/// A running engine. Stopping it tears down every flow task and shuts the
/// TUN device down, which closes the underlying fd exactly once.
pub struct EngineHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    device: Arc<dyn TunDevice>,
    stats: Arc<TrafficStats>,
}

impl EngineHandle {
    pub fn stats(&self) -> &Arc<TrafficStats> {
        &self.stats
    }

    pub async fn stop(self) {
        self.cancel.cancel();

        // Unblocks the reader thread and closes the fd exactly once.
        self.device.shutdown();

        let _ = self.task.await;
    }
}

/// Spawns the TUN reader/writer pair and the dispatch loop.
pub fn spawn(
    device: Arc<dyn TunDevice>,
    config: EngineConfig,
    stats: Arc<TrafficStats>,
) -> EngineHandle {
    let ingress = tun::spawn_reader(Arc::clone(&device));
    let writer = tun::spawn_writer(Arc::clone(&device));

    let cancel = CancellationToken::new();
    let nat = Arc::new(NatTable::new());
    let flows: FlowMap = Arc::new(Mutex::new(Default::default()));

    let udp = UdpSplitter::new(
        writer.clone(),
        config.protect.clone(),
        Arc::clone(&nat),
        Arc::clone(&stats),
        config.bridge_addr,
        config.dns_mode,
        cancel.clone(),
    );

    let engine = Engine {
        config,
        writer,
        nat,
        flows,
        udp,
        stats: Arc::clone(&stats),
        cancel: cancel.clone(),
    };

    let task = tokio::spawn(engine.run(ingress));

    EngineHandle {
        cancel,
        task,
        device,
        stats,
    }
}

struct Engine {
    config: EngineConfig,
    writer: tun::TunWriter,
    nat: Arc<NatTable>,
    flows: FlowMap,
    udp: Arc<UdpSplitter>,
    stats: Arc<TrafficStats>,
    cancel: CancellationToken,
}

impl Engine {
    async fn run(self, mut ingress: mpsc::Receiver<IpPacket>) {
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = cleanup.tick() => {
                    for key in self.nat.cleanup_expired() {
                        self.flows.lock().remove(&key);
                        self.udp.evict(&key);
                    }
                }
                packet = ingress.recv() => {
                    let Some(packet) = packet else {
                        tracing::debug!("TUN reader closed, stopping engine");
                        break;
                    };

                    self.dispatch(packet);
                }
            }
        }
    }

    fn dispatch(&self, packet: IpPacket) {
        self.stats.record_tx(packet.len());

        if packet.as_tcp().is_some() {
            self.dispatch_tcp(&packet);
        } else if packet.as_udp().is_some() {
            self.udp.handle(&packet);
        }
        // Anything else (ICMP etc.) is dropped; only TCP and DNS-ish UDP
        // traverse the tunnel.
    }

    fn dispatch_tcp(&self, packet: &IpPacket) {
        let Some(tcp) = packet.as_tcp() else {
            return;
        };
        let Some(key) = packet.flow_key() else {
            return;
        };

        let (syn, ack, fin, rst) = (tcp.syn(), tcp.ack(), tcp.fin(), tcp.rst());
        let seq = tcp.sequence_number();
        let ack_number = tcp.acknowledgment_number();
        let payload = tcp.payload();

        if rst {
            self.deliver(&key, FlowEvent::Rst);

            return;
        }

        if syn && !ack {
            self.handle_syn(key, seq);

            return;
        }

        let event = if !payload.is_empty() || fin {
            FlowEvent::Segment {
                seq,
                payload: payload.to_vec(),
                fin,
            }
        } else {
            FlowEvent::Ack(ack_number)
        };

        self.deliver(&key, event);
    }

    fn handle_syn(&self, key: ip_packet::FlowKey, client_isn: u32) {
        // A SYN on a TIME_WAIT entry starts a fresh flow.
        if let Some(entry) = self.nat.get(&key)
            && entry.kind == EntryKind::Tcp(TcpState::Closed)
        {
            self.nat.remove(&key);
            self.flows.lock().remove(&key);
        }

        let (stream_id, is_new) = self
            .nat
            .get_or_create(key, EntryKind::Tcp(TcpState::SynReceived));

        if !is_new {
            // Retransmitted SYN: the pending flow re-emits its SYN-ACK with
            // the already-chosen ISN.
            self.deliver(&key, FlowEvent::SynRetransmit);

            return;
        }

        let (events_tx, events_rx) = mpsc::channel(flow::EVENT_CHANNEL_CAPACITY);

        self.flows.lock().insert(
            key,
            FlowHandle {
                events: events_tx,
                stream_id,
            },
        );

        flow::spawn(
            flow::FlowConfig {
                key,
                stream_id,
                client_isn,
                bridge_addr: self.config.bridge_addr,
                connect_timeout: self.config.connect_timeout,
                writer: self.writer.clone(),
                nat: Arc::clone(&self.nat),
                flows: Arc::clone(&self.flows),
                stats: Arc::clone(&self.stats),
                cancel: self.cancel.clone(),
            },
            events_rx,
        );
    }

    /// Hands an event to a flow task without ever blocking the dispatch
    /// loop; a full queue drops the segment and the client retransmits.
    fn deliver(&self, key: &ip_packet::FlowKey, event: FlowEvent) {
        let mut flows = self.flows.lock();

        let Some(handle) = flows.get(key) else {
            // Late packet of a purged flow; TIME_WAIT entries absorb these
            // silently.
            return;
        };

        match handle.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!(%key, "Flow event queue full, dropping segment");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                flows.remove(key);
            }
        }
    }
}
