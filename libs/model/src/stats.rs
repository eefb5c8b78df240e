use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Traffic counters, shared across every subsystem of a session.
///
/// tx is client-to-remote, rx is remote-to-client, counted at the TUN
/// boundary.
#[derive(Default)]
pub struct TrafficStats {
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    rx_packets: AtomicU64,
    active_flows: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub active_flows: u64,
}

impl TrafficStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_tx(&self, bytes: usize) {
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rx(&self, bytes: usize) {
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_opened(&self) {
        self.active_flows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_closed(&self) {
        // Saturating: a double-close must not wrap the gauge.
        let _ = self
            .active_flows
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            active_flows: self.active_flows.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tx {} B / {} pkts, rx {} B / {} pkts, {} active flows",
            self.tx_bytes, self.tx_packets, self.rx_bytes, self.rx_packets, self.active_flows
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_gauge_never_wraps() {
        let stats = TrafficStats::default();

        stats.flow_opened();
        stats.flow_closed();
        stats.flow_closed();

        assert_eq!(stats.snapshot().active_flows, 0);
    }
}
