//! The NAT table: 4-tuple to stream id, TCP state, expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ip_packet::FlowKey;
use parking_lot::Mutex;

/// Idle expiry for UDP-like flows.
const UDP_IDLE_EXPIRY: Duration = Duration::from_secs(60);

/// TIME_WAIT: a closed TCP entry lingers to absorb late FIN/RST.
const TCP_CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynReceived,
    Established,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Tcp(TcpState),
    Udp,
}

#[derive(Debug, Clone)]
pub struct NatEntry {
    pub key: FlowKey,
    pub stream_id: u64,
    pub kind: EntryKind,
    pub created_at: Instant,
    pub last_seen: Instant,
}

/// Invariant: at most one entry per flow key.
///
/// Readers and writers both take short critical sections on one mutex; every
/// operation is a map lookup plus a field update.
#[derive(Default)]
pub struct NatTable {
    entries: Mutex<HashMap<FlowKey, NatEntry>>,
    next_stream_id: AtomicU64,
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry's stream id and whether it was newly created.
    pub fn get_or_create(&self, key: FlowKey, kind: EntryKind) -> (u64, bool) {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        if let Some(entry) = entries.get_mut(&key) {
            entry.last_seen = now;

            return (entry.stream_id, false);
        }

        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);

        entries.insert(
            key,
            NatEntry {
                key,
                stream_id,
                kind,
                created_at: now,
                last_seen: now,
            },
        );

        (stream_id, true)
    }

    pub fn get(&self, key: &FlowKey) -> Option<NatEntry> {
        self.entries.lock().get(key).cloned()
    }

    pub fn update(&self, key: &FlowKey, f: impl FnOnce(&mut NatEntry)) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            f(entry);
        }
    }

    /// Refreshes the idle timer of an entry.
    pub fn touch(&self, key: &FlowKey) {
        self.update(key, |entry| entry.last_seen = Instant::now());
    }

    pub fn set_tcp_state(&self, key: &FlowKey, state: TcpState) {
        self.update(key, |entry| {
            entry.kind = EntryKind::Tcp(state);
            entry.last_seen = Instant::now();
        });
    }

    /// Moves a TCP entry into TIME_WAIT instead of deleting it outright, so
    /// late packets of the flow are still recognised for ~2 s.
    pub fn release(&self, key: &FlowKey) {
        self.set_tcp_state(key, TcpState::Closed);
    }

    /// Deletes an entry immediately, without a grace period.
    pub fn remove(&self, key: &FlowKey) {
        self.entries.lock().remove(key);
    }

    /// Purges idle UDP entries and TCP entries past their close grace.
    ///
    /// Returns the removed keys so the owner can tear down per-flow tasks.
    pub fn cleanup_expired(&self) -> Vec<FlowKey> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired = entries
            .values()
            .filter(|entry| match entry.kind {
                EntryKind::Udp => now.duration_since(entry.last_seen) >= UDP_IDLE_EXPIRY,
                EntryKind::Tcp(TcpState::Closed) => {
                    now.duration_since(entry.last_seen) >= TCP_CLOSE_GRACE
                }
                EntryKind::Tcp(_) => false,
            })
            .map(|entry| entry.key)
            .collect::<Vec<_>>();

        for key in &expired {
            entries.remove(key);
        }

        expired
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
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
    fn at_most_one_entry_per_key() {
        let nat = NatTable::new();

        let (id_a, new_a) = nat.get_or_create(key(1), EntryKind::Tcp(TcpState::SynReceived));
        let (id_b, new_b) = nat.get_or_create(key(1), EntryKind::Tcp(TcpState::SynReceived));

        assert!(new_a);
        assert!(!new_b);
        assert_eq!(id_a, id_b);
        assert_eq!(nat.len(), 1);
    }

    #[test]
    fn stream_ids_are_monotonic() {
        let nat = NatTable::new();

        let (a, _) = nat.get_or_create(key(1), EntryKind::Udp);
        let (b, _) = nat.get_or_create(key(2), EntryKind::Udp);
        let (c, _) = nat.get_or_create(key(3), EntryKind::Udp);

        assert!(a < b && b < c);
    }

    #[test]
    fn released_tcp_entries_linger_then_expire() {
        let nat = NatTable::new();

        nat.get_or_create(key(1), EntryKind::Tcp(TcpState::Established));
        nat.release(&key(1));

        // Still present: TIME_WAIT absorbs late packets.
        assert!(nat.cleanup_expired().is_empty());
        assert!(nat.get(&key(1)).is_some());

        nat.update(&key(1), |entry| {
            entry.last_seen = Instant::now() - Duration::from_secs(3);
        });

        assert_eq!(nat.cleanup_expired(), vec![key(1)]);
        assert!(nat.get(&key(1)).is_none());
    }

    #[test]
    fn idle_udp_entries_expire_after_a_minute() {
        let nat = NatTable::new();

        nat.get_or_create(key(1), EntryKind::Udp);
        nat.get_or_create(key(2), EntryKind::Udp);

        nat.update(&key(1), |entry| {
            entry.last_seen = Instant::now() - Duration::from_secs(61);
        });

        assert_eq!(nat.cleanup_expired(), vec![key(1)]);
        assert_eq!(nat.len(), 1);
    }

    #[test]
    fn live_tcp_entries_never_expire_by_time() {
        let nat = NatTable::new();

        nat.get_or_create(key(1), EntryKind::Tcp(TcpState::Established));
        nat.update(&key(1), |entry| {
            entry.last_seen = Instant::now() - Duration::from_secs(3600);
        });

        assert!(nat.cleanup_expired().is_empty());
    }
}
