//! The Tor bridge's short-lived DNS response cache.
//!
//! Keyed by the query body with the transaction id stripped, so repeated
//! lookups for the same name hit regardless of the client's TXID. On a hit
//! the stored response is copied and its TXID overwritten with the incoming
//! query's.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const TTL: Duration = Duration::from_secs(60);

struct CacheEntry {
    response: Vec<u8>,
    expires_at: Instant,
}

#[derive(Default)]
pub struct DnsCache {
    entries: Mutex<HashMap<Vec<u8>, CacheEntry>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a response for `query`, rewriting the TXID to the query's.
    pub fn lookup(&self, query: &[u8]) -> Option<Vec<u8>> {
        let (txid, body) = query.split_at_checked(2)?;

        let mut entries = self.entries.lock();
        let entry = entries.get(body)?;

        if entry.expires_at <= Instant::now() {
            entries.remove(body);

            return None;
        }

        let mut response = entry.response.clone();

        if response.len() < 2 {
            return None;
        }

        response[..2].copy_from_slice(txid);

        Some(response)
    }

    /// Stores `response` under the TXID-stripped body of `query`.
    pub fn store(&self, query: &[u8], response: &[u8]) {
        let Some((_, body)) = query.split_at_checked(2) else {
            return;
        };

        let mut entries = self.entries.lock();

        // Piggy-back expired-entry collection on writes.
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);

        entries.insert(
            body.to_vec(),
            CacheEntry {
                response: response.to_vec(),
                expires_at: now + TTL,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rewrites_the_txid_only() {
        let cache = DnsCache::new();

        let query_a = b"\xaa\xbb<question>";
        let response_a = b"\xaa\xbb<answer>";
        cache.store(query_a, response_a);

        // Same question, different TXID.
        let query_b = b"\x11\x22<question>";
        let hit = cache.lookup(query_b).unwrap();

        assert_eq!(&hit[..2], b"\x11\x22");
        assert_eq!(&hit[2..], b"<answer>");
    }

    #[test]
    fn different_questions_do_not_collide() {
        let cache = DnsCache::new();

        cache.store(b"\x00\x01question-a", b"\x00\x01answer-a");

        assert!(cache.lookup(b"\x00\x02question-b").is_none());
    }

    #[test]
    fn entries_expire() {
        let cache = DnsCache::new();

        cache.store(b"\x00\x01q", b"\x00\x01a");
        cache.entries.lock().values_mut().for_each(|entry| {
            entry.expires_at = Instant::now() - Duration::from_secs(1);
        });

        assert!(cache.lookup(b"\x00\x01q").is_none());
    }

    #[test]
    fn truncated_queries_are_ignored() {
        let cache = DnsCache::new();

        cache.store(b"\x00", b"\x00\x01a");

        assert!(cache.lookup(b"\x00").is_none());
        assert!(cache.entries.lock().is_empty());
    }
}
