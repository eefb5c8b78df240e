#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod codec;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

/// A carrier stream usable for DNS-over-TCP.
pub trait DnsStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<S> DnsStream for S where S: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedDnsStream = Box<dyn DnsStream>;

/// Implemented by each bridge: opens a carrier stream that has already
/// completed its CONNECT to `(dns_host, 53)`.
#[async_trait::async_trait]
pub trait DnsStreamConnector: Send + Sync + 'static {
    async fn connect(&self, dns_host: Ipv4Addr) -> Result<BoxedDnsStream>;
}

/// Last-resort DoH sender for phase 4 of the fallback pipeline.
///
/// The implementation must route the query through the covert carrier; it is
/// only handed to pools whose profile permits DoH fallback at all.
#[async_trait::async_trait]
pub trait DohFallback: Send + Sync + 'static {
    async fn query(&self, message: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct DnsPoolConfig {
    /// Number of worker slots.
    pub workers: usize,
    pub preferred_host: Ipv4Addr,
    pub fallback_host: Ipv4Addr,
    /// Budget for one query exchange on a live worker.
    pub query_timeout: Duration,
    /// Budget for opening a new carrier stream.
    pub connect_timeout: Duration,
}

impl Default for DnsPoolConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            preferred_host: Ipv4Addr::new(8, 8, 8, 8),
            fallback_host: Ipv4Addr::new(1, 1, 1, 1),
            query_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// How often dead slots are recreated.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Lock budget when the keepalive replaces a dead worker.
const KEEPALIVE_LOCK_BUDGET: Duration = Duration::from_secs(1);

/// Lock budget for the inline recreation phase of a query.
const INLINE_RECREATE_BUDGET: Duration = Duration::from_secs(5);

struct Worker {
    stream: BoxedDnsStream,
    created_at: Instant,
}

struct Slot {
    /// Guards query I/O on the worker. Queries use `try_lock` so one slow
    /// worker never blocks the others.
    io: Mutex<Option<Worker>>,
    /// Guards replacement, so two tasks never recreate the same slot twice.
    create: Mutex<()>,
}

/// A fixed array of long-lived DNS-over-TCP workers shared by all UDP:53
/// queries of a session.
pub struct DnsWorkerPool {
    slots: Vec<Slot>,
    connector: Arc<dyn DnsStreamConnector>,
    doh_fallback: Option<Arc<dyn DohFallback>>,
    /// Switched from preferred to fallback when prewarm cannot reach the
    /// preferred resolver at all.
    dns_host: AtomicU32,
    round_robin: AtomicUsize,
    config: DnsPoolConfig,
}

impl DnsWorkerPool {
    pub fn new(
        config: DnsPoolConfig,
        connector: Arc<dyn DnsStreamConnector>,
        doh_fallback: Option<Arc<dyn DohFallback>>,
    ) -> Arc<Self> {
        let slots = (0..config.workers.max(1))
            .map(|_| Slot {
                io: Mutex::new(None),
                create: Mutex::new(()),
            })
            .collect();

        Arc::new(Self {
            slots,
            connector,
            doh_fallback,
            dns_host: AtomicU32::new(config.preferred_host.into()),
            round_robin: AtomicUsize::new(0),
            config,
        })
    }

    pub fn dns_host(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dns_host.load(Ordering::Relaxed))
    }

    /// Opens the workers serially on bridge start.
    ///
    /// If slot 0 fails on the preferred host, the pool switches to the
    /// fallback host and retries slot 0 once. Failures of the remaining
    /// slots are left to the keepalive.
    pub async fn prewarm(&self) {
        for (index, slot) in self.slots.iter().enumerate() {
            let _create = slot.create.lock().await;

            match self.open_worker().await {
                Ok(worker) => {
                    *slot.io.lock().await = Some(worker);
                }
                Err(e) if index == 0 => {
                    let fallback = self.config.fallback_host;
                    tracing::warn!(
                        "DNS worker 0 failed on {}: {e:#}; switching to {fallback}",
                        self.dns_host()
                    );
                    self.dns_host.store(fallback.into(), Ordering::Relaxed);

                    match self.open_worker().await {
                        Ok(worker) => *slot.io.lock().await = Some(worker),
                        Err(e) => tracing::warn!("DNS worker 0 failed on fallback too: {e:#}"),
                    }
                }
                Err(e) => {
                    tracing::debug!("DNS worker {index} failed to open: {e:#}");
                }
            }
        }

        let live = self.live_workers().await;
        tracing::info!(workers = live, host = %self.dns_host(), "DNS worker pool ready");
    }

    /// Recreates dead slots every 20 s until the pool is dropped or `stop`
    /// is signalled via the returned handle being aborted.
    pub fn spawn_keepalive(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                for (index, slot) in pool.slots.iter().enumerate() {
                    let Ok(_create) =
                        tokio::time::timeout(KEEPALIVE_LOCK_BUDGET, slot.create.lock()).await
                    else {
                        continue; // Someone else is already recreating it.
                    };

                    let missing = match slot.io.try_lock() {
                        Ok(guard) => guard.is_none(),
                        Err(_) => false, // Busy means alive.
                    };

                    if !missing {
                        continue;
                    }

                    match pool.open_worker().await {
                        Ok(worker) => {
                            *slot.io.lock().await = Some(worker);
                            tracing::debug!("Recreated DNS worker {index}");
                        }
                        Err(e) => {
                            tracing::debug!("DNS worker {index} still unavailable: {e:#}");
                        }
                    }
                }
            }
        })
    }

    /// Sends one DNS query and returns the raw response message.
    ///
    /// Fallback phases, stopping at the first success:
    /// 1. every live worker, round-robin, skipping busy slots;
    /// 2. inline recreation of one slot;
    /// 3. a one-shot carrier connection;
    /// 4. DoH through the carrier, when the profile permits it.
    pub async fn query(&self, message: &[u8]) -> Result<Vec<u8>> {
        let start = self.round_robin.fetch_add(1, Ordering::Relaxed);

        // Phase 1: existing live workers.
        for offset in 0..self.slots.len() {
            let index = (start + offset) % self.slots.len();
            let slot = &self.slots[index];

            let Ok(mut guard) = slot.io.try_lock() else {
                continue;
            };
            let Some(worker) = guard.as_mut() else {
                continue;
            };

            match self.exchange(&mut worker.stream, message).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::debug!(
                        age = ?worker.created_at.elapsed(),
                        "DNS worker {index} failed, discarding: {e:#}"
                    );
                    *guard = None;
                }
            }
        }

        // Phase 2: recreate one slot inline and use it.
        match self.inline_recreate(start % self.slots.len(), message).await {
            Ok(response) => return Ok(response),
            Err(e) => tracing::debug!("Inline DNS worker recreation failed: {e:#}"),
        }

        // Phase 3: a one-shot connection, still through the carrier.
        match self.one_shot(message).await {
            Ok(response) => return Ok(response),
            Err(e) => tracing::debug!("One-shot DNS connection failed: {e:#}"),
        }

        // Phase 4: DoH, only when leak prevention permits.
        if let Some(doh) = &self.doh_fallback {
            return doh
                .query(message)
                .await
                .context("DoH fallback failed too");
        }

        Err(anyhow::anyhow!("every DNS fallback phase failed"))
    }

    /// Closes every worker. Called on bridge stop.
    pub async fn shutdown(&self) {
        for slot in &self.slots {
            let _create = slot.create.lock().await;
            slot.io.lock().await.take();
        }
    }

    async fn inline_recreate(&self, index: usize, message: &[u8]) -> Result<Vec<u8>> {
        let slot = &self.slots[index];

        let _create = tokio::time::timeout(INLINE_RECREATE_BUDGET, slot.create.lock())
            .await
            .context("Timed out waiting for the slot creation lock")?;

        let mut worker = self.open_worker().await?;
        let response = self.exchange(&mut worker.stream, message).await?;

        if let Ok(mut guard) = slot.io.try_lock() {
            *guard = Some(worker);
        }

        Ok(response)
    }

    async fn one_shot(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut worker = self.open_worker().await?;

        self.exchange(&mut worker.stream, message).await
    }

    async fn open_worker(&self) -> Result<Worker> {
        let host = self.dns_host();

        let stream = tokio::time::timeout(self.config.connect_timeout, self.connector.connect(host))
            .await
            .context("Timed out opening a DNS carrier stream")??;

        Ok(Worker {
            stream,
            created_at: Instant::now(),
        })
    }

    async fn exchange(&self, stream: &mut BoxedDnsStream, message: &[u8]) -> Result<Vec<u8>> {
        tokio::time::timeout(self.config.query_timeout, async {
            codec::send_message(stream, message)
                .await
                .context("Failed to send DNS query")?;

            let response = codec::recv_message(stream)
                .await
                .context("Failed to read DNS response")?;

            Ok(response)
        })
        .await
        .context("DNS query timed out")?
    }

    async fn live_workers(&self) -> usize {
        let mut live = 0;

        for slot in &self.slots {
            if let Ok(guard) = slot.io.try_lock()
                && guard.is_some()
            {
                live += 1;
            }
        }

        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// A connector backed by in-memory streams; the "resolver" side echoes
    /// each framed query back with the payload reversed.
    struct EchoConnector {
        fail: AtomicBool,
        opened: AtomicUsize,
    }

    impl EchoConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(false),
                opened: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl DnsStreamConnector for EchoConnector {
        async fn connect(&self, _dns_host: Ipv4Addr) -> Result<BoxedDnsStream> {
            if self.fail.load(Ordering::Relaxed) {
                anyhow::bail!("carrier down");
            }

            self.opened.fetch_add(1, Ordering::Relaxed);

            let (ours, mut theirs) = tokio::io::duplex(4096);

            tokio::spawn(async move {
                while let Ok(query) = codec::recv_message(&mut theirs).await {
                    let response = query.into_iter().rev().collect::<Vec<_>>();

                    if codec::send_message(&mut theirs, &response).await.is_err() {
                        break;
                    }
                }
            });

            Ok(Box::new(ours))
        }
    }

    struct StaticDoh;

    #[async_trait::async_trait]
    impl DohFallback for StaticDoh {
        async fn query(&self, _message: &[u8]) -> Result<Vec<u8>> {
            Ok(b"doh".to_vec())
        }
    }

    fn config() -> DnsPoolConfig {
        DnsPoolConfig {
            workers: 3,
            query_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn queries_round_robin_over_live_workers() {
        let connector = EchoConnector::new();
        let pool = DnsWorkerPool::new(config(), connector.clone(), None);

        pool.prewarm().await;
        assert_eq!(connector.opened.load(Ordering::Relaxed), 3);

        for _ in 0..6 {
            let response = pool.query(b"\x00\x01query").await.unwrap();
            assert_eq!(response, b"yreuq\x01\x00");
        }

        // Served by the prewarmed workers, no extra connections.
        assert_eq!(connector.opened.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn dead_workers_recover_inline() {
        let connector = EchoConnector::new();
        let pool = DnsWorkerPool::new(config(), connector.clone(), None);

        // No prewarm: all slots empty, so phase 1 finds nothing and phase 2
        // recreates a worker inline.
        let response = pool.query(b"\x00\x02q").await.unwrap();

        assert_eq!(response, b"q\x02\x00");
        assert_eq!(connector.opened.load(Ordering::Relaxed), 1);

        // The inline worker was parked in its slot and is reused.
        pool.query(b"\x00\x03r").await.unwrap();
        assert_eq!(connector.opened.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn doh_fallback_is_gated_on_the_flag() {
        let connector = EchoConnector::new();
        connector.fail.store(true, Ordering::Relaxed);

        let without = DnsWorkerPool::new(config(), connector.clone(), None);
        assert!(without.query(b"\x00\x04q").await.is_err());

        let with = DnsWorkerPool::new(config(), connector, Some(Arc::new(StaticDoh)));
        assert_eq!(with.query(b"\x00\x05q").await.unwrap(), b"doh");
    }

    #[tokio::test]
    async fn prewarm_switches_to_fallback_host_when_slot0_fails() {
        struct PickyConnector;

        #[async_trait::async_trait]
        impl DnsStreamConnector for PickyConnector {
            async fn connect(&self, dns_host: Ipv4Addr) -> Result<BoxedDnsStream> {
                if dns_host == Ipv4Addr::new(8, 8, 8, 8) {
                    anyhow::bail!("preferred resolver unreachable");
                }

                let (ours, _theirs) = tokio::io::duplex(64);

                Ok(Box::new(ours))
            }
        }

        let pool = DnsWorkerPool::new(config(), Arc::new(PickyConnector), None);
        pool.prewarm().await;

        assert_eq!(pool.dns_host(), Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(pool.live_workers().await, 3);
    }

    #[tokio::test]
    async fn shutdown_drains_every_slot() {
        let connector = EchoConnector::new();
        let pool = DnsWorkerPool::new(config(), connector, None);

        pool.prewarm().await;
        pool.shutdown().await;

        assert_eq!(pool.live_workers().await, 0);
    }
}
