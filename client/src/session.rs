//! Session orchestration: carrier, bridge and engine lifecycles in the
//! right order, with state transitions published on the way.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use domain_router::{Router, RouterConfig};
use socket_factory::Protect;
use tun::TunDevice;
use veilnet_model::{ConnectionState, Profile, StateCell, TrafficStats, Transport};
use veilnet_tunnel::bridge::BridgeHandle;
use veilnet_tunnel::{DnsMode, EngineConfig, EngineHandle, spawn_engine};

use crate::carrier::{self, Carrier};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Everything belonging to one connection. Dropping it without
/// [`Session::disconnect`] leaks the carrier; the client always goes
/// through disconnect.
pub struct Session {
    engine: EngineHandle,
    bridge: BridgeHandle,
    carrier: Carrier,
    state: StateCell,
    stats_task: tokio::task::JoinHandle<()>,
}

impl Session {
    /// Brings the tunnel up: carrier first, then the bridge fronting it,
    /// then the packet engine driving the bridge.
    pub async fn connect(
        profile: Profile,
        device: Arc<dyn TunDevice>,
        state: StateCell,
    ) -> Result<Self> {
        state.set(ConnectionState::Connecting);

        match Self::connect_inner(&profile, device, &state).await {
            Ok(session) => {
                state.set(ConnectionState::Connected(profile.id.clone()));

                Ok(session)
            }
            Err(e) => {
                // Exactly one status string; the chain stays in the logs.
                state.set(ConnectionState::Error(e.to_string()));

                Err(e)
            }
        }
    }

    async fn connect_inner(
        profile: &Profile,
        device: Arc<dyn TunDevice>,
        state: &StateCell,
    ) -> Result<Session> {
        let router = Arc::new(
            Router::new(router_config(profile)).context("Router configuration is invalid")?,
        );

        let protect = Protect::none();

        let (carrier, bridge) = carrier::start(profile, router, protect.clone())
            .await
            .context("Failed to start the carrier")?;

        let stats = TrafficStats::new();

        let engine = spawn_engine(
            device,
            EngineConfig {
                bridge_addr: bridge.local_addr(),
                connect_timeout: connect_timeout(&profile.transport),
                dns_mode: if profile.dns.direct {
                    DnsMode::Direct
                } else {
                    DnsMode::Bridge
                },
                protect,
            },
            Arc::clone(&stats),
        );

        let stats_task = tokio::spawn({
            let stats = Arc::clone(&stats);

            async move {
                let mut interval = tokio::time::interval(STATS_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await; // The immediate first tick.

                loop {
                    interval.tick().await;
                    tracing::info!("Traffic: {}", stats.snapshot());
                }
            }
        });

        Ok(Session {
            engine,
            bridge,
            carrier,
            state: state.clone(),
            stats_task,
        })
    }

    /// Tears the session down: the shim first, then the bridge, then the
    /// carrier.
    pub async fn disconnect(self) {
        self.state.set(ConnectionState::Disconnecting);
        self.stats_task.abort();

        self.engine.stop().await;
        self.bridge.stop().await;
        self.carrier.stop().await;

        self.state.set(ConnectionState::Disconnected);
    }
}

fn router_config(profile: &Profile) -> RouterConfig {
    let settings = &profile.router;

    RouterConfig {
        enabled: settings.enabled,
        mode: match settings.mode {
            veilnet_model::RouterMode::Bypass => domain_router::RouterMode::Bypass,
            veilnet_model::RouterMode::OnlyVpn => domain_router::RouterMode::OnlyVpn,
        },
        domain_rules: settings.domains.clone(),
        geo_enabled: settings.geo_enabled,
        geo_ranges: settings.geo_ranges.clone(),
        geo_domains: settings.geo_domains.clone(),
    }
}

/// DNS-tunnel carriers are slow; give their handshakes more room.
fn connect_timeout(transport: &Transport) -> Duration {
    match transport {
        Transport::Dnstt { .. } | Transport::Slipstream { .. } => Duration::from_secs(45),
        Transport::Ssh { .. } | Transport::Doh { .. } | Transport::Tor { .. } => {
            Duration::from_secs(30)
        }
    }
}
