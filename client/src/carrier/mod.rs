//! Carrier adapters: from a profile's transport to a running bridge.
//!
//! Most carriers are external processes exposing an endpoint (the DNSTT
//! tunnel, the Slipstream client, Tor); the client only consumes those
//! contracts. The SSH carrier is in-process, built on `russh`.

pub mod ssh;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use domain_router::Router;
use socket_factory::Protect;
use socks5_proto::client::Auth;
use veilnet_model::{DnsSettings, Profile, Transport};
use veilnet_tunnel::bridge::{
    BridgeConfig, BridgeHandle, DirectCarrier, SocksCarrier, SshCarrier, SshTransport,
    TorCarrier, direct_bridge, doh_bridge, socks_carrier_bridge, ssh_bridge, tor_bridge,
};

/// What must be torn down after the bridge, carrier-family specific.
pub enum Carrier {
    /// An externally managed endpoint; nothing to stop here.
    External,
    Ssh(Arc<ssh::RusshTransport>),
}

impl Carrier {
    pub async fn stop(self) {
        match self {
            Carrier::External => {}
            Carrier::Ssh(transport) => transport.disconnect().await,
        }
    }
}

/// Starts the carrier (where in-process) and the bridge fronting it.
pub async fn start(
    profile: &Profile,
    router: Arc<Router>,
    protect: Protect,
) -> Result<(Carrier, BridgeHandle)> {
    let config = BridgeConfig {
        listen: listen_addr(profile)?,
        router,
        protect,
    };

    match &profile.transport {
        Transport::Dnstt {
            carrier_host,
            carrier_port,
            username,
            password,
        } => {
            let bridge = direct_bridge(
                config,
                DirectCarrier {
                    endpoint: resolve_endpoint(carrier_host, *carrier_port).await?,
                    auth: auth_from(username.as_deref(), password.as_deref()),
                    dns: dns_pool_config(&profile.dns),
                    doh_fallback: None, // Leak prevention forbids it.
                },
            )
            .await?;

            Ok((Carrier::External, bridge))
        }
        Transport::Slipstream {
            carrier_host,
            carrier_port,
            username,
            password,
        } => {
            let bridge = socks_carrier_bridge(
                config,
                SocksCarrier {
                    endpoint: resolve_endpoint(carrier_host, *carrier_port).await?,
                    auth: Auth {
                        username: username.clone(),
                        password: password.clone(),
                    },
                    dns: dns_pool_config(&profile.dns),
                },
            )
            .await?;

            Ok((Carrier::External, bridge))
        }
        Transport::Tor { socks_port } => {
            let bridge = tor_bridge(
                config,
                TorCarrier {
                    endpoint: SocketAddr::from(([127, 0, 0, 1], *socks_port)),
                    resolver: profile.dns.primary,
                },
            )
            .await?;

            Ok((Carrier::External, bridge))
        }
        Transport::Doh { url } => {
            let doh = doh_client::DohClient::new(url.clone(), config.protect.clone())
                .context("Invalid DoH configuration")?;

            let bridge = doh_bridge(config, Arc::new(doh)).await?;

            Ok((Carrier::External, bridge))
        }
        Transport::Ssh {
            host,
            port,
            username,
            password,
            key_path,
        } => {
            let transport = ssh::RusshTransport::connect(ssh::SshConfig {
                host: host.clone(),
                port: *port,
                username: username.clone(),
                password: password.clone(),
                key_path: key_path.clone(),
            })
            .await
            .context("SSH session failed")?;
            let transport = Arc::new(transport);

            let bridge = ssh_bridge(
                config,
                SshCarrier {
                    transport: Arc::clone(&transport) as Arc<dyn SshTransport>,
                    dns: dns_pool_config(&profile.dns),
                },
            )
            .await?;

            Ok((Carrier::Ssh(transport), bridge))
        }
    }
}

fn listen_addr(profile: &Profile) -> Result<SocketAddr> {
    let host: std::net::IpAddr = profile
        .listen_host
        .parse()
        .with_context(|| format!("listen host {} is not an IP", profile.listen_host))?;

    Ok(SocketAddr::new(host, profile.listen_port))
}

async fn resolve_endpoint(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("{host}:{port} resolved to nothing"))
}

fn auth_from(username: Option<&str>, password: Option<&str>) -> Option<Auth> {
    let username = username?;

    Some(Auth {
        username: username.to_owned(),
        password: password.unwrap_or_default().to_owned(),
    })
}

fn dns_pool_config(settings: &DnsSettings) -> dns_pool::DnsPoolConfig {
    dns_pool::DnsPoolConfig {
        workers: settings.workers,
        preferred_host: settings.primary,
        fallback_host: settings.fallback,
        ..Default::default()
    }
}
