use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub type ProfileId = String;

/// Everything needed to bring one tunnel up, loaded from a JSON file and
/// immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    pub name: String,

    /// Where the bridge's SOCKS5 endpoint listens for the shim.
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    pub listen_port: u16,

    pub transport: Transport,

    #[serde(default)]
    pub router: RouterSettings,

    #[serde(default)]
    pub dns: DnsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transport {
    /// DNS-tunnel style: a raw-TCP carrier endpoint terminating at a remote
    /// SOCKS5.
    Dnstt {
        carrier_host: String,
        carrier_port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    /// SSH direct-tcpip channels.
    Ssh {
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        username: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        key_path: Option<PathBuf>,
    },
    /// DNS-over-HTTPS for DNS; direct sockets for everything else.
    Doh { url: url::Url },
    /// A local Tor SOCKS5 endpoint (pluggable-transport stack in front).
    Tor {
        #[serde(default = "default_tor_port")]
        socks_port: u16,
    },
    /// Slipstream style: a covert carrier fronting a remote SOCKS5 that
    /// requires user/pass.
    Slipstream {
        carrier_host: String,
        carrier_port: u16,
        username: String,
        password: String,
    },
}

impl Transport {
    pub fn label(&self) -> &'static str {
        match self {
            Transport::Dnstt { .. } => "dnstt",
            Transport::Ssh { .. } => "ssh",
            Transport::Doh { .. } => "doh",
            Transport::Tor { .. } => "tor",
            Transport::Slipstream { .. } => "slipstream",
        }
    }

    /// Whether the last-resort DoH fallback of the DNS pipeline is allowed.
    ///
    /// DNS-tunnel and SSH profiles forbid it: their threat model requires
    /// that no DNS query leaves except through the carrier's own framing.
    pub fn permits_doh_fallback(&self) -> bool {
        match self {
            Transport::Doh { .. } | Transport::Tor { .. } => true,
            Transport::Dnstt { .. } | Transport::Ssh { .. } | Transport::Slipstream { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RouterMode {
    #[default]
    Bypass,
    OnlyVpn,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouterSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: RouterMode,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub geo_enabled: bool,
    #[serde(default)]
    pub geo_ranges: Vec<(Ipv4Addr, Ipv4Addr)>,
    #[serde(default)]
    pub geo_domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsSettings {
    #[serde(default = "default_primary_dns")]
    pub primary: Ipv4Addr,
    #[serde(default = "default_fallback_dns")]
    pub fallback: Ipv4Addr,
    /// Number of persistent DNS-over-TCP workers.
    #[serde(default = "default_dns_workers")]
    pub workers: usize,
    /// Route UDP:53 over a direct protected socket instead of the bridge.
    #[serde(default)]
    pub direct: bool,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            primary: default_primary_dns(),
            fallback: default_fallback_dns(),
            workers: default_dns_workers(),
            direct: false,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("profile id is empty")]
    EmptyId,
    #[error("listen port is 0")]
    ZeroListenPort,
    #[error("{0} is empty")]
    EmptyField(&'static str),
    #[error("DNS worker count must be between 1 and 64")]
    BadWorkerCount,
    #[error("DoH url must use https")]
    PlainTextDoh,
}

impl Profile {
    /// Validates the configuration surface before any socket is opened.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.id.is_empty() {
            return Err(ProfileError::EmptyId);
        }

        if self.listen_port == 0 {
            return Err(ProfileError::ZeroListenPort);
        }

        if !(1..=64).contains(&self.dns.workers) {
            return Err(ProfileError::BadWorkerCount);
        }

        match &self.transport {
            Transport::Dnstt { carrier_host, .. } | Transport::Slipstream { carrier_host, .. }
                if carrier_host.is_empty() =>
            {
                Err(ProfileError::EmptyField("carrier host"))
            }
            Transport::Ssh { host, .. } if host.is_empty() => {
                Err(ProfileError::EmptyField("ssh host"))
            }
            Transport::Ssh { username, .. } if username.is_empty() => {
                Err(ProfileError::EmptyField("ssh username"))
            }
            Transport::Ssh {
                password: None,
                key_path: None,
                ..
            } => Err(ProfileError::EmptyField("ssh credentials")),
            Transport::Doh { url } if url.scheme() != "https" => Err(ProfileError::PlainTextDoh),
            _ => Ok(()),
        }
    }
}

/// The only state persisted across runs: the last successfully connected
/// profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastConnection {
    pub profile_id: ProfileId,
}

fn default_listen_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_tor_port() -> u16 {
    9050
}

fn default_primary_dns() -> Ipv4Addr {
    Ipv4Addr::new(8, 8, 8, 8)
}

fn default_fallback_dns() -> Ipv4Addr {
    Ipv4Addr::new(1, 1, 1, 1)
}

fn default_dns_workers() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(transport: Transport) -> Profile {
        Profile {
            id: "p1".into(),
            name: "test".into(),
            listen_host: default_listen_host(),
            listen_port: 1080,
            transport,
            router: RouterSettings::default(),
            dns: DnsSettings::default(),
        }
    }

    #[test]
    fn dnstt_profile_round_trips_through_json() {
        let profile = minimal(Transport::Dnstt {
            carrier_host: "127.0.0.1".into(),
            carrier_port: 7000,
            username: None,
            password: None,
        });

        let json = serde_json::to_string(&profile).unwrap();
        let back: Profile = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, "p1");
        assert_eq!(back.transport.label(), "dnstt");
        assert_eq!(back.dns.workers, 10);
    }

    #[test]
    fn ssh_without_credentials_is_invalid() {
        let profile = minimal(Transport::Ssh {
            host: "example.com".into(),
            port: 22,
            username: "u".into(),
            password: None,
            key_path: None,
        });

        assert_eq!(
            profile.validate(),
            Err(ProfileError::EmptyField("ssh credentials"))
        );
    }

    #[test]
    fn leak_prevention_flag_per_transport() {
        assert!(!minimal(Transport::Dnstt {
            carrier_host: "h".into(),
            carrier_port: 1,
            username: None,
            password: None,
        })
        .transport
        .permits_doh_fallback());

        assert!(minimal(Transport::Tor { socks_port: 9050 })
            .transport
            .permits_doh_fallback());
    }

    #[test]
    fn doh_must_be_https() {
        let profile = minimal(Transport::Doh {
            url: "http://dns.example/dns-query".parse().unwrap(),
        });

        assert_eq!(profile.validate(), Err(ProfileError::PlainTextDoh));
    }
}
