#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Whether matching hosts are routed around or through the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
    /// A matching host bypasses the tunnel.
    Bypass,
    /// Only matching hosts use the tunnel; everything else bypasses.
    OnlyVpn,
}

/// Immutable router configuration, fixed at connect time.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub enabled: bool,
    pub mode: RouterMode,
    /// Suffix patterns, e.g. `example.com` matches itself and `*.example.com`.
    pub domain_rules: Vec<String>,
    pub geo_enabled: bool,
    /// Inclusive IPv4 ranges of the geo database.
    pub geo_ranges: Vec<(Ipv4Addr, Ipv4Addr)>,
    /// Domain entries of the geo database; entries starting with `.` are
    /// TLD rules.
    pub geo_domains: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: RouterMode::Bypass,
            domain_rules: Vec::new(),
            geo_enabled: false,
            geo_ranges: Vec::new(),
            geo_domains: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("geo range {0} - {1} is inverted")]
    InvertedRange(Ipv4Addr, Ipv4Addr),
}

/// Decides, per flow, whether to open a direct socket to the destination
/// ("bypass") or send it through the active bridge.
pub struct Router {
    enabled: bool,
    mode: RouterMode,
    domain_rules: Vec<String>,
    geo_enabled: bool,
    /// Parallel sorted arrays of inclusive range bounds.
    range_starts: Vec<u32>,
    range_ends: Vec<u32>,
    geo_domains: HashSet<String>,
    geo_tlds: HashSet<String>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Result<Self, RouterError> {
        let mut ranges = Vec::with_capacity(config.geo_ranges.len());

        for (start, end) in config.geo_ranges {
            let (start, end) = (u32::from(start), u32::from(end));

            if start > end {
                return Err(RouterError::InvertedRange(start.into(), end.into()));
            }

            ranges.push((start, end));
        }

        ranges.sort_unstable();

        let mut geo_domains = HashSet::new();
        let mut geo_tlds = HashSet::new();

        for entry in config.geo_domains {
            let entry = normalize(&entry);

            match entry.strip_prefix('.') {
                Some(tld) => geo_tlds.insert(tld.to_owned()),
                None => geo_domains.insert(entry),
            };
        }

        Ok(Self {
            enabled: config.enabled,
            mode: config.mode,
            domain_rules: config
                .domain_rules
                .into_iter()
                .map(|r| normalize(&r))
                .collect(),
            geo_enabled: config.geo_enabled,
            range_starts: ranges.iter().map(|(s, _)| *s).collect(),
            range_ends: ranges.iter().map(|(_, e)| *e).collect(),
            geo_domains,
            geo_tlds,
        })
    }

    /// Whether any bypass rule is active at all. When `false`, callers can
    /// skip host recovery entirely.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// `true` iff the flow towards `host` must go to a direct socket instead
    /// of the carrier. `host` is either a name (possibly sniffed) or an IP
    /// literal.
    pub fn should_bypass(&self, host: &str) -> bool {
        if !self.enabled {
            return false;
        }

        let host = normalize(host);

        if !self.domain_rules.is_empty() {
            let matched = self.domain_rules.iter().any(|rule| suffix_match(&host, rule));

            match self.mode {
                RouterMode::Bypass if matched => return true,
                RouterMode::OnlyVpn if !matched => return true,
                RouterMode::Bypass | RouterMode::OnlyVpn => {}
            }
        }

        if !self.geo_enabled {
            return false;
        }

        match parse_ip_literal(&host) {
            Some(IpLiteral::V4(addr)) => self.geo_range_contains(addr.into()),
            // No IPv6 geo data; never bypassed.
            Some(IpLiteral::V6) => false,
            None => self.geo_domain_match(&host),
        }
    }

    fn geo_domain_match(&self, host: &str) -> bool {
        if self
            .geo_domains
            .iter()
            .any(|entry| suffix_match(host, entry))
        {
            return true;
        }

        self.geo_tlds
            .iter()
            .any(|tld| host == tld || host.ends_with(&format!(".{tld}")))
    }

    fn geo_range_contains(&self, ip: u32) -> bool {
        let idx = match self.range_starts.partition_point(|start| *start <= ip) {
            0 => return false,
            n => n - 1,
        };

        ip <= self.range_ends[idx]
    }
}

/// A host equals the rule or ends with `"." + rule`.
fn suffix_match(host: &str, rule: &str) -> bool {
    host == rule || (host.len() > rule.len() && host.ends_with(rule) && {
        let boundary = host.len() - rule.len() - 1;
        host.as_bytes()[boundary] == b'.'
    })
}

fn normalize(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

enum IpLiteral {
    V4(Ipv4Addr),
    V6,
}

/// IPv4 iff the host is four dot-separated groups of 1-3 digits; anything
/// containing a colon is treated as IPv6.
fn parse_ip_literal(host: &str) -> Option<IpLiteral> {
    if host.contains(':') {
        return Some(IpLiteral::V6);
    }

    let mut groups = 0;

    for group in host.split('.') {
        if group.is_empty() || group.len() > 3 || !group.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        groups += 1;
    }

    if groups != 4 {
        return None;
    }

    // The shape matched; out-of-range octets (e.g. 999) are not addresses.
    host.parse().ok().map(IpLiteral::V4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn router(config: RouterConfig) -> Router {
        Router::new(config).unwrap()
    }

    fn enabled() -> RouterConfig {
        RouterConfig {
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn disabled_router_never_bypasses() {
        let r = router(RouterConfig {
            enabled: false,
            mode: RouterMode::Bypass,
            domain_rules: vec!["example.com".into()],
            ..Default::default()
        });

        assert!(!r.should_bypass("example.com"));
    }

    #[test_case("example.com", true; "exact")]
    #[test_case("www.example.com", true; "subdomain")]
    #[test_case("Example.COM.", true; "case and trailing dot")]
    #[test_case("notexample.com", false; "suffix without dot boundary")]
    #[test_case("example.org", false; "other domain")]
    fn bypass_mode_suffix_rules(host: &str, bypass: bool) {
        let r = router(RouterConfig {
            mode: RouterMode::Bypass,
            domain_rules: vec!["example.com".into()],
            ..enabled()
        });

        assert_eq!(r.should_bypass(host), bypass);
    }

    #[test]
    fn only_vpn_mode_inverts_the_match() {
        let r = router(RouterConfig {
            mode: RouterMode::OnlyVpn,
            domain_rules: vec!["example.com".into()],
            ..enabled()
        });

        assert!(!r.should_bypass("www.example.com"));
        assert!(r.should_bypass("example.org"));
    }

    #[test]
    fn geo_domains_and_tld_rules() {
        let r = router(RouterConfig {
            geo_enabled: true,
            geo_domains: vec!["digikala.com".into(), ".ir".into()],
            ..enabled()
        });

        assert!(r.should_bypass("digikala.com"));
        assert!(r.should_bypass("www.digikala.com"));
        assert!(r.should_bypass("example.ir"));
        assert!(r.should_bypass("www.example.ir"));
        assert!(!r.should_bypass("example.com"));
    }

    #[test]
    fn geo_ranges_binary_search() {
        let r = router(RouterConfig {
            geo_enabled: true,
            geo_ranges: vec![
                (Ipv4Addr::new(5, 160, 0, 0), Ipv4Addr::new(5, 160, 255, 255)),
                (Ipv4Addr::new(2, 176, 0, 0), Ipv4Addr::new(2, 191, 255, 255)),
            ],
            ..enabled()
        });

        assert!(r.should_bypass("5.160.12.34"));
        assert!(r.should_bypass("2.176.0.0"));
        assert!(r.should_bypass("2.191.255.255"));
        assert!(!r.should_bypass("5.161.0.0"));
        assert!(!r.should_bypass("1.1.1.1"));
    }

    #[test]
    fn ipv6_literals_never_geo_match() {
        let r = router(RouterConfig {
            geo_enabled: true,
            geo_ranges: vec![(Ipv4Addr::new(0, 0, 0, 0), Ipv4Addr::new(255, 255, 255, 255))],
            ..enabled()
        });

        assert!(!r.should_bypass("2001:db8::1"));
    }

    #[test]
    fn domain_rules_fall_through_to_geo() {
        let r = router(RouterConfig {
            mode: RouterMode::Bypass,
            domain_rules: vec!["example.com".into()],
            geo_enabled: true,
            geo_domains: vec![".ir".into()],
            ..enabled()
        });

        // Not matched by the domain rules, still bypassed by geo.
        assert!(r.should_bypass("example.ir"));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let result = Router::new(RouterConfig {
            geo_ranges: vec![(Ipv4Addr::new(9, 0, 0, 0), Ipv4Addr::new(8, 0, 0, 0))],
            ..enabled()
        });

        assert!(result.is_err());
    }

    #[test_case("1.2.3.4", true)]
    #[test_case("999.2.3.4", false)]
    #[test_case("1.2.3", false)]
    #[test_case("1.2.3.4.5", false)]
    #[test_case("a.b.c.d", false)]
    fn ipv4_literal_shape(host: &str, is_v4: bool) {
        assert_eq!(
            matches!(parse_ip_literal(host), Some(IpLiteral::V4(_))),
            is_v4
        );
    }
}
