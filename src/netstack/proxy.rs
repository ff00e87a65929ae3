//! Proxy Dialer Set (spec.md §3, §4.7): up to three dialers selected
//! per-flow by destination port, plus a per-host bypass filter.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use ipnet::IpNet;
use parking_lot::RwLock;

use crate::netstack::dns_reverse_map::DnsReverseMap;
use crate::netstack::error::{NetstackError, NetstackResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyKind {
    Socks,
    Http,
}

#[derive(Debug, Clone)]
pub struct ProxyDialer {
    pub kind: ProxyKind,
    pub addr: SocketAddr,
}

/// Config override, mirroring the "none / URL" choice in §4.7's
/// selection order.
#[derive(Debug, Clone)]
pub enum ConfigOverride {
    None,
    Url(ProxyDialer),
}

impl Default for ConfigOverride {
    fn default() -> Self {
        ConfigOverride::None
    }
}

/// System proxy settings, independently toggled per §4.7.
#[derive(Debug, Clone, Default)]
pub struct SystemProxySettings {
    pub socks: Option<ProxyDialer>,
    pub https: Option<ProxyDialer>,
    pub http: Option<ProxyDialer>,
}

/// One bypass-filter entry, after parsing a comma-separated source
/// string (§4.7: "IP literals, CIDR ranges..., `*.zone` suffixes and
/// exact hostnames").
#[derive(Debug, Clone)]
enum BypassEntry {
    Ip(IpAddr),
    Cidr(IpNet),
    ZoneSuffix(String),
    Hostname(String),
}

#[derive(Debug, Clone, Default)]
pub struct BypassFilter {
    entries: Vec<BypassEntry>,
}

impl BypassFilter {
    /// Parses a comma-separated bypass string. CIDR ranges are padded
    /// to canonical form (`10/8` expands to `10.0.0.0/8`) since users
    /// write shorthand prefixes.
    pub fn parse(source: &str) -> NetstackResult<Self> {
        let mut entries = Vec::new();
        for raw in source.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            entries.push(parse_entry(raw)?);
        }
        Ok(Self { entries })
    }

    /// Evaluates the filter. `reverse_hostname` is the name the DNS
    /// reverse map has recorded for `destination`, if any (§3: "the
    /// filter is evaluated against a reverse-DNS-resolved hostname
    /// when the flow destination is an IP literal that the core has
    /// previously mapped").
    pub fn matches(&self, destination: IpAddr, reverse_hostname: Option<&str>) -> bool {
        self.entries.iter().any(|entry| match entry {
            BypassEntry::Ip(ip) => *ip == destination,
            BypassEntry::Cidr(net) => net.contains(&destination),
            BypassEntry::ZoneSuffix(suffix) => reverse_hostname
                .map(|name| name.ends_with(suffix.as_str()))
                .unwrap_or(false),
            BypassEntry::Hostname(hostname) => {
                reverse_hostname.map(|name| name == hostname).unwrap_or(false)
            }
        })
    }
}

fn parse_entry(raw: &str) -> NetstackResult<BypassEntry> {
    if let Some(suffix) = raw.strip_prefix("*.") {
        return Ok(BypassEntry::ZoneSuffix(format!(".{suffix}")));
    }
    if let Ok(ip) = IpAddr::from_str(raw) {
        return Ok(BypassEntry::Ip(ip));
    }
    if let Some((prefix, bits)) = raw.split_once('/') {
        let canonical = canonicalize_cidr(prefix, bits)?;
        let net = IpNet::from_str(&canonical)
            .map_err(|e| NetstackError::Proxy(format!("invalid bypass CIDR {raw}: {e}")))?;
        return Ok(BypassEntry::Cidr(net));
    }
    Ok(BypassEntry::Hostname(raw.to_string()))
}

/// Pads a shorthand CIDR prefix (`"10"`, `"10.0"`) to a full dotted
/// quad before parsing, so `10/8` is accepted the same as `10.0.0.0/8`.
fn canonicalize_cidr(prefix: &str, bits: &str) -> NetstackResult<String> {
    if prefix.contains(':') {
        return Ok(format!("{prefix}/{bits}"));
    }
    let mut octets: Vec<&str> = prefix.split('.').collect();
    if octets.len() > 4 {
        return Err(NetstackError::Proxy(format!("invalid bypass CIDR prefix {prefix}")));
    }
    while octets.len() < 4 {
        octets.push("0");
    }
    Ok(format!("{}/{bits}", octets.join(".")))
}

/// Up to three dialers selected by destination port, rebuilt on
/// configuration change (debounced upstream by the caller per §3's
/// lifecycle note).
pub struct ProxyDialerSet {
    inner: RwLock<ProxyDialerSetInner>,
}

struct ProxyDialerSetInner {
    config_override: ConfigOverride,
    system: SystemProxySettings,
    bypass: BypassFilter,
}

impl ProxyDialerSet {
    pub fn new(config_override: ConfigOverride, system: SystemProxySettings, bypass: BypassFilter) -> Self {
        Self {
            inner: RwLock::new(ProxyDialerSetInner {
                config_override,
                system,
                bypass,
            }),
        }
    }

    pub fn replace(&self, config_override: ConfigOverride, system: SystemProxySettings, bypass: BypassFilter) {
        let mut inner = self.inner.write();
        inner.config_override = config_override;
        inner.system = system;
        inner.bypass = bypass;
    }

    /// Selection order per §4.7: config override first, then system
    /// SOCKS/HTTPS/HTTP, then direct. The bypass filter is consulted
    /// after this selection and forces direct dial on match.
    pub fn select(&self, destination: SocketAddr, reverse_map: &DnsReverseMap) -> Option<ProxyDialer> {
        let inner = self.inner.read();

        let reverse_hostname = reverse_map.lookup(destination.ip());
        if inner.bypass.matches(destination.ip(), reverse_hostname.as_deref()) {
            return None;
        }

        match &inner.config_override {
            ConfigOverride::Url(dialer) => {
                return match dialer.kind {
                    ProxyKind::Socks => Some(dialer.clone()),
                    ProxyKind::Http => {
                        if destination.port() == 80 || destination.port() == 443 {
                            Some(dialer.clone())
                        } else {
                            None
                        }
                    }
                };
            }
            ConfigOverride::None => {}
        }

        if let Some(dialer) = &inner.system.socks {
            return Some(dialer.clone());
        }
        if destination.port() == 443 {
            if let Some(dialer) = &inner.system.https {
                return Some(dialer.clone());
            }
        }
        if destination.port() == 80 {
            if let Some(dialer) = &inner.system.http {
                return Some(dialer.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reverse_map_with(ip: IpAddr, name: &str) -> DnsReverseMap {
        let map = DnsReverseMap::with_capacity(8);
        map.record(ip, name.to_string());
        map
    }

    #[test]
    fn spec_bypass_string_parses_and_matches() {
        let filter = BypassFilter::parse("10.0.0.0/8,*.corp.example.com,192.168.1.1").unwrap();

        assert!(filter.matches("10.1.2.3".parse().unwrap(), None));
        assert!(filter.matches("192.168.1.1".parse().unwrap(), None));
        assert!(!filter.matches("192.168.1.2".parse().unwrap(), None));

        let corp_ip: IpAddr = "203.0.113.9".parse().unwrap();
        assert!(filter.matches(corp_ip, Some("build.corp.example.com")));
        assert!(!filter.matches(corp_ip, Some("build.example.com")));
    }

    #[test]
    fn shorthand_cidr_prefix_is_padded() {
        let filter = BypassFilter::parse("10/8").unwrap();
        assert!(filter.matches("10.255.255.1".parse().unwrap(), None));
        assert!(!filter.matches("11.0.0.1".parse().unwrap(), None));
    }

    #[test]
    fn exact_hostname_entry_requires_exact_match() {
        let filter = BypassFilter::parse("build.example.com").unwrap();
        assert!(filter.matches("203.0.113.9".parse().unwrap(), Some("build.example.com")));
        assert!(!filter.matches("203.0.113.9".parse().unwrap(), Some("other.example.com")));
    }

    #[test]
    fn selection_prefers_config_override_url() {
        let dialer = ProxyDialer {
            kind: ProxyKind::Socks,
            addr: "127.0.0.1:1080".parse().unwrap(),
        };
        let set = ProxyDialerSet::new(
            ConfigOverride::Url(dialer.clone()),
            SystemProxySettings::default(),
            BypassFilter::default(),
        );
        let reverse_map = DnsReverseMap::with_capacity(8);
        let selected = set.select("93.184.216.34:22".parse().unwrap(), &reverse_map);
        assert_eq!(selected.unwrap().addr, dialer.addr);
    }

    #[test]
    fn http_override_only_applies_to_80_and_443() {
        let dialer = ProxyDialer {
            kind: ProxyKind::Http,
            addr: "127.0.0.1:8080".parse().unwrap(),
        };
        let set = ProxyDialerSet::new(
            ConfigOverride::Url(dialer),
            SystemProxySettings::default(),
            BypassFilter::default(),
        );
        let reverse_map = DnsReverseMap::with_capacity(8);
        assert!(set.select("93.184.216.34:22".parse().unwrap(), &reverse_map).is_none());
        assert!(set.select("93.184.216.34:443".parse().unwrap(), &reverse_map).is_some());
    }

    #[test]
    fn bypass_overrides_every_dialer_choice() {
        let dialer = ProxyDialer {
            kind: ProxyKind::Socks,
            addr: "127.0.0.1:1080".parse().unwrap(),
        };
        let bypass = BypassFilter::parse("93.184.216.34").unwrap();
        let set = ProxyDialerSet::new(ConfigOverride::Url(dialer), SystemProxySettings::default(), bypass);
        let reverse_map = DnsReverseMap::with_capacity(8);
        assert!(set.select("93.184.216.34:443".parse().unwrap(), &reverse_map).is_none());
    }

    #[test]
    fn reverse_map_round_trip_used_by_zone_suffix() {
        let map = reverse_map_with("203.0.113.9".parse().unwrap(), "build.corp.example.com");
        assert_eq!(map.lookup("203.0.113.9".parse().unwrap()).as_deref(), Some("build.corp.example.com"));
    }
}
