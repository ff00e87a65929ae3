//! DNS reverse map (SPEC_FULL.md supplemented feature): a bounded LRU
//! that the bypass filter and HTTP reverse proxy both read, recording
//! the hostname last resolved to an IP so later flows against that IP
//! literal can still match a `.zone`/hostname bypass entry.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use parking_lot::RwLock;

pub struct DnsReverseMap {
    capacity: usize,
    inner: RwLock<Inner>,
}

struct Inner {
    names: HashMap<IpAddr, String>,
    order: VecDeque<IpAddr>,
}

impl DnsReverseMap {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Inner {
                names: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Records that `ip` last resolved from `hostname`. Evicts the
    /// oldest entry if the map is at capacity and `ip` is new.
    pub fn record(&self, ip: IpAddr, hostname: String) {
        let mut inner = self.inner.write();
        if inner.names.insert(ip, hostname).is_none() {
            inner.order.push_back(ip);
            if inner.order.len() > self.capacity {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.names.remove(&evicted);
                }
            }
        }
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<String> {
        self.inner.read().names.get(&ip).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_looks_up() {
        let map = DnsReverseMap::with_capacity(4);
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        map.record(ip, "build.example.com".to_string());
        assert_eq!(map.lookup(ip).as_deref(), Some("build.example.com"));
    }

    #[test]
    fn unknown_ip_returns_none() {
        let map = DnsReverseMap::with_capacity(4);
        assert_eq!(map.lookup("10.0.0.1".parse().unwrap()), None);
    }

    #[test]
    fn evicts_oldest_entry_past_capacity() {
        let map = DnsReverseMap::with_capacity(2);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        let c: IpAddr = "10.0.0.3".parse().unwrap();
        map.record(a, "a.example.com".to_string());
        map.record(b, "b.example.com".to_string());
        map.record(c, "c.example.com".to_string());

        assert_eq!(map.lookup(a), None);
        assert_eq!(map.len(), 2);
        assert!(map.lookup(b).is_some());
        assert!(map.lookup(c).is_some());
    }

    #[test]
    fn re_recording_an_ip_updates_name_without_growing() {
        let map = DnsReverseMap::with_capacity(4);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        map.record(ip, "old.example.com".to_string());
        map.record(ip, "new.example.com".to_string());
        assert_eq!(map.lookup(ip).as_deref(), Some("new.example.com"));
        assert_eq!(map.len(), 1);
    }
}
