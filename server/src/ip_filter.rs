//! IP allow-list for the control upgrade.
//!
//! Parses the `IP_WHITELIST` CIDR list and matches the underlying TCP
//! peer. An empty list allows everyone.

use std::net::{IpAddr, Ipv4Addr};

/// A parsed IPv4 CIDR range.
#[derive(Debug, Clone)]
pub struct CidrRange {
    network: u32,
    mask: u32,
}

impl CidrRange {
    /// Parse `"192.168.1.0/24"`; a bare address is treated as `/32`.
    pub fn parse(cidr: &str) -> Option<Self> {
        let (addr, prefix_len) = match cidr.split_once('/') {
            Some((addr, len)) => (addr, len.parse::<u32>().ok()?),
            None => (cidr, 32),
        };

        let ip: Ipv4Addr = addr.trim().parse().ok()?;
        if prefix_len > 32 {
            return None;
        }

        let mask = if prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - prefix_len)
        };

        Some(CidrRange {
            network: u32::from(ip) & mask,
            mask,
        })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => (u32::from(v4) & self.mask) == self.network,
            // The allow-list grammar is IPv4; v6 peers only pass an empty list.
            IpAddr::V6(_) => false,
        }
    }
}

/// Server-wide allow-list over the upgrade peer address.
#[derive(Debug, Clone, Default)]
pub struct IpAllowList {
    ranges: Vec<CidrRange>,
}

impl IpAllowList {
    pub fn from_strings(entries: &[String]) -> Self {
        Self {
            ranges: entries.iter().filter_map(|s| CidrRange::parse(s)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        self.ranges.iter().any(|cidr| cidr.contains(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse() {
        let cidr = CidrRange::parse("192.168.1.0/24").unwrap();
        assert!(cidr.contains("192.168.1.100".parse().unwrap()));
        assert!(!cidr.contains("192.168.2.1".parse().unwrap()));
        assert!(cidr.contains("192.168.1.0".parse().unwrap()));
        assert!(cidr.contains("192.168.1.255".parse().unwrap()));
    }

    #[test]
    fn test_bare_address_is_slash_32() {
        let cidr = CidrRange::parse("10.0.0.7").unwrap();
        assert!(cidr.contains("10.0.0.7".parse().unwrap()));
        assert!(!cidr.contains("10.0.0.8".parse().unwrap()));
    }

    #[test]
    fn test_allow_list() {
        let list = IpAllowList::from_strings(&["192.168.1.0/24".to_string(), "10.0.0.7".to_string()]);
        assert!(list.is_allowed("192.168.1.50".parse().unwrap()));
        assert!(list.is_allowed("10.0.0.7".parse().unwrap()));
        assert!(!list.is_allowed("10.0.0.8".parse().unwrap()));
    }

    #[test]
    fn test_empty_list_allows_all() {
        let list = IpAllowList::from_strings(&[]);
        assert!(list.is_allowed("1.2.3.4".parse().unwrap()));
        assert!(list.is_empty());
    }
}
