// SPDX-License-Identifier: MIT OR Apache-2.0
//! Trusted-proxy CIDR matching and client IP resolution.

use std::net::IpAddr;
use std::str::FromStr;

/// A parsed CIDR block (`10.0.0.0/8`, `fd00::/8`, or a bare address).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Whether `ip` falls inside this block.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let net = u32::from(net);
                let ip = u32::from(ip);
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix))
                };
                (net & mask) == (ip & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let net = u128::from(net);
                let ip = u128::from(ip);
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.prefix))
                };
                (net & mask) == (ip & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let prefix: u8 = prefix.parse().map_err(|_| format!("bad prefix in {s}"))?;
                (addr, Some(prefix))
            }
            None => (s, None),
        };
        let network: IpAddr = addr.parse().map_err(|_| format!("bad address in {s}"))?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = prefix.unwrap_or(max);
        if prefix > max {
            return Err(format!("prefix too long in {s}"));
        }
        Ok(Self { network, prefix })
    }
}

/// Resolve the effective client IP for rate-limiting.
///
/// `X-Forwarded-For` is honored only when the immediate peer is inside one
/// of the trusted proxy blocks; the leftmost parseable entry wins. In every
/// other case the peer address is the client.
#[must_use]
pub fn resolve_client_ip(peer: IpAddr, forwarded_for: Option<&str>, trusted: &[Cidr]) -> IpAddr {
    let peer_trusted = trusted.iter().any(|c| c.contains(peer));
    if !peer_trusted {
        return peer;
    }
    let Some(header) = forwarded_for else {
        return peer;
    };
    header
        .split(',')
        .map(str::trim)
        .find_map(|entry| entry.parse::<IpAddr>().ok())
        .unwrap_or(peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Cidr {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn v4_block_membership() {
        let block = cidr("10.0.0.0/8");
        assert!(block.contains(ip("10.1.2.3")));
        assert!(!block.contains(ip("11.0.0.1")));
        assert!(!block.contains(ip("::1")));
    }

    #[test]
    fn bare_address_is_slash_full() {
        let block = cidr("192.168.1.5");
        assert!(block.contains(ip("192.168.1.5")));
        assert!(!block.contains(ip("192.168.1.6")));
    }

    #[test]
    fn v6_block_membership() {
        let block = cidr("fd00::/8");
        assert!(block.contains(ip("fd12:3456::1")));
        assert!(!block.contains(ip("fe80::1")));
    }

    #[test]
    fn zero_prefix_matches_everything() {
        let block = cidr("0.0.0.0/0");
        assert!(block.contains(ip("8.8.8.8")));
    }

    #[test]
    fn invalid_inputs_rejected() {
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("nonsense".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
    }

    #[test]
    fn xff_ignored_from_untrusted_peer() {
        let trusted = vec![cidr("10.0.0.0/8")];
        let client = resolve_client_ip(ip("203.0.113.9"), Some("198.51.100.7"), &trusted);
        assert_eq!(client, ip("203.0.113.9"));
    }

    #[test]
    fn xff_honored_from_trusted_peer() {
        let trusted = vec![cidr("10.0.0.0/8")];
        let client = resolve_client_ip(
            ip("10.0.0.2"),
            Some("198.51.100.7, 10.0.0.2"),
            &trusted,
        );
        assert_eq!(client, ip("198.51.100.7"));
    }

    #[test]
    fn malformed_xff_falls_back_to_peer() {
        let trusted = vec![cidr("10.0.0.0/8")];
        let client = resolve_client_ip(ip("10.0.0.2"), Some("not-an-ip"), &trusted);
        assert_eq!(client, ip("10.0.0.2"));
    }
}
