//! CIDR parsing and subnet-key helpers.
//!
//! The trust filter needs two distinct notions of "network": a configured
//! trust block (arbitrary prefix length, IPv4 or IPv6) and a rate-limiter
//! aggregation key (a fixed prefix width, /24 for IPv4 by convention, /64
//! for IPv6 per this implementation's choice — see `SPEC_FULL.md` §5).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// A parsed CIDR network block, either IPv4 or IPv6.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CidrBlock {
    /// An IPv4 network.
    V4 { network: Ipv4Addr, prefix: u8 },
    /// An IPv6 network.
    V6 { network: Ipv6Addr, prefix: u8 },
}

/// Error parsing a CIDR string.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[error("invalid CIDR network: '{0}'")]
pub struct CidrParseError(pub String);

impl FromStr for CidrBlock {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, prefix_part) = s
            .split_once('/')
            .ok_or_else(|| CidrParseError(s.to_string()))?;
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| CidrParseError(s.to_string()))?;
        let prefix: u8 = prefix_part
            .parse()
            .map_err(|_| CidrParseError(s.to_string()))?;

        match addr {
            IpAddr::V4(v4) => {
                if prefix > 32 {
                    return Err(CidrParseError(s.to_string()));
                }
                Ok(CidrBlock::V4 {
                    network: mask_v4(v4, prefix),
                    prefix,
                })
            }
            IpAddr::V6(v6) => {
                if prefix > 128 {
                    return Err(CidrParseError(s.to_string()));
                }
                Ok(CidrBlock::V6 {
                    network: mask_v6(v6, prefix),
                    prefix,
                })
            }
        }
    }
}

impl CidrBlock {
    /// Whether `addr` falls inside this network.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self, addr) {
            (CidrBlock::V4 { network, prefix }, IpAddr::V4(addr)) => {
                mask_v4(*addr, *prefix) == *network
            }
            (CidrBlock::V6 { network, prefix }, IpAddr::V6(addr)) => {
                mask_v6(*addr, *prefix) == *network
            }
            _ => false,
        }
    }
}

fn mask_v4(addr: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    Ipv4Addr::from(bits & mask)
}

fn mask_v6(addr: Ipv6Addr, prefix: u8) -> Ipv6Addr {
    let bits = u128::from(addr);
    let mask = if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix)
    };
    Ipv6Addr::from(bits & mask)
}

/// Default subnet aggregation width for IPv4 rate-limiter buckets.
pub const DEFAULT_SUBNET_PREFIX_V4: u8 = 24;
/// Default subnet aggregation width for IPv6 rate-limiter buckets.
///
/// Earlier IPv4-only deployments of this kind of rate limiter aggregated
/// on /24s; IPv6 aggregation width has no equivalent convention, so this
/// picks /64 (one allocated subnet) as an explicit, documented default
/// rather than guessing silently.
pub const DEFAULT_SUBNET_PREFIX_V6: u8 = 64;

/// Computes the canonical subnet key used to aggregate rate-limiter
/// attempts for `addr`, at the given prefix width.
///
/// This is cheap enough to inline for one connection attempt, but callers
/// batching many addresses at once should still dispatch it through
/// `tokio::task::spawn_blocking` rather than running it inline on the event
/// loop.
pub fn subnet_key(addr: IpAddr, prefix_v4: u8, prefix_v6: u8) -> String {
    match addr {
        IpAddr::V4(v4) => format!("{}/{}", mask_v4(v4, prefix_v4), prefix_v4),
        IpAddr::V6(v6) => format!("{}/{}", mask_v6(v6, prefix_v6), prefix_v6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_cidr() {
        let block: CidrBlock = "10.0.0.0/8".parse().unwrap();
        assert!(block.contains(&"10.1.2.3".parse().unwrap()));
        assert!(!block.contains(&"11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn parses_v6_cidr() {
        let block: CidrBlock = "fe80::/10".parse().unwrap();
        assert!(block.contains(&"fe80::1".parse().unwrap()));
        assert!(!block.contains(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("not-a-cidr".parse::<CidrBlock>().is_err());
        assert!("10.0.0.0/33".parse::<CidrBlock>().is_err());
    }

    #[test]
    fn subnet_key_groups_same_24() {
        let a = subnet_key("10.0.0.1".parse().unwrap(), 24, 64);
        let b = subnet_key("10.0.0.254".parse().unwrap(), 24, 64);
        assert_eq!(a, b);
        let c = subnet_key("10.0.1.1".parse().unwrap(), 24, 64);
        assert_ne!(a, c);
    }

    #[test]
    fn subnet_key_v6_uses_prefix() {
        let a = subnet_key("2001:db8::1".parse().unwrap(), 24, 64);
        let b = subnet_key("2001:db8::ffff".parse().unwrap(), 24, 64);
        assert_eq!(a, b);
    }
}
