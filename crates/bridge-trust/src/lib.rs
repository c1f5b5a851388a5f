#![deny(unsafe_code)]

//! # Overview
//!
//! `bridge_trust` implements the trust classifier and the connection-attempt
//! rate limiter consulted before any engine process is touched. The two
//! pieces are deliberately kept in one crate because they share the same
//! notion of "address" and
//! are always consulted together from the client bridge's trust gate, but
//! [`TrustFilter::classify`] has no side effects while [`ConnectionLedger`]
//! is the only part of this crate that mutates shared state.
//!
//! # Invariants
//!
//! - `classify` never mutates anything; it is pure with respect to its
//!   configured address/network lists and the runtime auto-trust set.
//! - [`ConnectionLedger`] prunes and appends under its per-key shard lock;
//!   nothing awaits while a shard is held, so callers remain free to invoke
//!   a firewall collaborator afterward without holding it across an `await`
//!   point.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;

use bridge_core::net::{self, CidrBlock, DEFAULT_SUBNET_PREFIX_V4, DEFAULT_SUBNET_PREFIX_V6};

/// Static, at-startup trust configuration: exact addresses and CIDR blocks.
#[derive(Clone, Debug, Default)]
pub struct TrustConfig {
    /// Exact addresses that are always trusted.
    pub trusted_addresses: HashSet<IpAddr>,
    /// CIDR blocks whose members are always trusted.
    pub trusted_networks: Vec<CidrBlock>,
}

/// Classifies peer addresses and tracks the runtime auto-trust set.
///
/// Trust is the union of the configured exact addresses, the configured
/// network blocks, and the runtime auto-trust set.
pub struct TrustFilter {
    config: TrustConfig,
    auto_trusted: Mutex<HashSet<IpAddr>>,
}

impl TrustFilter {
    /// Builds a filter over the given static configuration. The auto-trust
    /// set starts empty; it is process-lifetime only and never persisted.
    pub fn new(config: TrustConfig) -> Self {
        Self {
            config,
            auto_trusted: Mutex::new(HashSet::new()),
        }
    }

    /// Returns whether `addr` is trusted. Has no side effects.
    pub fn classify(&self, addr: IpAddr) -> bool {
        if self.config.trusted_addresses.contains(&addr) {
            return true;
        }
        if self
            .config
            .trusted_networks
            .iter()
            .any(|net| net.contains(&addr))
        {
            return true;
        }
        self.auto_trusted
            .lock()
            .expect("auto-trust lock poisoned")
            .contains(&addr)
    }

    /// Adds `addr` to the runtime auto-trust set. Idempotent: adding the
    /// same address twice leaves the set cardinality unchanged.
    pub fn add_auto_trust(&self, addr: IpAddr) {
        let newly_inserted = self
            .auto_trusted
            .lock()
            .expect("auto-trust lock poisoned")
            .insert(addr);
        if newly_inserted {
            tracing::warn!(
                %addr,
                "AUTO-TRUST: address added to the runtime trusted set for this process's lifetime"
            );
        }
    }
}

/// Configured thresholds and retention for the connection-attempt ledger.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    /// Entries older than this are pruned lazily on each update.
    pub retention: Duration,
    /// Per-address threshold; exceeding it clears that address's entries.
    pub max_per_address: usize,
    /// Per-/24-subnet (or configured IPv6 width) threshold.
    pub max_per_subnet: usize,
    /// IPv4 subnet aggregation width, in bits.
    pub subnet_prefix_v4: u8,
    /// IPv6 subnet aggregation width, in bits.
    pub subnet_prefix_v6: u8,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            max_per_address: 5,
            max_per_subnet: 20,
            subnet_prefix_v4: DEFAULT_SUBNET_PREFIX_V4,
            subnet_prefix_v6: DEFAULT_SUBNET_PREFIX_V6,
        }
    }
}

/// Result of recording one connection attempt, telling the caller whether
/// a firewall block should be requested for the address and/or subnet.
/// The firewall call itself is left to the caller so it happens outside
/// this ledger's lock.
#[derive(Debug, Eq, PartialEq)]
pub struct AttemptOutcome {
    /// Number of attempts currently recorded for the address (after pruning
    /// and appending this one).
    pub address_count: usize,
    /// Whether `address_count` exceeded the configured per-address threshold.
    pub address_exceeded: bool,
    /// The subnet key this address aggregates into.
    pub subnet_key: String,
    /// Number of attempts currently recorded for the subnet.
    pub subnet_count: usize,
    /// Whether `subnet_count` exceeded the configured per-subnet threshold.
    pub subnet_exceeded: bool,
}

/// Two independent maps — address→timestamps and subnet→timestamps — each a
/// sharded concurrent map so unrelated addresses never contend on the same
/// lock.
pub struct ConnectionLedger {
    by_address: DashMap<IpAddr, Vec<u64>>,
    by_subnet: DashMap<String, Vec<u64>>,
}

impl Default for ConnectionLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionLedger {
    /// Builds an empty ledger.
    pub fn new() -> Self {
        Self {
            by_address: DashMap::new(),
            by_subnet: DashMap::new(),
        }
    }

    /// Records one untrusted connection attempt from `addr` at `now_ms`,
    /// pruning stale entries first and clearing a list once it crosses its
    /// threshold. The list is cleared whenever the threshold is crossed,
    /// independent of whether a firewall block is actually requested for it.
    pub fn record_attempt(&self, addr: IpAddr, now_ms: u64, config: &RateLimitConfig) -> AttemptOutcome {
        let retention_ms = config.retention.as_millis() as u64;
        let subnet_key = net::subnet_key(addr, config.subnet_prefix_v4, config.subnet_prefix_v6);

        let address_count = {
            let mut entries = self.by_address.entry(addr).or_default();
            prune(&mut entries, now_ms, retention_ms);
            entries.push(now_ms);
            entries.len()
        };
        let address_exceeded = address_count > config.max_per_address;
        if address_exceeded {
            self.by_address.remove(&addr);
        }

        let subnet_count = {
            let mut entries = self.by_subnet.entry(subnet_key.clone()).or_default();
            prune(&mut entries, now_ms, retention_ms);
            entries.push(now_ms);
            entries.len()
        };
        let subnet_exceeded = subnet_count > config.max_per_subnet;
        if subnet_exceeded {
            self.by_subnet.remove(&subnet_key);
        }

        AttemptOutcome {
            address_count,
            address_exceeded,
            subnet_key,
            subnet_count,
            subnet_exceeded,
        }
    }

    /// Number of timestamps currently recorded for `addr`, for tests and
    /// diagnostics.
    pub fn address_len(&self, addr: IpAddr) -> usize {
        self.by_address.get(&addr).map_or(0, |entries| entries.len())
    }
}

fn prune(entries: &mut Vec<u64>, now_ms: u64, retention_ms: u64) {
    entries.retain(|&ts| now_ms.saturating_sub(ts) <= retention_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn classify_is_pure_and_checks_all_sources() {
        let mut config = TrustConfig::default();
        config.trusted_addresses.insert(addr("127.0.0.1"));
        config.trusted_networks.push("10.0.0.0/8".parse().unwrap());
        let filter = TrustFilter::new(config);

        assert!(filter.classify(addr("127.0.0.1")));
        assert!(filter.classify(addr("10.1.2.3")));
        assert!(!filter.classify(addr("8.8.8.8")));

        filter.add_auto_trust(addr("8.8.8.8"));
        assert!(filter.classify(addr("8.8.8.8")));
    }

    #[test]
    fn auto_trust_add_is_idempotent() {
        let filter = TrustFilter::new(TrustConfig::default());
        filter.add_auto_trust(addr("1.2.3.4"));
        filter.add_auto_trust(addr("1.2.3.4"));
        assert_eq!(filter.auto_trusted.lock().unwrap().len(), 1);
        assert!(filter.classify(addr("1.2.3.4")));
    }

    #[test]
    fn threshold_crossed_after_k_plus_one_attempts() {
        let ledger = ConnectionLedger::new();
        let config = RateLimitConfig {
            max_per_address: 3,
            max_per_subnet: 1000,
            ..RateLimitConfig::default()
        };
        let a = addr("10.0.0.1");
        let mut last = AttemptOutcome {
            address_count: 0,
            address_exceeded: false,
            subnet_key: String::new(),
            subnet_count: 0,
            subnet_exceeded: false,
        };
        for i in 0..4 {
            last = ledger.record_attempt(a, i, &config);
        }
        assert!(last.address_exceeded);
        assert_eq!(ledger.address_len(a), 0, "ledger must be cleared once exceeded");
    }

    #[test]
    fn stale_entries_are_pruned_on_next_update() {
        let ledger = ConnectionLedger::new();
        let config = RateLimitConfig {
            retention: Duration::from_millis(100),
            max_per_address: 1000,
            max_per_subnet: 1000,
            ..RateLimitConfig::default()
        };
        let a = addr("10.0.0.2");
        ledger.record_attempt(a, 0, &config);
        assert_eq!(ledger.address_len(a), 1);
        let outcome = ledger.record_attempt(a, 500, &config);
        assert_eq!(outcome.address_count, 1, "the stale entry from t=0 must be pruned");
    }

    #[test]
    fn subnet_aggregates_v4_slash_24() {
        let ledger = ConnectionLedger::new();
        let config = RateLimitConfig::default();
        let outcome1 = ledger.record_attempt(addr("10.0.0.1"), 0, &config);
        let outcome2 = ledger.record_attempt(addr("10.0.0.254"), 1, &config);
        assert_eq!(outcome1.subnet_key, outcome2.subnet_key);
        assert_eq!(outcome2.subnet_count, 2);
    }
}
