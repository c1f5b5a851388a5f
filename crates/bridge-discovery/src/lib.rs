#![deny(unsafe_code)]

//! UPnP port mapping and mDNS service advertisement, both consumed through
//! small capability traits so a platform or build lacking the underlying
//! dependency can fall back to a no-op implementation with only a warning.
//!
//! UPnP gateway discovery is inherently a blocking, multi-second network
//! operation in most implementations; this crate uses `igd-next`'s
//! `aio_tokio` feature so discovery and mapping run as ordinary async
//! tasks instead of needing an explicit `spawn_blocking` hop.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;

/// Acquires and renews a single external port mapping.
#[async_trait]
pub trait UpnpCollaborator: Send + Sync {
    /// Requests a mapping from `internal_port` on this host to an external
    /// port, valid for `lease`. Returns the external address and port on
    /// success.
    async fn map_port(&self, internal_port: u16, description: &str, lease: Duration) -> Option<(IpAddr, u16)>;
}

/// Advertises and withdraws mDNS services for discovered engines.
pub trait MdnsCollaborator: Send + Sync {
    /// Registers a `_chess-uci._tcp` service under `instance_name` on `port`.
    fn register(&self, instance_name: &str, port: u16) -> Result<(), MdnsError>;
    /// Withdraws a previously registered service.
    fn unregister(&self, instance_name: &str);
}

#[derive(Debug, thiserror::Error)]
pub enum MdnsError {
    #[error("mDNS daemon error: {0}")]
    Daemon(String),
}

/// Always fails to map a port; used when UPnP is disabled or the gateway
/// search times out.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpUpnp;

#[async_trait]
impl UpnpCollaborator for NoOpUpnp {
    async fn map_port(&self, _internal_port: u16, _description: &str, _lease: Duration) -> Option<(IpAddr, u16)> {
        None
    }
}

/// Always reports success without doing anything; used when mDNS is
/// disabled or the platform has no working daemon.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpMdns;

impl MdnsCollaborator for NoOpMdns {
    fn register(&self, _instance_name: &str, _port: u16) -> Result<(), MdnsError> {
        Ok(())
    }

    fn unregister(&self, _instance_name: &str) {}
}

/// Real UPnP IGD collaborator, backed by gateway discovery on every call
/// (mappings aren't assumed to survive a gateway restart, so renewal
/// re-discovers rather than caching a stale gateway handle).
#[derive(Clone, Copy, Debug, Default)]
pub struct IgdUpnp;

#[async_trait]
impl UpnpCollaborator for IgdUpnp {
    async fn map_port(&self, internal_port: u16, description: &str, lease: Duration) -> Option<(IpAddr, u16)> {
        let gateway = match igd_next::aio::tokio::search_gateway(igd_next::SearchOptions::default()).await {
            Ok(gw) => gw,
            Err(error) => {
                tracing::warn!(%error, "UPnP: no IGD gateway found");
                return None;
            }
        };

        let local_ip = match gateway.get_external_ip().await {
            Ok(ip) => ip,
            Err(error) => {
                tracing::warn!(%error, "UPnP: could not determine external IP");
                return None;
            }
        };

        let internal_addr = SocketAddr::new(local_addr_guess(), internal_port);
        match gateway
            .add_port(
                igd_next::PortMappingProtocol::TCP,
                internal_port,
                internal_addr,
                lease.as_secs().try_into().unwrap_or(0),
                description,
            )
            .await
        {
            Ok(()) => {
                tracing::info!(port = internal_port, external = %local_ip, "UPnP: mapped port");
                Some((IpAddr::V4(local_ip), internal_port))
            }
            Err(error) => {
                tracing::warn!(%error, port = internal_port, "UPnP: port mapping failed");
                None
            }
        }
    }
}

fn local_addr_guess() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}

/// Real mDNS collaborator, backed by a single shared `ServiceDaemon`.
pub struct ZeroconfMdns {
    daemon: mdns_sd::ServiceDaemon,
    host_name: String,
}

impl ZeroconfMdns {
    pub fn new(host_name: impl Into<String>) -> Result<Self, MdnsError> {
        let daemon = mdns_sd::ServiceDaemon::new().map_err(|e| MdnsError::Daemon(e.to_string()))?;
        Ok(Self {
            daemon,
            host_name: host_name.into(),
        })
    }
}

impl MdnsCollaborator for ZeroconfMdns {
    fn register(&self, instance_name: &str, port: u16) -> Result<(), MdnsError> {
        let properties: std::collections::HashMap<String, String> = std::collections::HashMap::new();
        let info = mdns_sd::ServiceInfo::new(
            "_chess-uci._tcp.local.",
            instance_name,
            &self.host_name,
            "",
            port,
            properties,
        )
        .map_err(|e| MdnsError::Daemon(e.to_string()))?;
        self.daemon
            .register(info)
            .map_err(|e| MdnsError::Daemon(e.to_string()))
    }

    fn unregister(&self, instance_name: &str) {
        let fullname = format!("{instance_name}._chess-uci._tcp.local.");
        if let Err(error) = self.daemon.unregister(&fullname) {
            tracing::warn!(%error, service = instance_name, "mDNS: failed to unregister service");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_upnp_always_declines() {
        let result = NoOpUpnp.map_port(9000, "test", Duration::from_secs(3600)).await;
        assert!(result.is_none());
    }

    #[test]
    fn noop_mdns_always_succeeds() {
        let mdns = NoOpMdns;
        assert!(mdns.register("stockfish", 9000).is_ok());
        mdns.unregister("stockfish");
    }
}
