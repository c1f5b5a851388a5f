//! Builds the capability collaborators (firewall, UPnP, mDNS) named by
//! configuration, defaulting to the no-op implementation whenever a
//! feature is disabled or unsupported on the current platform.

use std::sync::Arc;

use bridge_config::Config;
use bridge_core::net::CidrBlock;
use bridge_discovery::{MdnsCollaborator, NoOpMdns, NoOpUpnp, UpnpCollaborator, ZeroconfMdns};
use bridge_firewall::{FirewallCollaborator, NoOpFirewall};

#[cfg(target_os = "linux")]
use bridge_firewall::LinuxIpTablesFirewall;

pub fn firewall(config: &Config) -> Arc<dyn FirewallCollaborator> {
    #[cfg(target_os = "linux")]
    {
        if config.enable_firewall_rules {
            return Arc::new(LinuxIpTablesFirewall);
        }
    }
    #[cfg(not(target_os = "linux"))]
    if config.enable_firewall_rules {
        tracing::warn!("enable_firewall_rules is set but no firewall backend is supported on this platform");
    }
    Arc::new(NoOpFirewall)
}

pub fn upnp(config: &Config) -> Arc<dyn UpnpCollaborator> {
    if config.enable_upnp {
        Arc::new(bridge_discovery::IgdUpnp)
    } else {
        Arc::new(NoOpUpnp)
    }
}

pub fn mdns(config: &Config, host_name: &str) -> Arc<dyn MdnsCollaborator> {
    if !config.enable_mdns {
        return Arc::new(NoOpMdns);
    }
    match ZeroconfMdns::new(host_name) {
        Ok(daemon) => Arc::new(daemon),
        Err(error) => {
            tracing::warn!(%error, "mDNS daemon failed to start, advertisement disabled");
            Arc::new(NoOpMdns)
        }
    }
}

pub fn cidr_to_string(block: &CidrBlock) -> String {
    match block {
        CidrBlock::V4 { network, prefix } => format!("{network}/{prefix}"),
        CidrBlock::V6 { network, prefix } => format!("{network}/{prefix}"),
    }
}
