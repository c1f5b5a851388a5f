#![deny(unsafe_code)]

//! Polymorphic firewall collaborator consulted by the trust/rate filter
//! when a connection-attempt threshold is crossed. Concrete backends shell
//! out to a platform firewall tool; [`NoOpFirewall`] is used whenever the
//! feature is disabled or the platform has no supported backend.
//!
//! Every call here is best-effort: a shell-out failure is logged and
//! swallowed rather than propagated, since a firewall rule failing to
//! apply must never take down a bridge connection.

use std::net::IpAddr;

use async_trait::async_trait;

/// The capability set a concrete firewall backend implements.
#[async_trait]
pub trait FirewallCollaborator: Send + Sync {
    /// Blocks inbound traffic from a single address on the given ports.
    async fn block_address(&self, addr: IpAddr, ports: &[u16]);
    /// Blocks inbound traffic from an entire CIDR block on the given ports.
    async fn block_network(&self, network: &str, ports: &[u16]);
    /// Removes any block rules covering the given trusted addresses/networks.
    async fn unblock_trusted(&self, addresses: &[IpAddr], networks: &[String]);
    /// One-time setup hook run at startup (e.g. creating a dedicated chain).
    async fn configure(&self) {}
}

/// Does nothing. Used when firewall rules are disabled or unsupported.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpFirewall;

#[async_trait]
impl FirewallCollaborator for NoOpFirewall {
    async fn block_address(&self, _addr: IpAddr, _ports: &[u16]) {}
    async fn block_network(&self, _network: &str, _ports: &[u16]) {}
    async fn unblock_trusted(&self, _addresses: &[IpAddr], _networks: &[String]) {}
}

/// Shells out to `iptables` to maintain a dedicated `CHESS-UCI-BRIDGE`
/// chain. Only meaningful on Linux; construction elsewhere should fall
/// back to [`NoOpFirewall`].
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxIpTablesFirewall;

const CHAIN: &str = "CHESS-UCI-BRIDGE";

impl LinuxIpTablesFirewall {
    async fn run(&self, args: &[&str]) {
        let output = tokio::process::Command::new("iptables").args(args).output().await;
        match output {
            Ok(out) if out.status.success() => {}
            Ok(out) => {
                tracing::warn!(
                    args = ?args,
                    stderr = %String::from_utf8_lossy(&out.stderr),
                    "iptables command did not succeed"
                );
            }
            Err(error) => {
                tracing::warn!(args = ?args, %error, "failed to invoke iptables");
            }
        }
    }
}

#[async_trait]
impl FirewallCollaborator for LinuxIpTablesFirewall {
    async fn configure(&self) {
        self.run(&["-N", CHAIN]).await;
        self.run(&["-I", "INPUT", "-j", CHAIN]).await;
    }

    async fn block_address(&self, addr: IpAddr, _ports: &[u16]) {
        self.run(&["-A", CHAIN, "-s", &addr.to_string(), "-j", "DROP"]).await;
    }

    async fn block_network(&self, network: &str, _ports: &[u16]) {
        self.run(&["-A", CHAIN, "-s", network, "-j", "DROP"]).await;
    }

    async fn unblock_trusted(&self, addresses: &[IpAddr], networks: &[String]) {
        for addr in addresses {
            self.run(&["-D", CHAIN, "-s", &addr.to_string(), "-j", "DROP"]).await;
        }
        for network in networks {
            self.run(&["-D", CHAIN, "-s", network, "-j", "DROP"]).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_firewall_accepts_every_call_without_panicking() {
        let fw = NoOpFirewall;
        fw.configure().await;
        fw.block_address("10.0.0.1".parse().unwrap(), &[9000]).await;
        fw.block_network("10.0.0.0/24", &[9000]).await;
        fw.unblock_trusted(&["127.0.0.1".parse().unwrap()], &["10.0.0.0/8".to_string()])
            .await;
    }

    #[tokio::test]
    async fn dyn_dispatch_works_across_backends() {
        let backends: Vec<Box<dyn FirewallCollaborator>> =
            vec![Box::new(NoOpFirewall), Box::new(LinuxIpTablesFirewall)];
        for backend in &backends {
            backend.block_address("10.0.0.2".parse().unwrap(), &[9001]).await;
        }
    }
}
