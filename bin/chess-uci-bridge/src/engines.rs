//! Builds the process-wide engine registry from configuration plus
//! auto-discovery, and resolves each engine's listening port.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use bridge_config::Config;
use bridge_core::{discover_engines, DescriptorError, EngineDescriptor, EngineRegistry, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum EngineSetupError {
    #[error("failed to resolve listener ports: {0}")]
    PortResolution(#[from] std::io::Error),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// One resolved engine: its descriptor plus the port it will actually
/// listen on (equal to the configured/auto-discovered port unless that
/// collided with another engine and had to be reassigned).
pub struct ResolvedEngine {
    pub descriptor: EngineDescriptor,
    pub listen_port: u16,
}

/// Combines explicit `[engines.*]` entries with engines auto-discovered
/// under `engine_directory` (explicit entries win on name collision),
/// resolves every one to an actually-bindable port, and builds the
/// registry. In single-port mode, ports are not individually bound, so
/// each engine keeps its configured/auto-discovered preferred port as a
/// purely informational value.
pub fn build(config: &Config, host: &str) -> Result<(EngineRegistry, Vec<ResolvedEngine>), EngineSetupError> {
    let mut preferred: Vec<(String, PathBuf, u16, std::collections::BTreeMap<String, bridge_core::descriptor::OptionOverride>)> = config
        .engines
        .iter()
        .map(|(name, engine)| (name.clone(), engine.path.clone(), engine.port, engine.overrides.clone()))
        .collect();

    if let Some(dir) = &config.engine_directory {
        let discovered = discover_engines(dir);
        let assigned = bridge_core::assign_ports(&discovered, config.base_port);
        let known_names: std::collections::BTreeSet<&str> = preferred.iter().map(|(n, ..)| n.as_str()).collect();
        for (name, path, port) in assigned {
            if known_names.contains(name.as_str()) {
                continue;
            }
            preferred.push((name, path, port, std::collections::BTreeMap::new()));
        }
    }

    preferred.sort_by(|a, b| a.0.cmp(&b.0));

    let ports: Vec<(String, u16)> = preferred.iter().map(|(n, _, p, _)| (n.clone(), *p)).collect();
    let resolved_ports = if config.enable_single_port {
        ports
            .iter()
            .map(|(name, port)| bridge_listener::ResolvedPort {
                name: name.clone(),
                preferred: *port,
                actual: *port,
            })
            .collect()
    } else {
        bridge_listener::resolve_engine_ports(host, &ports)?
    };

    let port_by_name: BTreeMap<&str, u16> = resolved_ports.iter().map(|r| (r.name.as_str(), r.actual)).collect();

    let mut descriptors = Vec::with_capacity(preferred.len());
    let mut resolved = Vec::with_capacity(preferred.len());
    for (name, path, preferred_port, overrides) in preferred {
        let actual = port_by_name.get(name.as_str()).copied().unwrap_or(preferred_port);
        let descriptor = EngineDescriptor::new(name.clone(), path, actual, overrides)?;
        resolved.push(ResolvedEngine {
            descriptor: descriptor.clone(),
            listen_port: actual,
        });
        descriptors.push(descriptor);
    }

    let registry = EngineRegistry::new(descriptors, config.default_engine.clone())?;
    Ok((registry, resolved))
}

/// Best-effort local LAN address, used only for display in pairing
/// artifacts and log lines; never falls back to failing startup.
pub fn guess_local_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
}
