//! Assembles the [`bridge_pairing::PairingContext`] this bridge exposes to
//! `--pair`, `--pair-only`, and `--connection-file`, and writes/renders the
//! resulting artifacts.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

use bridge_auth::AuthMethod;
use bridge_config::Config;
use bridge_pairing::{EngineSummary, PairingContext, RelayInfo};

use crate::engines::ResolvedEngine;

fn auth_method_name(method: AuthMethod) -> &'static str {
    match method {
        AuthMethod::None => "none",
        AuthMethod::Token => "token",
        AuthMethod::Psk => "psk",
        AuthMethod::Both => "both",
    }
}

#[allow(clippy::too_many_arguments)]
pub fn build_context(
    config: &Config,
    host_ip: IpAddr,
    resolved: &[ResolvedEngine],
    external_host: Option<IpAddr>,
    certificate_fingerprint: Option<String>,
    relay_sessions: BTreeMap<String, String>,
) -> PairingContext {
    let engines = resolved
        .iter()
        .map(|r| EngineSummary {
            name: r.descriptor.name.clone(),
            port: r.listen_port,
        })
        .collect();

    PairingContext {
        host_ip,
        engines,
        enable_tls: config.enable_tls,
        auth_method: auth_method_name(config.auth_method).to_string(),
        auth_token: config.auth_token.clone(),
        psk_key: config.psk_key.clone(),
        certificate_fingerprint,
        single_port: config.enable_single_port.then_some(config.base_port),
        external_host,
        relay: config.relay_server_url.clone().map(|host| RelayInfo {
            host,
            port: config.relay_server_port,
        }),
        relay_sessions,
    }
}

/// Renders the QR payload to the terminal and returns the JSON string (for
/// callers that also want to print or log it).
pub fn print_qr(ctx: &PairingContext) -> Result<String, qrcode::types::QrError> {
    let payload = bridge_pairing::build_pairing_payload(ctx);
    let json = serde_json::to_string(&payload).expect("pairing payload always serializes");
    let qr = bridge_pairing::render_qr_ascii(&json)?;
    println!("{qr}");
    Ok(json)
}

/// Writes the `.chessuci` connection file next to the configuration file
/// and returns its path.
pub fn write_connection_file(ctx: &PairingContext, next_to: &Path) -> std::io::Result<std::path::PathBuf> {
    let file = bridge_pairing::build_connection_file(ctx);
    let path = next_to
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("connection.chessuci");
    bridge_pairing::write_connection_file(&path, &file)?;
    Ok(path)
}

/// Derives one relay session id per engine (or one shared id in single-port
/// mode), for display in pairing artifacts, independent of whether the
/// relay dialer is actually running yet.
pub fn relay_sessions(config: &Config, resolved: &[ResolvedEngine], server_secret: &str) -> BTreeMap<String, String> {
    let mut sessions = BTreeMap::new();
    if config.relay_server_url.is_none() {
        return sessions;
    }
    if config.enable_single_port {
        sessions.insert(
            bridge_relay::MULTIPLEX_SESSION_LABEL.to_string(),
            bridge_relay::derive_session_id(server_secret, bridge_relay::MULTIPLEX_SESSION_LABEL),
        );
    } else {
        for engine in resolved {
            let name = &engine.descriptor.name;
            sessions.insert(name.clone(), bridge_relay::derive_session_id(server_secret, name));
        }
    }
    sessions
}
