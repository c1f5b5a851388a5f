#![deny(unsafe_code)]

//! Builds the pairing QR payload and `.chessuci` connection file that let a
//! mobile client zero-configure itself against this bridge host. Both are
//! plain JSON; this crate only assembles and serializes them; writing the
//! connection file and rendering the QR to a terminal are thin wrappers
//! around [`serde_json`] and the `qrcode` crate respectively.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::Serialize;

/// One engine's resolved listening port, for payload assembly.
#[derive(Clone, Debug)]
pub struct EngineSummary {
    pub name: String,
    pub port: u16,
}

/// Everything the caller has gathered about a pairing attempt: trust/auth
/// settings, resolved engine ports, and the reachability results
/// (UPnP/WAN/relay) discovered since startup.
#[derive(Clone, Debug)]
pub struct PairingContext {
    pub host_ip: IpAddr,
    pub engines: Vec<EngineSummary>,
    pub enable_tls: bool,
    pub auth_method: String,
    pub auth_token: Option<String>,
    pub psk_key: Option<String>,
    pub certificate_fingerprint: Option<String>,
    pub single_port: Option<u16>,
    pub external_host: Option<IpAddr>,
    pub relay: Option<RelayInfo>,
    /// Per-engine relay session id, keyed by engine name, when relay dialing
    /// is active. In single-port mode every engine shares one session.
    pub relay_sessions: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct RelayInfo {
    pub host: String,
    pub port: u16,
}

#[derive(Serialize)]
struct PairingEngine {
    name: String,
    port: u16,
    mdns_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    relay_session: Option<String>,
}

#[derive(Serialize)]
pub struct PairingPayload {
    #[serde(rename = "type")]
    kind: &'static str,
    host: String,
    engines: Vec<PairingEngine>,
    tls: bool,
    token: String,
    auth_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    psk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    relay: Option<RelayInfoJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    single_port: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
}

#[derive(Serialize)]
struct RelayInfoJson {
    host: String,
    port: u16,
}

/// Builds the pairing QR payload described by [`PairingContext`].
pub fn build_pairing_payload(ctx: &PairingContext) -> PairingPayload {
    let mut engines: Vec<PairingEngine> = ctx
        .engines
        .iter()
        .map(|e| PairingEngine {
            name: e.name.clone(),
            port: ctx.single_port.unwrap_or(e.port),
            mdns_name: e.name.clone(),
            relay_session: relay_session_for(ctx, &e.name),
        })
        .collect();
    engines.sort_by(|a, b| a.name.cmp(&b.name));

    PairingPayload {
        kind: "chess-uci-server",
        host: ctx.host_ip.to_string(),
        engines,
        tls: ctx.enable_tls,
        token: ctx.auth_token.clone().unwrap_or_default(),
        auth_method: ctx.auth_method.clone(),
        psk: ctx.psk_key.clone(),
        fingerprint: ctx.certificate_fingerprint.clone(),
        external_host: ctx.external_host.map(|ip| ip.to_string()),
        relay: ctx.relay.as_ref().map(|r| RelayInfoJson {
            host: r.host.clone(),
            port: r.port,
        }),
        single_port: ctx.single_port.map(|_| true),
        port: ctx.single_port,
    }
}

fn relay_session_for(ctx: &PairingContext, engine_name: &str) -> Option<String> {
    if ctx.single_port.is_some() {
        ctx.relay_sessions.get("_server_multiplex").cloned()
    } else {
        ctx.relay_sessions.get(engine_name).cloned()
    }
}

#[derive(Serialize)]
struct ConnectionEndpoint {
    host: String,
    port: u16,
}

#[derive(Serialize, Default)]
struct ConnectionEndpoints {
    lan: Option<ConnectionEndpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    upnp: Option<ConnectionEndpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wan: Option<ConnectionEndpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    relay: Option<ConnectionRelayEndpoint>,
}

#[derive(Serialize)]
struct ConnectionRelayEndpoint {
    host: String,
    port: u16,
    session_id: String,
}

#[derive(Serialize)]
struct ConnectionEngine {
    name: String,
    port: u16,
    mdns_name: String,
    endpoints: ConnectionEndpoints,
}

#[derive(Serialize)]
struct ConnectionSecurity {
    tls: bool,
    auth_method: String,
    token: String,
    psk: String,
    fingerprint: String,
}

#[derive(Serialize)]
pub struct ConnectionFile {
    version: u32,
    #[serde(rename = "type")]
    kind: &'static str,
    created: String,
    server_name: String,
    engines: Vec<ConnectionEngine>,
    security: ConnectionSecurity,
    #[serde(skip_serializing_if = "Option::is_none")]
    single_port: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    available_engines: Option<Vec<String>>,
}

/// Builds the full `.chessuci` connection file document.
pub fn build_connection_file(ctx: &PairingContext) -> ConnectionFile {
    let mut engines: Vec<ConnectionEngine> = ctx
        .engines
        .iter()
        .map(|e| {
            let port = ctx.single_port.unwrap_or(e.port);
            let mut endpoints = ConnectionEndpoints {
                lan: Some(ConnectionEndpoint {
                    host: ctx.host_ip.to_string(),
                    port,
                }),
                ..Default::default()
            };
            if let Some(external) = ctx.external_host {
                endpoints.wan = Some(ConnectionEndpoint {
                    host: external.to_string(),
                    port,
                });
            }
            if let (Some(relay), Some(session)) = (&ctx.relay, relay_session_for(ctx, &e.name)) {
                endpoints.relay = Some(ConnectionRelayEndpoint {
                    host: relay.host.clone(),
                    port: relay.port,
                    session_id: session,
                });
            }
            ConnectionEngine {
                name: e.name.clone(),
                port,
                mdns_name: e.name.clone(),
                endpoints,
            }
        })
        .collect();
    engines.sort_by(|a, b| a.name.cmp(&b.name));

    let available_engines = ctx.single_port.map(|_| {
        let mut names: Vec<String> = ctx.engines.iter().map(|e| e.name.clone()).collect();
        names.sort();
        names
    });

    ConnectionFile {
        version: 1,
        kind: "chess-uci-server",
        created: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        server_name: format!("Chess Server ({})", ctx.host_ip),
        engines,
        security: ConnectionSecurity {
            tls: ctx.enable_tls,
            auth_method: ctx.auth_method.clone(),
            token: ctx.auth_token.clone().unwrap_or_default(),
            psk: ctx.psk_key.clone().unwrap_or_default(),
            fingerprint: ctx.certificate_fingerprint.clone().unwrap_or_default(),
        },
        single_port: ctx.single_port.map(|_| true),
        port: ctx.single_port,
        available_engines,
    }
}

/// Writes the connection file to `path` as pretty-printed JSON.
pub fn write_connection_file(path: &std::path::Path, file: &ConnectionFile) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(file).expect("ConnectionFile always serializes");
    std::fs::write(path, json)?;
    tracing::info!(path = %path.display(), "connection file written");
    Ok(())
}

/// Renders a compact JSON payload as an ASCII-art QR code for terminal
/// display, using medium error correction (matching the density typically
/// used for this kind of short connection payload).
pub fn render_qr_ascii(payload_json: &str) -> Result<String, qrcode::types::QrError> {
    let code = qrcode::QrCode::with_error_correction_level(payload_json, qrcode::EcLevel::M)?;
    Ok(code
        .render::<char>()
        .quiet_zone(true)
        .module_dimensions(1, 1)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_context() -> PairingContext {
        PairingContext {
            host_ip: "192.168.1.10".parse().unwrap(),
            engines: vec![EngineSummary {
                name: "stockfish".to_string(),
                port: 9001,
            }],
            enable_tls: false,
            auth_method: "token".to_string(),
            auth_token: Some("secret".to_string()),
            psk_key: None,
            certificate_fingerprint: None,
            single_port: None,
            external_host: None,
            relay: None,
            relay_sessions: BTreeMap::new(),
        }
    }

    #[test]
    fn pairing_payload_omits_absent_optionals() {
        let payload = build_pairing_payload(&sample_context());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "chess-uci-server");
        assert!(json.get("psk").is_none());
        assert!(json.get("relay").is_none());
        assert_eq!(json["engines"][0]["port"], 9001);
    }

    #[test]
    fn single_port_mode_overrides_every_engine_port() {
        let mut ctx = sample_context();
        ctx.single_port = Some(9999);
        let payload = build_pairing_payload(&ctx);
        assert_eq!(payload.port, Some(9999));
        assert_eq!(payload.engines[0].port, 9999);
    }

    #[test]
    fn connection_file_includes_lan_endpoint_for_every_engine() {
        let file = build_connection_file(&sample_context());
        assert_eq!(file.engines.len(), 1);
        assert!(file.engines[0].endpoints.lan.is_some());
        assert!(file.engines[0].endpoints.wan.is_none());
    }

    #[test]
    fn relay_session_attaches_per_engine_when_present() {
        let mut ctx = sample_context();
        ctx.relay = Some(RelayInfo {
            host: "relay.example.invalid".to_string(),
            port: 19000,
        });
        ctx.relay_sessions.insert("stockfish".to_string(), "abc123".to_string());
        let payload = build_pairing_payload(&ctx);
        assert_eq!(payload.engines[0].relay_session.as_deref(), Some("abc123"));
    }

    #[test]
    fn qr_renders_nonempty_ascii() {
        let rendered = render_qr_ascii("{\"type\":\"chess-uci-server\"}").unwrap();
        assert!(!rendered.is_empty());
    }
}
