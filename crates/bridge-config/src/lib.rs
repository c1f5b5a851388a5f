#![deny(unsafe_code)]

//! # Overview
//!
//! Parses, validates, and type-checks the TOML configuration document that
//! describes one bridge host: listen address, engine map, trust lists, and
//! the optional keys that gate every other collaborator (firewall, TLS,
//! auth, relay, UPnP, mDNS). Also owns persistence of the generated
//! server secret used to derive deterministic relay session ids.
//!
//! # Design
//!
//! Validation walks the raw [`toml::Value`] document rather than a typed
//! `serde::Deserialize` target so that a malformed document reports every
//! defect it contains — wrong key, wrong kind, bad engine path, duplicate
//! port, and so on — in one pass instead of failing on the first field serde
//! happens to touch. [`Config`] is only constructed once that walk reports
//! zero violations, so downstream code never has to re-check these things.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bridge_auth::{AuthConfig, AuthMethod};
use bridge_core::descriptor::OptionOverride;
use bridge_core::net::{CidrBlock, DEFAULT_SUBNET_PREFIX_V6};
use rand::RngCore;

/// One engine entry from the `[engines.<name>]` table.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub path: PathBuf,
    pub port: u16,
    pub overrides: BTreeMap<String, OptionOverride>,
}

/// The fully validated, typed configuration for one bridge host.
#[derive(Clone, Debug)]
pub struct Config {
    pub listen_address: String,
    pub engines: BTreeMap<String, EngineConfig>,
    /// Fallback overrides consulted when an engine has no entry of its own
    /// for an option name, from the top-level `[overrides]` table.
    pub global_overrides: BTreeMap<String, OptionOverride>,
    pub max_connections: u32,
    pub trusted_addresses: Vec<IpAddr>,
    pub trusted_networks: Vec<CidrBlock>,

    pub enable_trusted_sources: bool,
    pub enable_auto_trust: bool,
    pub enable_firewall_rules: bool,
    pub enable_firewall_ip_blocking: bool,
    pub enable_firewall_subnet_blocking: bool,
    pub max_connection_attempts: usize,
    pub connection_attempt_period: Duration,
    pub max_connection_attempts_from_untrusted_subnet: usize,
    /// IPv6 subnet aggregation width for the connection-attempt ledger; the
    /// source left this undefined, so it is recorded explicitly here rather
    /// than left to guesswork.
    pub untrusted_subnet_prefix_v6: u8,
    pub log_untrusted_connection_attempts: bool,
    pub inactivity_timeout: Duration,
    pub heartbeat_time: Duration,
    pub watchdog_timer_interval: Duration,
    pub enable_tls: bool,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub auth_method: AuthMethod,
    pub auth_token: Option<String>,
    pub psk_key: Option<String>,
    pub session_keepalive_timeout: Duration,
    pub info_throttle_ms: u64,
    pub enable_single_port: bool,
    pub base_port: u16,
    pub default_engine: Option<String>,
    pub enable_upnp: bool,
    pub upnp_lease_duration: Duration,
    pub enable_mdns: bool,
    pub engine_directory: Option<PathBuf>,
    pub relay_server_url: Option<String>,
    pub relay_server_port: u16,
    pub server_secret: Option<String>,
    pub pid_file: PathBuf,
}

impl Config {
    /// Builds the [`bridge_auth::AuthConfig`] this bridge should hand to
    /// the handshake, honoring the explicit `auth_method` rather than
    /// inferring it from which secrets happen to be set.
    pub fn auth_config(&self) -> AuthConfig {
        match self.auth_method {
            AuthMethod::None => AuthConfig::default(),
            AuthMethod::Token => AuthConfig {
                token: self.auth_token.clone(),
                psk: None,
            },
            AuthMethod::Psk => AuthConfig {
                token: None,
                psk: self.psk_key.clone(),
            },
            AuthMethod::Both => AuthConfig {
                token: self.auth_token.clone(),
                psk: self.psk_key.clone(),
            },
        }
    }
}

/// Failure modes for [`load`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration as TOML: {0}")]
    Parse(String),
    /// Every violation found during validation, so the caller can print
    /// the whole list instead of stopping at the first one.
    #[error("configuration is invalid:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

/// Loads, validates, and type-checks the configuration at `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_and_build(&value)
}

/// Validates an already-parsed document, returning the typed [`Config`]
/// only when every check passes.
pub fn validate_and_build(value: &toml::Value) -> Result<Config, ConfigError> {
    let table = value
        .as_table()
        .ok_or_else(|| ConfigError::Invalid(vec!["configuration root must be a table".to_string()]))?;

    let mut errors = Vec::new();

    let listen_address = required_str(table, "listen_address", &mut errors);
    let max_connections = required_int(table, "max_connections", &mut errors);
    if let Some(n) = max_connections {
        if n < 1 {
            errors.push("max_connections must be >= 1".to_string());
        }
    }

    let engines = validate_engines(table, &mut errors);
    let trusted_addresses = validate_trusted_addresses(table, &mut errors);
    let trusted_networks = validate_trusted_networks(table, &mut errors);

    let inactivity_timeout = optional_int(table, "inactivity_timeout", 900);
    if inactivity_timeout < 0 {
        errors.push("inactivity_timeout must be >= 0".to_string());
    }

    let enable_tls = optional_bool(table, "enable_tls", false);
    let tls_cert_path = optional_string(table, "tls_cert_path");
    let tls_key_path = optional_string(table, "tls_key_path");
    if enable_tls {
        match &tls_cert_path {
            None => errors.push("enable_tls is true but tls_cert_path is empty".to_string()),
            Some(p) if !Path::new(p).is_file() => {
                errors.push(format!("TLS certificate not found: '{p}'"));
            }
            Some(_) => {}
        }
        match &tls_key_path {
            None => errors.push("enable_tls is true but tls_key_path is empty".to_string()),
            Some(p) if !Path::new(p).is_file() => {
                errors.push(format!("TLS key not found: '{p}'"));
            }
            Some(_) => {}
        }
    }

    let server_secret = optional_string(table, "server_secret");
    if let Some(secret) = &server_secret {
        if secret.len() < 32 {
            errors.push("server_secret must be at least 32 characters".to_string());
        }
    }

    let default_engine = optional_string(table, "default_engine");
    if let (Some(name), Some(engines)) = (&default_engine, &engines) {
        if !engines.contains_key(name) {
            errors.push(format!("default_engine '{name}' not found in engines"));
        }
    }

    let auth_method = optional_auth_method(table, &mut errors);

    if !errors.is_empty() {
        return Err(ConfigError::Invalid(errors));
    }

    Ok(Config {
        listen_address: listen_address.expect("validated above"),
        engines: engines.expect("validated above"),
        global_overrides: parse_overrides_table(table.get("overrides")),
        max_connections: u32::try_from(max_connections.expect("validated above")).unwrap_or(1),
        trusted_addresses,
        trusted_networks,
        enable_trusted_sources: optional_bool(table, "enable_trusted_sources", true),
        enable_auto_trust: optional_bool(table, "enable_auto_trust", false),
        enable_firewall_rules: optional_bool(table, "enable_firewall_rules", false),
        enable_firewall_ip_blocking: optional_bool(table, "enable_firewall_ip_blocking", false),
        enable_firewall_subnet_blocking: optional_bool(table, "enable_firewall_subnet_blocking", false),
        max_connection_attempts: optional_int(table, "max_connection_attempts", 5) as usize,
        connection_attempt_period: Duration::from_secs(
            optional_int(table, "connection_attempt_period", 3600).max(0) as u64,
        ),
        max_connection_attempts_from_untrusted_subnet: optional_int(
            table,
            "max_connection_attempts_from_untrusted_subnet",
            20,
        ) as usize,
        untrusted_subnet_prefix_v6: optional_int(table, "untrusted_subnet_prefix_v6", i64::from(DEFAULT_SUBNET_PREFIX_V6))
            .clamp(0, 128) as u8,
        log_untrusted_connection_attempts: optional_bool(table, "log_untrusted_connection_attempts", false),
        inactivity_timeout: Duration::from_secs(inactivity_timeout.max(0) as u64),
        heartbeat_time: Duration::from_secs(optional_int(table, "heartbeat_time", 300).max(0) as u64),
        watchdog_timer_interval: Duration::from_secs(
            optional_int(table, "watchdog_timer_interval", 300).max(0) as u64,
        ),
        enable_tls,
        tls_cert_path: tls_cert_path.map(PathBuf::from),
        tls_key_path: tls_key_path.map(PathBuf::from),
        auth_method,
        auth_token: optional_string(table, "auth_token"),
        psk_key: optional_string(table, "psk_key"),
        session_keepalive_timeout: Duration::from_secs(
            optional_int(table, "session_keepalive_timeout", 0).max(0) as u64,
        ),
        info_throttle_ms: optional_int(table, "info_throttle_ms", 200) as u64,
        enable_single_port: optional_bool(table, "enable_single_port", false),
        base_port: optional_int(table, "base_port", 9000) as u16,
        default_engine,
        enable_upnp: optional_bool(table, "enable_upnp", false),
        upnp_lease_duration: Duration::from_secs(
            optional_int(table, "upnp_lease_duration", 3600).max(0) as u64,
        ),
        enable_mdns: optional_bool(table, "enable_mdns", false),
        engine_directory: optional_string(table, "engine_directory").map(PathBuf::from),
        relay_server_url: optional_string(table, "relay_server_url"),
        relay_server_port: optional_int(table, "relay_server_port", 19000) as u16,
        server_secret,
        pid_file: PathBuf::from(
            optional_string(table, "pid_file").unwrap_or_else(|| "chess-uci-bridge.pid".to_string()),
        ),
    })
}

fn required_str(table: &toml::Table, key: &str, errors: &mut Vec<String>) -> Option<String> {
    match table.get(key) {
        None => {
            errors.push(format!("missing required config key: '{key}'"));
            None
        }
        Some(toml::Value::String(s)) => Some(s.clone()),
        Some(other) => {
            errors.push(format!("config key '{key}' must be a string, got {}", other.type_str()));
            None
        }
    }
}

fn required_int(table: &toml::Table, key: &str, errors: &mut Vec<String>) -> Option<i64> {
    match table.get(key) {
        None => {
            errors.push(format!("missing required config key: '{key}'"));
            None
        }
        Some(toml::Value::Integer(n)) => Some(*n),
        Some(other) => {
            errors.push(format!("config key '{key}' must be an integer, got {}", other.type_str()));
            None
        }
    }
}

fn optional_bool(table: &toml::Table, key: &str, default: bool) -> bool {
    table.get(key).and_then(toml::Value::as_bool).unwrap_or(default)
}

fn optional_int(table: &toml::Table, key: &str, default: i64) -> i64 {
    table.get(key).and_then(toml::Value::as_integer).unwrap_or(default)
}

fn optional_string(table: &toml::Table, key: &str) -> Option<String> {
    table.get(key).and_then(toml::Value::as_str).map(str::to_string)
}

fn optional_auth_method(table: &toml::Table, errors: &mut Vec<String>) -> AuthMethod {
    match table.get("auth_method").and_then(toml::Value::as_str) {
        None => AuthMethod::None,
        Some("none") => AuthMethod::None,
        Some("token") => AuthMethod::Token,
        Some("psk") => AuthMethod::Psk,
        Some("both") => AuthMethod::Both,
        Some(other) => {
            errors.push(format!(
                "auth_method must be one of none, token, psk, both, got '{other}'"
            ));
            AuthMethod::None
        }
    }
}

fn validate_engines(
    table: &toml::Table,
    errors: &mut Vec<String>,
) -> Option<BTreeMap<String, EngineConfig>> {
    let Some(engines_value) = table.get("engines") else {
        errors.push("missing required config key: 'engines'".to_string());
        return None;
    };
    let Some(engines_table) = engines_value.as_table() else {
        errors.push(format!(
            "config key 'engines' must be a table, got {}",
            engines_value.type_str()
        ));
        return None;
    };

    let mut engines = BTreeMap::new();
    let mut seen_ports: BTreeMap<u16, String> = BTreeMap::new();

    for (name, details) in engines_table {
        let Some(details) = details.as_table() else {
            errors.push(format!("engine '{name}' must be a table, got {}", details.type_str()));
            continue;
        };

        let path = match details.get("path").and_then(toml::Value::as_str) {
            None => {
                errors.push(format!("engine '{name}' missing required key 'path'"));
                None
            }
            Some(p) if !Path::new(p).is_file() => {
                errors.push(format!("engine '{name}' path does not exist: '{p}'"));
                None
            }
            Some(p) if !is_executable(Path::new(p)) => {
                errors.push(format!("engine '{name}' path is not executable: '{p}'"));
                None
            }
            Some(p) => Some(PathBuf::from(p)),
        };

        let port = match details.get("port").and_then(toml::Value::as_integer) {
            None => {
                errors.push(format!("engine '{name}' missing required key 'port'"));
                None
            }
            Some(p) if !(1..=65535).contains(&p) => {
                errors.push(format!("engine '{name}' port out of range: {p}"));
                None
            }
            Some(p) => {
                let port = p as u16;
                if let Some(other) = seen_ports.get(&port) {
                    errors.push(format!(
                        "port conflict: engines '{other}' and '{name}' both use port {port}"
                    ));
                } else {
                    seen_ports.insert(port, name.clone());
                }
                Some(port)
            }
        };

        let overrides = parse_overrides_table(details.get("overrides"));

        if let (Some(path), Some(port)) = (path, port) {
            engines.insert(name.clone(), EngineConfig { path, port, overrides });
        }
    }

    Some(engines)
}

/// Parses an `overrides` table (engine-local or top-level) into the option
/// override map shared by [`EngineConfig`] and [`Config::global_overrides`].
fn parse_overrides_table(value: Option<&toml::Value>) -> BTreeMap<String, OptionOverride> {
    value
        .and_then(toml::Value::as_table)
        .map(|t| {
            t.iter()
                .map(|(opt_name, value)| {
                    let raw = value.as_str().unwrap_or_default();
                    let parsed = if raw == "override" {
                        OptionOverride::Override
                    } else {
                        OptionOverride::Substitute(raw.to_string())
                    };
                    (opt_name.clone(), parsed)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn validate_trusted_addresses(table: &toml::Table, errors: &mut Vec<String>) -> Vec<IpAddr> {
    let Some(list) = table.get("trusted_addresses").and_then(toml::Value::as_array) else {
        errors.push("missing required config key: 'trusted_addresses'".to_string());
        return Vec::new();
    };
    list.iter()
        .filter_map(|v| {
            let s = v.as_str()?;
            match s.parse::<IpAddr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    errors.push(format!("invalid IP in trusted_addresses: '{s}'"));
                    None
                }
            }
        })
        .collect()
}

fn validate_trusted_networks(table: &toml::Table, errors: &mut Vec<String>) -> Vec<CidrBlock> {
    let Some(list) = table.get("trusted_networks").and_then(toml::Value::as_array) else {
        errors.push("missing required config key: 'trusted_networks'".to_string());
        return Vec::new();
    };
    list.iter()
        .filter_map(|v| {
            let s = v.as_str()?;
            match s.parse::<CidrBlock>() {
                Ok(block) => Some(block),
                Err(_) => {
                    errors.push(format!("invalid subnet in trusted_networks: '{s}'"));
                    None
                }
            }
        })
        .collect()
}

/// Ensures the document at `path` has a `server_secret` of at least 32
/// characters, generating and persisting a fresh 64-hex-character one if
/// it is missing or too short. Returns the secret either way.
pub fn ensure_server_secret(path: &Path) -> Result<String, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let mut value: toml::Value = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let needs_new = value
        .get("server_secret")
        .and_then(toml::Value::as_str)
        .map(|s| s.len() < 32)
        .unwrap_or(true);

    if !needs_new {
        return Ok(value
            .get("server_secret")
            .and_then(toml::Value::as_str)
            .unwrap()
            .to_string());
    }

    let secret = generate_secret();
    let table = value
        .as_table_mut()
        .ok_or_else(|| ConfigError::Invalid(vec!["configuration root must be a table".to_string()]))?;
    table.insert("server_secret".to_string(), toml::Value::String(secret.clone()));

    let rendered = toml::to_string_pretty(&value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    std::fs::write(path, rendered)?;
    tracing::info!("generated new server_secret and saved it to the configuration file");
    Ok(secret)
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toml_doc(s: &str) -> toml::Value {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn reports_every_missing_required_key_in_one_pass() {
        let value = toml_doc("listen_address = \"0.0.0.0\"\n");
        let err = validate_and_build(&value).unwrap_err();
        let ConfigError::Invalid(violations) = err else {
            panic!("expected Invalid");
        };
        assert!(violations.iter().any(|v| v.contains("max_connections")));
        assert!(violations.iter().any(|v| v.contains("engines")));
        assert!(violations.iter().any(|v| v.contains("trusted_addresses")));
        assert!(violations.iter().any(|v| v.contains("trusted_networks")));
    }

    #[test]
    fn rejects_duplicate_ports() {
        let doc = toml_doc(
            r#"
            listen_address = "0.0.0.0"
            max_connections = 4
            trusted_addresses = []
            trusted_networks = []

            [engines.a]
            path = "/bin/sh"
            port = 9001

            [engines.b]
            path = "/bin/sh"
            port = 9001
            "#,
        );
        let err = validate_and_build(&doc).unwrap_err();
        let ConfigError::Invalid(violations) = err else {
            panic!("expected Invalid");
        };
        assert!(violations.iter().any(|v| v.contains("port conflict")));
    }

    #[test]
    fn rejects_short_server_secret() {
        let doc = toml_doc(
            r#"
            listen_address = "0.0.0.0"
            max_connections = 4
            trusted_addresses = []
            trusted_networks = []
            server_secret = "tooshort"

            [engines.a]
            path = "/bin/sh"
            port = 9001
            "#,
        );
        let err = validate_and_build(&doc).unwrap_err();
        let ConfigError::Invalid(violations) = err else {
            panic!("expected Invalid");
        };
        assert!(violations.iter().any(|v| v.contains("server_secret")));
    }

    #[test]
    fn accepts_minimal_valid_document() {
        let doc = toml_doc(
            r#"
            listen_address = "0.0.0.0"
            max_connections = 4
            trusted_addresses = ["127.0.0.1"]
            trusted_networks = ["10.0.0.0/8"]

            [engines.stockfish]
            path = "/bin/sh"
            port = 9001
            "#,
        );
        let config = validate_and_build(&doc).unwrap();
        assert_eq!(config.listen_address, "0.0.0.0");
        assert_eq!(config.engines.len(), 1);
        assert_eq!(config.inactivity_timeout, Duration::from_secs(900));
    }

    #[test]
    fn unknown_default_engine_is_reported() {
        let doc = toml_doc(
            r#"
            listen_address = "0.0.0.0"
            max_connections = 4
            trusted_addresses = []
            trusted_networks = []
            default_engine = "ghost"

            [engines.stockfish]
            path = "/bin/sh"
            port = 9001
            "#,
        );
        let err = validate_and_build(&doc).unwrap_err();
        let ConfigError::Invalid(violations) = err else {
            panic!("expected Invalid");
        };
        assert!(violations.iter().any(|v| v.contains("default_engine")));
    }

    #[test]
    fn ensure_server_secret_persists_generated_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "listen_address = \"0.0.0.0\"\n").unwrap();

        let secret = ensure_server_secret(&path).unwrap();
        assert_eq!(secret.len(), 64);

        let reread = std::fs::read_to_string(&path).unwrap();
        assert!(reread.contains(&secret));

        let secret2 = ensure_server_secret(&path).unwrap();
        assert_eq!(secret, secret2, "an already-long secret must not be regenerated");
    }
}
