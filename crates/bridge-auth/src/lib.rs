#![deny(unsafe_code)]

//! # Overview
//!
//! `bridge_auth` implements the pre-UCI challenge/response handshake that
//! runs before any engine process is touched. The handshake is a tiny
//! line-oriented protocol layered directly on the accepted TCP (or TLS)
//! stream; it shares no state with the trust filter or the engine session
//! manager.
//!
//! # Design
//!
//! [`AuthMethod`] is a four-way sum type rather than a pair of booleans, so
//! "token only", "psk only", "both", and "neither" are each a single named
//! state instead of an implicit combination.
//! [`handshake`] drives the whole exchange and returns `Ok(())` only on a
//! successful response; every other outcome — timeout, malformed line,
//! empty read, mismatched secret — collapses to [`AuthError`] so callers
//! close the connection uniformly.
//!
//! Secret comparison uses [`subtle::ConstantTimeEq`] so response timing
//! does not leak how many leading bytes matched.

use std::time::Duration;

use subtle::ConstantTimeEq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;

/// The configured authentication policy for a bridge.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// No authentication; the handshake is skipped entirely.
    None,
    /// Shared-token authentication only.
    Token,
    /// Pre-shared-key authentication only.
    Psk,
    /// Both token and PSK are accepted.
    Both,
}

impl AuthMethod {
    fn accepts_token(self) -> bool {
        matches!(self, AuthMethod::Token | AuthMethod::Both)
    }

    fn accepts_psk(self) -> bool {
        matches!(self, AuthMethod::Psk | AuthMethod::Both)
    }
}

/// Configured secrets and policy for one bridge's handshake.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Shared token secret, when token auth is enabled.
    pub token: Option<String>,
    /// Pre-shared key secret, when PSK auth is enabled.
    pub psk: Option<String>,
}

impl AuthConfig {
    fn method(&self) -> AuthMethod {
        match (self.token.is_some(), self.psk.is_some()) {
            (true, true) => AuthMethod::Both,
            (true, false) => AuthMethod::Token,
            (false, true) => AuthMethod::Psk,
            (false, false) => AuthMethod::None,
        }
    }

    /// Whether any credential is configured; when `false` the handshake is
    /// skipped and no greeting is ever sent.
    pub fn is_configured(&self) -> bool {
        self.token.is_some() || self.psk.is_some()
    }
}

/// The fixed window a client has to answer the `AUTH_REQUIRED` greeting.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure outcomes for [`handshake`]. All variants are equivalent from the
/// caller's perspective: close the connection.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The client did not respond within [`RESPONSE_TIMEOUT`].
    #[error("auth response timed out")]
    Timeout,
    /// The client closed the connection before sending a response.
    #[error("auth response was empty")]
    EmptyResponse,
    /// The response line did not parse as `AUTH <secret>` or `PSK_AUTH <secret>`.
    #[error("malformed auth response")]
    Malformed,
    /// The verb used (`AUTH`/`PSK_AUTH`) is not permitted by the configured method.
    #[error("auth method not permitted")]
    MethodNotPermitted,
    /// The supplied secret did not match.
    #[error("auth secret mismatch")]
    Mismatch,
    /// The underlying connection failed.
    #[error("auth I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs the handshake to completion against an already-accepted connection.
///
/// Returns `Ok(())` immediately without writing anything when no credential
/// is configured. Otherwise sends the greeting, reads one response line
/// (within [`RESPONSE_TIMEOUT`]), and writes `AUTH_OK`/`AUTH_FAIL`.
pub async fn handshake<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    config: &AuthConfig,
) -> Result<(), AuthError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWriteExt + Unpin,
{
    if !config.is_configured() {
        return Ok(());
    }

    let method = config.method();
    writer.write_all(greeting(method).as_bytes()).await?;
    writer.flush().await?;

    let mut line = String::new();
    let read = timeout(RESPONSE_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| AuthError::Timeout)??;

    let result = if read == 0 {
        Err(AuthError::EmptyResponse)
    } else {
        verify_response(line.trim_end_matches(['\r', '\n']), config, method)
    };

    match &result {
        Ok(()) => writer.write_all(b"AUTH_OK\n").await?,
        Err(_) => writer.write_all(b"AUTH_FAIL\n").await?,
    }
    writer.flush().await?;
    result
}

fn greeting(method: AuthMethod) -> String {
    match method {
        AuthMethod::Token => "AUTH_REQUIRED\n".to_string(),
        AuthMethod::Psk => "AUTH_REQUIRED psk\n".to_string(),
        AuthMethod::Both => "AUTH_REQUIRED token,psk\n".to_string(),
        AuthMethod::None => String::new(),
    }
}

fn verify_response(line: &str, config: &AuthConfig, method: AuthMethod) -> Result<(), AuthError> {
    let (verb, secret) = line.split_once(' ').ok_or(AuthError::Malformed)?;
    match verb {
        "AUTH" => {
            if !method.accepts_token() {
                return Err(AuthError::MethodNotPermitted);
            }
            let expected = config.token.as_deref().ok_or(AuthError::MethodNotPermitted)?;
            constant_time_eq(expected, secret)
        }
        "PSK_AUTH" => {
            if !method.accepts_psk() {
                return Err(AuthError::MethodNotPermitted);
            }
            let expected = config.psk.as_deref().ok_or(AuthError::MethodNotPermitted)?;
            constant_time_eq(expected, secret)
        }
        _ => Err(AuthError::Malformed),
    }
}

fn constant_time_eq(expected: &str, actual: &str) -> Result<(), AuthError> {
    if expected.as_bytes().ct_eq(actual.as_bytes()).into() {
        Ok(())
    } else {
        Err(AuthError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn reader_of(s: &str) -> BufReader<&[u8]> {
        BufReader::new(s.as_bytes())
    }

    #[tokio::test]
    async fn skips_when_unconfigured() {
        let mut reader = reader_of("");
        let mut out = Vec::new();
        let config = AuthConfig::default();
        handshake(&mut reader, &mut out, &config).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn token_only_greeting_is_backward_compatible() {
        let mut reader = reader_of("AUTH secret\n");
        let mut out = Vec::new();
        let config = AuthConfig {
            token: Some("secret".to_string()),
            psk: None,
        };
        handshake(&mut reader, &mut out, &config).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("AUTH_REQUIRED\n"));
        assert!(text.ends_with("AUTH_OK\n"));
    }

    #[tokio::test]
    async fn both_methods_listed_in_greeting() {
        let mut reader = reader_of("AUTH secret\n");
        let mut out = Vec::new();
        let config = AuthConfig {
            token: Some("secret".to_string()),
            psk: Some("preshared".to_string()),
        };
        handshake(&mut reader, &mut out, &config).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("AUTH_REQUIRED token,psk\n"));
    }

    #[tokio::test]
    async fn wrong_secret_fails() {
        let mut reader = reader_of("AUTH wrong\n");
        let mut out = Vec::new();
        let config = AuthConfig {
            token: Some("secret".to_string()),
            psk: None,
        };
        let err = handshake(&mut reader, &mut out, &config).await.unwrap_err();
        assert!(matches!(err, AuthError::Mismatch));
        assert!(String::from_utf8(out).unwrap().ends_with("AUTH_FAIL\n"));
    }

    #[tokio::test]
    async fn psk_auth_against_token_only_config_is_rejected() {
        let mut reader = reader_of("PSK_AUTH secret\n");
        let mut out = Vec::new();
        let config = AuthConfig {
            token: Some("secret".to_string()),
            psk: None,
        };
        let err = handshake(&mut reader, &mut out, &config).await.unwrap_err();
        assert!(matches!(err, AuthError::MethodNotPermitted));
    }

    #[tokio::test]
    async fn empty_read_fails() {
        let mut reader = reader_of("");
        let mut out = Vec::new();
        let config = AuthConfig {
            token: Some("secret".to_string()),
            psk: None,
        };
        let err = handshake(&mut reader, &mut out, &config).await.unwrap_err();
        assert!(matches!(err, AuthError::EmptyResponse));
    }

    #[tokio::test]
    async fn malformed_line_fails() {
        let mut reader = reader_of("garbage\n");
        let mut out = Vec::new();
        let config = AuthConfig {
            token: Some("secret".to_string()),
            psk: None,
        };
        let err = handshake(&mut reader, &mut out, &config).await.unwrap_err();
        assert!(matches!(err, AuthError::Malformed));
    }
}
