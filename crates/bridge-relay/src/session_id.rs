use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Derives a deterministic 24-hex-character relay session id from the
/// persistent server secret and an engine name (or the reserved multiplex
/// label). Same inputs always produce the same output, and the id is
/// unpredictable without the secret, so a restarted bridge rejoins its
/// pre-existing relay slot without needing to persist session ids
/// separately.
pub fn derive_session_id(server_secret: &str, label: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(server_secret.as_bytes()).expect("HMAC accepts a key of any length");
    mac.update(label.as_bytes());
    let digest = mac.finalize().into_bytes();
    digest.iter().take(12).map(|b| format!("{b:02x}")).collect()
}

/// The reserved session label used for multiplex (single-port) mode, where
/// one relay session carries every engine.
pub const MULTIPLEX_SESSION_LABEL: &str = "_server_multiplex";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_session_id("secretsecretsecretsecretsecret!!", "stockfish");
        let b = derive_session_id("secretsecretsecretsecretsecret!!", "stockfish");
        assert_eq!(a, b);
        assert_eq!(a.len(), 24);
    }

    #[test]
    fn different_labels_diverge() {
        let a = derive_session_id("secretsecretsecretsecretsecret!!", "stockfish");
        let b = derive_session_id("secretsecretsecretsecretsecret!!", "komodo");
        assert_ne!(a, b);
    }

    #[test]
    fn different_secrets_diverge() {
        let a = derive_session_id("secret-one-secret-one-secret-one", "stockfish");
        let b = derive_session_id("secret-two-secret-two-secret-two", "stockfish");
        assert_ne!(a, b);
    }
}
