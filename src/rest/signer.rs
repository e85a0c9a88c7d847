use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::errors::DeltaError;

/// Computes Delta's per-request HMAC signatures.
///
/// REST: `HMAC-SHA256(secret, method + timestamp + path + query + body)`
/// rendered as lowercase hex. WebSocket auth signs `GET/realtime{timestamp}`.
/// Timestamps are Unix seconds; the exchange rejects requests outside its
/// clock-skew window.
#[derive(Clone)]
pub struct RequestSigner {
    api_key: Secret<String>,
    api_secret: Secret<String>,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner").finish_non_exhaustive()
    }
}

impl RequestSigner {
    pub fn new(api_key: Secret<String>, api_secret: Secret<String>) -> Self {
        Self {
            api_key,
            api_secret,
        }
    }

    /// Current Unix time in seconds.
    pub fn unix_timestamp() -> Result<u64, DeltaError> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .map_err(|e| DeltaError::Network(format!("system clock before Unix epoch: {}", e)))
    }

    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Sign one REST request. `query` is the raw query string without the
    /// leading `?` (empty when there is none); `body` is the exact payload
    /// that will be transmitted.
    pub fn sign(
        &self,
        method: &str,
        path: &str,
        query: &str,
        body: &str,
        timestamp: u64,
    ) -> Result<String, DeltaError> {
        let payload = format!("{}{}{}{}{}", method, timestamp, path, query, body);
        self.hmac_hex(&payload)
    }

    /// Sign the WebSocket auth payload: `GET/realtime{timestamp}`.
    pub fn sign_ws(&self, timestamp: u64) -> Result<String, DeltaError> {
        self.hmac_hex(&format!("GET/realtime{}", timestamp))
    }

    fn hmac_hex(&self, payload: &str) -> Result<String, DeltaError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.expose_secret().as_bytes())
            .map_err(|e| DeltaError::Auth {
                kind: crate::core::errors::AuthErrorKind::InvalidCredentials,
                message: format!("invalid secret key: {}", e),
            })?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> RequestSigner {
        RequestSigner::new(
            Secret::new("test_key".to_string()),
            Secret::new("test_secret".to_string()),
        )
    }

    #[test]
    fn test_signature_is_deterministic() {
        let s = signer();
        let a = s.sign("GET", "/v2/positions", "", "", 1_700_000_000).unwrap();
        let b = s.sign("GET", "/v2/positions", "", "", 1_700_000_000).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_signature_changes_with_each_input() {
        let s = signer();
        let base = s
            .sign("GET", "/v2/positions", "", "", 1_700_000_000)
            .unwrap();

        assert_ne!(
            base,
            s.sign("POST", "/v2/positions", "", "", 1_700_000_000).unwrap()
        );
        assert_ne!(
            base,
            s.sign("GET", "/v2/orders", "", "", 1_700_000_000).unwrap()
        );
        assert_ne!(
            base,
            s.sign("GET", "/v2/positions", "product_id=1", "", 1_700_000_000)
                .unwrap()
        );
        assert_ne!(
            base,
            s.sign("GET", "/v2/positions", "", "{}", 1_700_000_000).unwrap()
        );
        assert_ne!(
            base,
            s.sign("GET", "/v2/positions", "", "", 1_700_000_001).unwrap()
        );

        let other = RequestSigner::new(
            Secret::new("test_key".to_string()),
            Secret::new("another_secret".to_string()),
        );
        assert_ne!(
            base,
            other.sign("GET", "/v2/positions", "", "", 1_700_000_000).unwrap()
        );
    }

    #[test]
    fn test_ws_signature_depends_on_timestamp() {
        let s = signer();
        let a = s.sign_ws(1_700_000_000).unwrap();
        let b = s.sign_ws(1_700_000_001).unwrap();
        assert_eq!(a, s.sign_ws(1_700_000_000).unwrap());
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_debug_does_not_leak_secrets() {
        let s = signer();
        let debug = format!("{:?}", s);
        assert!(!debug.contains("test_secret"));
        assert!(!debug.contains("test_key"));
    }
}
