use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Operator tokens: `<nonce>.<base64url(HMAC-SHA256(secret, "<action>:<nonce>"))>`.
#[derive(Clone)]
pub struct OperatorAuth {
    secret: Vec<u8>,
}

impl std::fmt::Debug for OperatorAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OperatorAuth([REDACTED])")
    }
}

impl OperatorAuth {
    pub fn new(secret: &str) -> Self {
        Self { secret: secret.as_bytes().to_vec() }
    }

    fn mac(&self, action: &str, nonce: &str) -> Result<HmacSha256, String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|e| format!("HMAC error: {}", e))?;
        mac.update(action.as_bytes());
        mac.update(b":");
        mac.update(nonce.as_bytes());
        Ok(mac)
    }

    pub fn issue(&self, action: &str, nonce: &str) -> Result<String, String> {
        if nonce.is_empty() || nonce.contains('.') {
            return Err("nonce must be non-empty and contain no '.'".to_string());
        }
        let mac = self.mac(action, nonce)?;
        Ok(format!("{}.{}", nonce, URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())))
    }

    /// Returns the nonce when the token is a valid signature for `action`.
    pub fn verify<'t>(&self, action: &str, token: &'t str) -> Option<&'t str> {
        if self.secret.is_empty() {
            return None;
        }
        let (nonce, sig_b64) = token.split_once('.')?;
        let sig = URL_SAFE_NO_PAD.decode(sig_b64).ok()?;
        let mac = self.mac(action, nonce).ok()?;
        mac.verify_slice(&sig).ok().map(|_| nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let auth = OperatorAuth::new("desk-secret");
        let token = auth.issue("reset", "n-1").unwrap();
        assert_eq!(auth.verify("reset", &token), Some("n-1"));
    }

    #[test]
    fn test_token_bound_to_action_and_secret() {
        let auth = OperatorAuth::new("desk-secret");
        let token = auth.issue("arm", "n-1").unwrap();
        assert_eq!(auth.verify("reset", &token), None);
        assert_eq!(OperatorAuth::new("other").verify("arm", &token), None);
        assert_eq!(auth.verify("arm", "garbage"), None);
    }

    #[test]
    fn test_empty_secret_never_verifies() {
        let auth = OperatorAuth::new("");
        let token = auth.issue("reset", "n").unwrap();
        assert_eq!(auth.verify("reset", &token), None);
    }
}
