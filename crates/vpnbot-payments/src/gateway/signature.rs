//! Webhook signature verification.
//!
//! CloudPayments signs the raw notification body with HMAC-SHA256 keyed by
//! the API secret and sends the base64 digest in the `Content-HMAC` header.
//! Always verify the bytes as received; re-serialized JSON will not match.

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{PaymentError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Compute the base64 HMAC-SHA256 of `payload`
pub fn sign(payload: &[u8], secret: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| PaymentError::Config("invalid webhook secret".into()))?;
    mac.update(payload);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Constant-time check of `signature` against the HMAC of `payload`
pub fn verify(payload: &[u8], signature: &str, secret: &str) -> bool {
    match sign(payload, secret) {
        Ok(expected) => expected.as_bytes().ct_eq(signature.trim().as_bytes()).into(),
        Err(e) => {
            tracing::error!(error = %e, "Cannot compute webhook signature");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "api_secret";

    #[test]
    fn test_valid_signature() {
        let payload = br#"{"TransactionId":"TX123","Status":"Completed"}"#;
        let signature = sign(payload, SECRET).unwrap();
        assert!(verify(payload, &signature, SECRET));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let original = br#"{"TransactionId":"TX123","Status":"Declined"}"#;
        let tampered = br#"{"TransactionId":"TX123","Status":"Completed"}"#;
        let signature = sign(original, SECRET).unwrap();
        assert!(!verify(tampered, &signature, SECRET));
        assert_ne!(sign(tampered, SECRET).unwrap(), signature);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = b"{}";
        let signature = sign(payload, "other_secret").unwrap();
        assert!(!verify(payload, &signature, SECRET));
        assert!(!verify(payload, "", SECRET));
    }
}
