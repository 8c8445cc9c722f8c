//! # semblance-crypto
//!
//! Signature codec for action envelopes.
//!
//! The MAC input is the canonical JSON array `[id, timestamp, action, payload]`,
//! so every envelope field is authenticated and the encoding is unambiguous
//! regardless of payload key order. Verification compares in constant time.

pub mod error;

use hmac::{Hmac, Mac};
use semblance_types::{canonicalize, ActionRequest, ActionType};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub use error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Smallest signing key accepted, in bytes.
pub const MIN_KEY_LEN: usize = 32;

/// Shared secret used by the core to sign and the gateway to verify.
///
/// Provisioned out-of-band; never serialized and redacted from `Debug`.
#[derive(Clone)]
pub struct SigningKey {
    secret: Vec<u8>,
}

impl SigningKey {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, CryptoError> {
        let secret = secret.into();
        if secret.len() < MIN_KEY_LEN {
            return Err(CryptoError::KeyTooShort {
                actual: secret.len(),
                minimum: MIN_KEY_LEN,
            });
        }
        Ok(Self { secret })
    }

    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(encoded.trim()).map_err(|_| CryptoError::InvalidKeyEncoding)?;
        Self::new(bytes)
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key size")
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// Bytes covered by the envelope signature.
pub fn signing_input(id: &str, timestamp: &str, action: ActionType, payload: &Value) -> Vec<u8> {
    canonicalize(&json!([id, timestamp, action.as_str(), payload])).into_bytes()
}

/// Hex-encoded HMAC-SHA256 over the full envelope.
pub fn sign(
    key: &SigningKey,
    id: &str,
    timestamp: &str,
    action: ActionType,
    payload: &Value,
) -> String {
    let mut mac = key.mac();
    mac.update(&signing_input(id, timestamp, action, payload));
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of `signature` against the envelope fields.
///
/// Anything that is not valid hex simply fails verification.
pub fn verify(
    key: &SigningKey,
    signature: &str,
    id: &str,
    timestamp: &str,
    action: ActionType,
    payload: &Value,
) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let mut mac = key.mac();
    mac.update(&signing_input(id, timestamp, action, payload));
    mac.verify_slice(&expected).is_ok()
}

/// Sign a request in place, overwriting any previous signature.
pub fn sign_request(key: &SigningKey, request: &mut ActionRequest) {
    request.signature = sign(
        key,
        &request.id,
        &request.timestamp,
        request.action,
        &request.payload,
    );
}

pub fn verify_request(key: &SigningKey, request: &ActionRequest) -> bool {
    verify(
        key,
        &request.signature,
        &request.id,
        &request.timestamp,
        request.action,
        &request.payload,
    )
}

/// Lower-case hex SHA-256 digest.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(bytes.as_ref()))
}

/// SHA-256 of the canonical form of a JSON value.
pub fn hash_canonical(value: &Value) -> String {
    sha256_hex(canonicalize(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key() -> SigningKey {
        SigningKey::new(vec![7u8; 32]).unwrap()
    }

    fn payload() -> Value {
        json!({"url": "https://example.com/a", "method": "GET"})
    }

    #[test]
    fn sign_then_verify() {
        let sig = sign(&key(), "r1", "2026-10-17T12:00:00Z", ActionType::WebFetch, &payload());
        assert_eq!(sig.len(), 64);
        assert!(verify(
            &key(),
            &sig,
            "r1",
            "2026-10-17T12:00:00Z",
            ActionType::WebFetch,
            &payload()
        ));
    }

    #[test]
    fn every_envelope_field_is_covered() {
        let ts = "2026-10-17T12:00:00Z";
        let sig = sign(&key(), "r1", ts, ActionType::WebFetch, &payload());

        assert!(!verify(&key(), &sig, "r2", ts, ActionType::WebFetch, &payload()));
        assert!(!verify(
            &key(),
            &sig,
            "r1",
            "2026-10-17T12:00:01Z",
            ActionType::WebFetch,
            &payload()
        ));
        assert!(!verify(&key(), &sig, "r1", ts, ActionType::WebSearch, &payload()));
        assert!(!verify(
            &key(),
            &sig,
            "r1",
            ts,
            ActionType::WebFetch,
            &json!({"url": "https://evil.com"})
        ));
    }

    #[test]
    fn payload_key_order_is_irrelevant() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
        let ts = "2026-10-17T12:00:00Z";
        assert_eq!(
            sign(&key(), "r1", ts, ActionType::WebFetch, &a),
            sign(&key(), "r1", ts, ActionType::WebFetch, &b)
        );
    }

    #[test]
    fn wrong_key_and_garbage_fail() {
        let other = SigningKey::new(vec![9u8; 32]).unwrap();
        let ts = "2026-10-17T12:00:00Z";
        let sig = sign(&key(), "r1", ts, ActionType::WebFetch, &payload());
        assert!(!verify(&other, &sig, "r1", ts, ActionType::WebFetch, &payload()));
        assert!(!verify(&key(), "not-hex", "r1", ts, ActionType::WebFetch, &payload()));
    }

    #[test]
    fn short_keys_are_refused() {
        assert!(matches!(
            SigningKey::new(vec![1u8; 8]),
            Err(CryptoError::KeyTooShort { actual: 8, .. })
        ));
        assert!(SigningKey::from_hex("zz").is_err());
        assert!(SigningKey::from_hex(&"ab".repeat(32)).is_ok());
    }

    #[test]
    fn debug_redacts_secret() {
        assert_eq!(format!("{:?}", key()), "SigningKey(<redacted>)");
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    proptest! {
        #[test]
        fn flipping_any_id_byte_breaks_signature(id in "[a-z0-9]{1,24}", idx in 0usize..24) {
            let ts = "2026-10-17T12:00:00Z";
            let sig = sign(&key(), &id, ts, ActionType::EmailSend, &payload());
            let mut tampered = id.clone().into_bytes();
            let i = idx % tampered.len();
            tampered[i] = if tampered[i] == b'x' { b'y' } else { b'x' };
            let tampered = String::from_utf8(tampered).unwrap();
            prop_assert!(!verify(&key(), &sig, &tampered, ts, ActionType::EmailSend, &payload()));
        }
    }
}
