//! Cryptographic primitives and codec helpers for QR token verification.
//!
//! Everything here is pure: a verification result depends only on the
//! input bytes and the configured key material.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Field order of the canonical signature string. This is a contract with
/// the QR-issuing service; any divergence silently rejects all tokens.
pub const SIGNATURE_FIELDS: [&str; 8] = [
    "ticketId",
    "eventId",
    "ticketType",
    "userId",
    "issuedAt",
    "expiresAt",
    "version",
    "algorithm",
];

/// Lowercase hex HMAC-SHA256 digest of `message` under `secret`.
pub fn hmac_sha256_hex(secret: &str, message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time string equality. Unequal lengths still run a comparison
/// so the mismatch is not observable through timing.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        let _ = a.ct_eq(a);
        return false;
    }
    a.ct_eq(b).into()
}

/// Verify an RSA PKCS#1 v1.5 / SHA-256 signature over `message`.
///
/// The PEM key is accepted in SPKI (PKCS#8) or PKCS#1 form; the signature
/// string in base64url, standard base64, or hex.
pub fn verify_rs256(public_key_pem: &str, message: &str, signature: &str) -> Result<bool, String> {
    let key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_key_pem))
        .map_err(|e| format!("unparseable RSA public key: {e}"))?;

    let Some(sig_bytes) = decode_signature_bytes(signature) else {
        return Ok(false);
    };

    let digest = Sha256::digest(message.as_bytes());
    Ok(key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &sig_bytes)
        .is_ok())
}

fn decode_signature_bytes(signature: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(signature)
        .or_else(|_| STANDARD.decode(signature))
        .ok()
        .or_else(|| hex::decode(signature).ok())
}

pub fn base64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn base64url_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    // Tolerate padded input from issuers that keep the trailing '='.
    URL_SAFE_NO_PAD.decode(input.trim_end_matches('='))
}

pub fn base64_standard_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(input)
}

/// Render one claim scalar the way the issuer emitted it: strings bare,
/// numbers and booleans via their JSON form, null/missing empty.
fn scalar_to_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Null) | None => String::new(),
        // Structured values never participate in the signature string.
        Some(other) => other.to_string(),
    }
}

/// The pipe-joined canonical signature string:
/// `ticketId|eventId|ticketType|userId|issuedAt|expiresAt|version|algorithm`.
pub fn canonical_signature_string(claims: &Map<String, Value>) -> String {
    SIGNATURE_FIELDS
        .iter()
        .map(|field| scalar_to_string(claims.get(*field)))
        .collect::<Vec<_>>()
        .join("|")
}

/// Canonical JSON rendering of the claims without the signature field.
/// serde_json maps serialize with sorted keys, which is the canonical
/// ordering both ends agree on.
pub fn canonical_json_without_signature(claims: &Map<String, Value>) -> String {
    let mut stripped = claims.clone();
    stripped.remove("signature");
    Value::Object(stripped).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // RFC 4231 test case 2.
    #[test]
    fn test_hmac_sha256_known_vector() {
        let digest = hmac_sha256_hex("Jefe", "what do ya want for nothing?");
        assert_eq!(
            digest,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_hmac_is_deterministic() {
        let a = hmac_sha256_hex("secret", "payload");
        let b = hmac_sha256_hex("secret", "payload");
        assert_eq!(a, b);
        assert_ne!(a, hmac_sha256_hex("other-secret", "payload"));
        assert_ne!(a, hmac_sha256_hex("secret", "payload!"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abcdef", "abcdef"));
        assert!(!constant_time_eq("abcdef", "abcdeg"));
        assert!(!constant_time_eq("abc", "abcdef"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_base64url_round_trip() {
        let data = b"{\"ticketId\":\"T1\"}";
        let encoded = base64url_encode(data);
        assert!(!encoded.contains('='));
        assert_eq!(base64url_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_base64url_accepts_padded_input() {
        let padded = STANDARD.encode(b"hello").replace('+', "-").replace('/', "_");
        assert_eq!(base64url_decode(&padded).unwrap(), b"hello");
    }

    #[test]
    fn test_canonical_signature_string_field_order() {
        let claims = json!({
            "ticketId": "T1",
            "eventId": "E1",
            "ticketType": "standard",
            "userId": "U1",
            "issuedAt": "2026-01-28T10:00:00Z",
            "expiresAt": "2026-12-31T23:59:59Z",
            "version": "1.0",
            "algorithm": "HS256",
        });
        let s = canonical_signature_string(claims.as_object().unwrap());
        assert_eq!(
            s,
            "T1|E1|standard|U1|2026-01-28T10:00:00Z|2026-12-31T23:59:59Z|1.0|HS256"
        );
    }

    #[test]
    fn test_canonical_signature_string_missing_fields_are_empty() {
        let claims = json!({ "ticketId": "T1", "eventId": "E1" });
        let s = canonical_signature_string(claims.as_object().unwrap());
        assert_eq!(s, "T1|E1||||||");
    }

    #[test]
    fn test_canonical_signature_string_preserves_numeric_rendering() {
        // An issuer that sends epoch seconds signs the digits, not a
        // reformatted instant.
        let claims = json!({ "ticketId": "T1", "issuedAt": 1769594400 });
        let s = canonical_signature_string(claims.as_object().unwrap());
        assert_eq!(s, "T1||||1769594400|||");
    }

    #[test]
    fn test_canonical_json_excludes_signature_and_sorts_keys() {
        let claims = json!({
            "ticketId": "T1",
            "signature": "deadbeef",
            "eventId": "E1",
        });
        let s = canonical_json_without_signature(claims.as_object().unwrap());
        assert_eq!(s, "{\"eventId\":\"E1\",\"ticketId\":\"T1\"}");
    }

    #[test]
    fn test_verify_rs256_rejects_garbage_key() {
        let err = verify_rs256("not a pem", "msg", "c2ln");
        assert!(err.is_err());
    }
}
