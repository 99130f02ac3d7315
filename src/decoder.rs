//! QR decoder — multi-format intake, signature verification, structural
//! and temporal validity.
//!
//! Detection is ordered and cheap: JWT dot-structure first, then the PNG
//! data URL, then base64url JSON, then raw JSON. Every format normalizes
//! to the same raw claims document before a single verification pipeline
//! runs over it. Legacy `{id, createdAt}` documents are a normalization
//! step, not a separate validator.

use crate::config::Config;
use crate::crypto;
use crate::error::ValidationError;
use crate::types::{DecodedTicket, QrAlgorithm, QrFormat, TicketClaims, TicketType, ValidationInfo};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Map, Value};
use std::time::Duration;

const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Everything the decoder needs, lifted out of the service `Config`.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub secret: String,
    pub public_key: Option<String>,
    pub max_validity: Duration,
    pub max_size: usize,
    pub supported_versions: Vec<String>,
    pub supported_algorithms: Vec<QrAlgorithm>,
}

impl DecoderConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            secret: config.qr_hmac_secret.clone(),
            public_key: config.qr_rsa_public_key.clone(),
            max_validity: config.qr_max_validity,
            max_size: config.qr_max_size,
            supported_versions: config.qr_supported_versions.clone(),
            supported_algorithms: vec![QrAlgorithm::HS256, QrAlgorithm::RS256],
        }
    }
}

/// Decode a QR payload and verify it end to end.
///
/// Deterministic and side-effect-free: the same payload, configuration and
/// `now` always produce the same result.
pub fn decode_and_verify(
    payload: &str,
    config: &DecoderConfig,
    now: DateTime<Utc>,
) -> Result<DecodedTicket, ValidationError> {
    if payload.is_empty() {
        return Err(ValidationError::MissingOrInvalidQrCode);
    }
    if payload.len() > config.max_size {
        return Err(ValidationError::QrCodeTooLarge);
    }

    let detected = detect_format(payload).ok_or(ValidationError::UnsupportedQrFormat)?;
    let (mut claims, embedded_format) = decode_format(payload, detected, config, 0)?;
    // A PNG wraps one of the textual formats; the wrapper, not the inner
    // document, decides which signing bases are acceptable.
    let format = if embedded_format.is_some() {
        QrFormat::PngBase64
    } else {
        detected
    };

    let legacy = normalize_legacy(&mut claims, config.max_validity);

    let (algorithm, method) = verify_signature(&claims, format, legacy, config)?;
    let ticket = validate_structure(&claims, algorithm, config)?;
    validate_temporal(&ticket, config.max_validity, now)?;

    let version = ticket.version.clone();
    Ok(DecodedTicket {
        claims: ticket,
        validation_info: ValidationInfo {
            format_type: format,
            algorithm,
            version,
            validated_at: now,
            cryptographic_method: method,
        },
    })
}

/// Ordered format detection.
pub fn detect_format(payload: &str) -> Option<QrFormat> {
    let segments: Vec<&str> = payload.split('.').collect();
    if segments.len() == 3 && segments.iter().all(|s| !s.is_empty()) {
        return Some(QrFormat::Jwt);
    }
    if payload.starts_with(PNG_DATA_URL_PREFIX) {
        return Some(QrFormat::PngBase64);
    }
    if let Ok(bytes) = crypto::base64url_decode(payload) {
        if serde_json::from_slice::<Value>(&bytes)
            .map(|v| v.is_object())
            .unwrap_or(false)
        {
            return Some(QrFormat::Base64);
        }
    }
    if serde_json::from_str::<Value>(payload)
        .map(|v| v.is_object())
        .unwrap_or(false)
    {
        return Some(QrFormat::Json);
    }
    None
}

/// Decode one format into the raw claims document. For PNG the returned
/// option carries the embedded payload's own format.
fn decode_format(
    payload: &str,
    format: QrFormat,
    config: &DecoderConfig,
    depth: u8,
) -> Result<(Map<String, Value>, Option<QrFormat>), ValidationError> {
    match format {
        QrFormat::Jwt => decode_jwt(payload, config).map(|m| (m, None)),
        QrFormat::PngBase64 => decode_png(payload, config, depth),
        QrFormat::Base64 => decode_base64(payload).map(|m| (m, None)),
        QrFormat::Json => decode_json(payload).map(|m| (m, None)),
    }
}

fn decode_jwt(payload: &str, config: &DecoderConfig) -> Result<Map<String, Value>, ValidationError> {
    let segments: Vec<&str> = payload.split('.').collect();
    let [header_b64, body_b64, signature] = segments[..] else {
        return Err(ValidationError::InvalidJwtFormat("expected 3 segments".into()));
    };

    let header_bytes = crypto::base64url_decode(header_b64)
        .map_err(|e| ValidationError::InvalidJwtFormat(format!("header: {e}")))?;
    let header: Map<String, Value> = serde_json::from_slice(&header_bytes)
        .map_err(|e| ValidationError::InvalidJwtFormat(format!("header: {e}")))?;

    let alg = header
        .get("alg")
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::InvalidJwtFormat("header missing alg".into()))?;
    let parsed_alg = QrAlgorithm::parse(alg)
        .filter(|a| config.supported_algorithms.contains(a))
        .ok_or_else(|| ValidationError::UnsupportedJwtAlgorithm(alg.to_string()))?;

    let body_bytes = crypto::base64url_decode(body_b64)
        .map_err(|e| ValidationError::InvalidJwtFormat(format!("payload: {e}")))?;
    let mut claims: Map<String, Value> = serde_json::from_slice(&body_bytes)
        .map_err(|e| ValidationError::InvalidJwtFormat(format!("payload: {e}")))?;

    // Header fields merge into the claims: alg wins over any in-body
    // algorithm claim, version only fills a gap.
    claims.insert("algorithm".into(), Value::String(parsed_alg.as_str().into()));
    if let Some(version) = header.get("version") {
        claims.entry("version").or_insert_with(|| version.clone());
    }
    claims.insert("signature".into(), Value::String(signature.to_string()));

    Ok(claims)
}

fn decode_png(
    payload: &str,
    config: &DecoderConfig,
    depth: u8,
) -> Result<(Map<String, Value>, Option<QrFormat>), ValidationError> {
    if depth > 0 {
        return Err(ValidationError::InvalidPngBase64Format(
            "nested image payload".into(),
        ));
    }

    let encoded = &payload[PNG_DATA_URL_PREFIX.len()..];
    let bytes = crypto::base64_standard_decode(encoded)
        .map_err(|e| ValidationError::InvalidPngBase64Format(format!("base64: {e}")))?;

    let img = image::load_from_memory(&bytes)
        .map_err(|e| ValidationError::InvalidPngBase64Format(format!("image: {e}")))?
        .to_luma8();

    let mut prepared = rqrr::PreparedImage::prepare(img);
    let grids = prepared.detect_grids();
    let grid = grids
        .first()
        .ok_or_else(|| ValidationError::InvalidPngBase64Format("no QR symbol found".into()))?;
    let (_, content) = grid
        .decode()
        .map_err(|e| ValidationError::InvalidPngBase64Format(format!("symbol: {e}")))?;

    let inner_format =
        detect_format(&content).ok_or(ValidationError::UnsupportedQrFormat)?;
    let (claims, _) = decode_format(&content, inner_format, config, depth + 1)?;
    Ok((claims, Some(inner_format)))
}

fn decode_base64(payload: &str) -> Result<Map<String, Value>, ValidationError> {
    let bytes = crypto::base64url_decode(payload)
        .map_err(|e| ValidationError::InvalidBase64Format(e.to_string()))?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ValidationError::InvalidBase64Format(
            "decoded document is not an object".into(),
        )),
        Err(e) => Err(ValidationError::InvalidBase64Format(e.to_string())),
    }
}

fn decode_json(payload: &str) -> Result<Map<String, Value>, ValidationError> {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ValidationError::InvalidJsonFormat(
            "document is not an object".into(),
        )),
        Err(e) => Err(ValidationError::InvalidJsonFormat(e.to_string())),
    }
}

/// Normalize legacy `{id, createdAt}` documents in place. Returns whether
/// normalization applied, which widens the accepted signing bases.
fn normalize_legacy(claims: &mut Map<String, Value>, max_validity: Duration) -> bool {
    let mut legacy = false;

    if !claims.contains_key("ticketId") {
        if let Some(id) = claims.get("id").cloned() {
            claims.insert("ticketId".into(), id);
            legacy = true;
        }
    }
    if !claims.contains_key("issuedAt") {
        if let Some(created) = claims.get("createdAt").cloned() {
            claims.insert("issuedAt".into(), created);
            legacy = true;
        }
    }
    if legacy && !claims.contains_key("expiresAt") {
        if let Some(issued) = claims.get("issuedAt").and_then(parse_instant) {
            let expires = issued + ChronoDuration::seconds(max_validity.as_secs() as i64);
            claims.insert(
                "expiresAt".into(),
                Value::String(expires.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            );
        }
    }

    legacy
}

/// Verify the presented signature. Pure in the claims bytes and the
/// configured key material.
fn verify_signature(
    claims: &Map<String, Value>,
    format: QrFormat,
    legacy: bool,
    config: &DecoderConfig,
) -> Result<(QrAlgorithm, &'static str), ValidationError> {
    let algorithm = match claims.get("algorithm").and_then(Value::as_str) {
        None => QrAlgorithm::HS256,
        Some(s) => QrAlgorithm::parse(s)
            .filter(|a| config.supported_algorithms.contains(a))
            .ok_or_else(|| ValidationError::UnsupportedJwtAlgorithm(s.to_string()))?,
    };

    let signature = claims
        .get("signature")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ValidationError::InvalidQrStructure("signature missing".into()))?;

    let canonical = crypto::canonical_signature_string(claims);
    // Tokens minted from legacy records or re-encoded through a PNG sign
    // the JSON document instead of the pipe string.
    let json_base_accepted = legacy || format == QrFormat::PngBase64;

    match algorithm {
        QrAlgorithm::HS256 => {
            let expected = crypto::hmac_sha256_hex(&config.secret, &canonical);
            if crypto::constant_time_eq(signature, &expected) {
                return Ok((algorithm, "HMAC-SHA256"));
            }
            if json_base_accepted {
                let json_base = crypto::canonical_json_without_signature(claims);
                let expected = crypto::hmac_sha256_hex(&config.secret, &json_base);
                if crypto::constant_time_eq(signature, &expected) {
                    return Ok((algorithm, "HMAC-SHA256"));
                }
            }
            Err(ValidationError::InvalidCryptographicSignature {
                detail: "HMAC signature mismatch".into(),
                fraudulent: true,
            })
        }
        QrAlgorithm::RS256 => {
            let Some(ref pem) = config.public_key else {
                return Err(ValidationError::InvalidCryptographicSignature {
                    detail: "no RSA public key configured".into(),
                    fraudulent: false,
                });
            };
            let verified = crypto::verify_rs256(pem, &canonical, signature).map_err(|e| {
                ValidationError::InvalidCryptographicSignature { detail: e, fraudulent: false }
            })?;
            if verified {
                Ok((algorithm, "RSA-SHA256"))
            } else {
                Err(ValidationError::InvalidCryptographicSignature {
                    detail: "RSA signature mismatch".into(),
                    fraudulent: true,
                })
            }
        }
    }
}

/// Structural validation: required fields, enum membership, instant
/// parsing, issuance ordering, version support.
fn validate_structure(
    claims: &Map<String, Value>,
    algorithm: QrAlgorithm,
    config: &DecoderConfig,
) -> Result<TicketClaims, ValidationError> {
    let ticket_id = require_string(claims, "ticketId")?;
    let event_id = require_string(claims, "eventId")?;

    let ticket_type_raw = require_string(claims, "ticketType")?;
    let ticket_type = TicketType::parse(&ticket_type_raw).ok_or_else(|| {
        ValidationError::InvalidQrStructure(format!("unknown ticketType {ticket_type_raw}"))
    })?;

    let issued_at = claims
        .get("issuedAt")
        .and_then(parse_instant)
        .ok_or_else(|| ValidationError::InvalidQrStructure("issuedAt unparseable".into()))?;
    let expires_at = claims
        .get("expiresAt")
        .and_then(parse_instant)
        .ok_or_else(|| ValidationError::InvalidQrStructure("expiresAt unparseable".into()))?;
    if issued_at >= expires_at {
        return Err(ValidationError::InvalidQrStructure(
            "expiresAt must be after issuedAt".into(),
        ));
    }

    let version = claims
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or("1.0")
        .to_string();
    if !config.supported_versions.contains(&version) {
        return Err(ValidationError::UnsupportedQrVersion(version));
    }

    Ok(TicketClaims {
        ticket_id,
        event_id,
        ticket_type,
        user_id: claims
            .get("userId")
            .and_then(Value::as_str)
            .map(str::to_string),
        issued_at,
        expires_at,
        version,
        algorithm,
        signature: claims
            .get("signature")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        metadata: claims.get("metadata").cloned().unwrap_or(Value::Null),
        raw: Value::Object(claims.clone()),
    })
}

fn validate_temporal(
    ticket: &TicketClaims,
    max_validity: Duration,
    now: DateTime<Utc>,
) -> Result<(), ValidationError> {
    if now > ticket.expires_at {
        return Err(ValidationError::QrCodeExpired);
    }
    let age = now - ticket.issued_at;
    if age > ChronoDuration::seconds(max_validity.as_secs() as i64) {
        return Err(ValidationError::QrCodeExpired);
    }
    Ok(())
}

fn require_string(claims: &Map<String, Value>, field: &str) -> Result<String, ValidationError> {
    claims
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ValidationError::InvalidQrStructure(format!("{field} missing")))
}

/// Instants arrive as RFC3339 strings or epoch seconds.
fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use serde_json::json;

    fn test_config() -> DecoderConfig {
        DecoderConfig {
            secret: "turnstile-dev-secret".into(),
            public_key: None,
            max_validity: Duration::from_secs(365 * 24 * 3600),
            max_size: 32768,
            supported_versions: vec!["1.0".into(), "1.1".into(), "2.0".into()],
            supported_algorithms: vec![QrAlgorithm::HS256, QrAlgorithm::RS256],
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-28T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn base_claims() -> Map<String, Value> {
        json!({
            "ticketId": "T1",
            "eventId": "E1",
            "ticketType": "standard",
            "userId": "U1",
            "issuedAt": "2026-01-28T09:00:00Z",
            "expiresAt": "2026-12-31T23:59:59Z",
            "version": "1.0",
        })
        .as_object()
        .unwrap()
        .clone()
    }

    /// A signed three-segment token over the merged (header + payload)
    /// claims, as the issuer produces them.
    fn hs256_jwt(mut claims: Map<String, Value>, secret: &str) -> String {
        claims.insert("algorithm".into(), "HS256".into());
        let signature =
            crypto::hmac_sha256_hex(secret, &crypto::canonical_signature_string(&claims));

        claims.remove("algorithm");
        let version = claims.remove("version").unwrap_or_else(|| "1.0".into());
        let header = json!({ "alg": "HS256", "typ": "QR", "version": version });
        format!(
            "{}.{}.{}",
            crypto::base64url_encode(header.to_string().as_bytes()),
            crypto::base64url_encode(Value::Object(claims).to_string().as_bytes()),
            signature
        )
    }

    fn signed_json(mut claims: Map<String, Value>, secret: &str) -> String {
        claims.insert("algorithm".into(), "HS256".into());
        let signature =
            crypto::hmac_sha256_hex(secret, &crypto::canonical_signature_string(&claims));
        claims.insert("signature".into(), Value::String(signature));
        Value::Object(claims).to_string()
    }

    #[test]
    fn test_detect_format_ordering() {
        assert_eq!(detect_format("a.b.c"), Some(QrFormat::Jwt));
        assert_eq!(
            detect_format("data:image/png;base64,iVBOR"),
            Some(QrFormat::PngBase64)
        );
        let b64 = crypto::base64url_encode(b"{\"ticketId\":\"T1\"}");
        assert_eq!(detect_format(&b64), Some(QrFormat::Base64));
        assert_eq!(detect_format("{\"ticketId\":\"T1\"}"), Some(QrFormat::Json));
        assert_eq!(detect_format("not a ticket"), None);
        assert_eq!(detect_format("a..c"), None);
    }

    #[test]
    fn test_jwt_happy_path() {
        let token = hs256_jwt(base_claims(), "turnstile-dev-secret");
        let decoded = decode_and_verify(&token, &test_config(), now()).unwrap();
        assert_eq!(decoded.claims.ticket_id, "T1");
        assert_eq!(decoded.claims.event_id, "E1");
        assert_eq!(decoded.claims.ticket_type, TicketType::Standard);
        assert_eq!(decoded.claims.user_id.as_deref(), Some("U1"));
        assert_eq!(decoded.validation_info.format_type, QrFormat::Jwt);
        assert_eq!(decoded.validation_info.cryptographic_method, "HMAC-SHA256");
    }

    #[test]
    fn test_decode_is_deterministic() {
        let token = hs256_jwt(base_claims(), "turnstile-dev-secret");
        let a = decode_and_verify(&token, &test_config(), now()).unwrap();
        let b = decode_and_verify(&token, &test_config(), now()).unwrap();
        assert_eq!(a.claims.raw, b.claims.raw);
    }

    #[test]
    fn test_tampered_signature_is_forged() {
        let token = hs256_jwt(base_claims(), "turnstile-dev-secret");
        let (head, _) = token.rsplit_once('.').unwrap();
        let forged = format!("{head}.{}", crypto::hmac_sha256_hex("wrong-secret", "x"));

        let err = decode_and_verify(&forged, &test_config(), now()).unwrap_err();
        assert_eq!(err.code(), "INVALID_CRYPTOGRAPHIC_SIGNATURE");
        let flag = err.fraud_flags().expect("forged token raises a fraud flag");
        assert_eq!(flag.flag_type, crate::types::FraudType::ForgedQr);
    }

    #[test]
    fn test_tampered_payload_is_forged() {
        let mut tampered = base_claims();
        let token = hs256_jwt(base_claims(), "turnstile-dev-secret");
        tampered.insert("ticketType".into(), "vip".into());
        let body = crypto::base64url_encode(
            Value::Object(tampered.clone()).to_string().as_bytes(),
        );
        let parts: Vec<&str> = token.split('.').collect();
        let swapped = format!("{}.{}.{}", parts[0], body, parts[2]);

        let err = decode_and_verify(&swapped, &test_config(), now()).unwrap_err();
        assert_eq!(err.code(), "INVALID_CRYPTOGRAPHIC_SIGNATURE");
    }

    #[test]
    fn test_unsupported_jwt_algorithm() {
        let header = json!({ "alg": "none", "version": "1.0" });
        let token = format!(
            "{}.{}.sig",
            crypto::base64url_encode(header.to_string().as_bytes()),
            crypto::base64url_encode(b"{}"),
        );
        let err = decode_and_verify(&token, &test_config(), now()).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_JWT_ALGORITHM");
    }

    #[test]
    fn test_json_format_happy_path() {
        let payload = signed_json(base_claims(), "turnstile-dev-secret");
        let decoded = decode_and_verify(&payload, &test_config(), now()).unwrap();
        assert_eq!(decoded.validation_info.format_type, QrFormat::Json);
        assert_eq!(decoded.claims.ticket_id, "T1");
    }

    #[test]
    fn test_base64_format_happy_path() {
        let payload = signed_json(base_claims(), "turnstile-dev-secret");
        let encoded = crypto::base64url_encode(payload.as_bytes());
        let decoded = decode_and_verify(&encoded, &test_config(), now()).unwrap();
        assert_eq!(decoded.validation_info.format_type, QrFormat::Base64);
    }

    #[test]
    fn test_legacy_document_normalization() {
        // Legacy issuers sign the JSON document, use {id, createdAt}, and
        // omit the expiry.
        let mut claims = json!({
            "id": "LEGACY-1",
            "eventId": "E1",
            "ticketType": "standard",
            "createdAt": "2026-01-28T09:00:00Z",
        })
        .as_object()
        .unwrap()
        .clone();

        let mut signing_base = claims.clone();
        signing_base.insert("ticketId".into(), "LEGACY-1".into());
        signing_base.insert("issuedAt".into(), "2026-01-28T09:00:00Z".into());
        signing_base.insert(
            "expiresAt".into(),
            "2026-01-29T09:00:00Z".into(),
        );
        let config = DecoderConfig {
            max_validity: Duration::from_secs(86400),
            ..test_config()
        };
        // The accepted JSON signing base is the document as it stands
        // after normalization, so the expected digest is computed over
        // the legacy fields plus their normalized mirrors.
        let signature = crypto::hmac_sha256_hex(
            &config.secret,
            &crypto::canonical_json_without_signature(&signing_base),
        );
        claims.insert("signature".into(), Value::String(signature));

        let decoded =
            decode_and_verify(&Value::Object(claims).to_string(), &config, now()).unwrap();
        assert_eq!(decoded.claims.ticket_id, "LEGACY-1");
        assert_eq!(
            decoded.claims.expires_at,
            decoded.claims.issued_at + ChronoDuration::seconds(86400)
        );
    }

    #[test]
    fn test_expired_token() {
        let mut claims = base_claims();
        claims.insert("expiresAt".into(), "2026-01-27T23:59:59Z".into());
        let token = hs256_jwt(claims, "turnstile-dev-secret");
        let err = decode_and_verify(&token, &test_config(), now()).unwrap_err();
        assert_eq!(err.code(), "QR_CODE_EXPIRED");
    }

    #[test]
    fn test_token_older_than_max_validity_is_expired() {
        let config = DecoderConfig {
            max_validity: Duration::from_secs(1800),
            ..test_config()
        };
        // Issued an hour ago against a 30-minute validity window.
        let token = hs256_jwt(base_claims(), "turnstile-dev-secret");
        let err = decode_and_verify(&token, &config, now()).unwrap_err();
        assert_eq!(err.code(), "QR_CODE_EXPIRED");
    }

    #[test]
    fn test_issued_equals_expires_rejected() {
        let mut claims = base_claims();
        claims.insert("issuedAt".into(), "2026-01-28T09:00:00Z".into());
        claims.insert("expiresAt".into(), "2026-01-28T09:00:00Z".into());
        let token = hs256_jwt(claims, "turnstile-dev-secret");
        let err = decode_and_verify(&token, &test_config(), now()).unwrap_err();
        assert_eq!(err.code(), "INVALID_QR_STRUCTURE");
    }

    #[test]
    fn test_missing_user_id_accepted() {
        let mut claims = base_claims();
        claims.remove("userId");
        let token = hs256_jwt(claims, "turnstile-dev-secret");
        let decoded = decode_and_verify(&token, &test_config(), now()).unwrap();
        assert!(decoded.claims.user_id.is_none());
    }

    #[test]
    fn test_unknown_ticket_type_rejected() {
        let mut claims = base_claims();
        claims.insert("ticketType".into(), "backstage".into());
        let token = hs256_jwt(claims, "turnstile-dev-secret");
        let err = decode_and_verify(&token, &test_config(), now()).unwrap_err();
        assert_eq!(err.code(), "INVALID_QR_STRUCTURE");
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut claims = base_claims();
        claims.insert("version".into(), "9.9".into());
        let token = hs256_jwt(claims, "turnstile-dev-secret");
        let err = decode_and_verify(&token, &test_config(), now()).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_QR_VERSION");
    }

    #[test]
    fn test_size_gate_boundaries() {
        let config = DecoderConfig { max_size: 64, ..test_config() };
        let exactly = "x".repeat(64);
        // Exactly max_size passes the gate (and fails later on format).
        let err = decode_and_verify(&exactly, &config, now()).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_QR_FORMAT");

        let over = "x".repeat(65);
        let err = decode_and_verify(&over, &config, now()).unwrap_err();
        assert_eq!(err.code(), "QR_CODE_TOO_LARGE");
    }

    #[test]
    fn test_empty_payload_rejected() {
        let err = decode_and_verify("", &test_config(), now()).unwrap_err();
        assert_eq!(err.code(), "MISSING_OR_INVALID_QR_CODE");
    }

    #[test]
    fn test_rs256_without_key_is_not_fraud() {
        let mut claims = base_claims();
        claims.insert("algorithm".into(), "RS256".into());
        claims.insert("signature".into(), "c2lnbmF0dXJl".into());
        let payload = Value::Object(claims).to_string();

        let err = decode_and_verify(&payload, &test_config(), now()).unwrap_err();
        assert_eq!(err.code(), "INVALID_CRYPTOGRAPHIC_SIGNATURE");
        assert!(err.fraud_flags().is_none());
    }

    #[test]
    fn test_png_with_invalid_base64_rejected() {
        let err = decode_and_verify(
            "data:image/png;base64,!!not-base64!!",
            &test_config(),
            now(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_PNG_BASE64_FORMAT");
    }

    #[test]
    fn test_png_with_non_image_bytes_rejected() {
        let payload = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(b"plainly not a png")
        );
        let err = decode_and_verify(&payload, &test_config(), now()).unwrap_err();
        assert_eq!(err.code(), "INVALID_PNG_BASE64_FORMAT");
    }

    #[test]
    fn test_missing_signature_is_structural() {
        let mut claims = base_claims();
        claims.insert("algorithm".into(), "HS256".into());
        let payload = Value::Object(claims).to_string();
        let err = decode_and_verify(&payload, &test_config(), now()).unwrap_err();
        assert_eq!(err.code(), "INVALID_QR_STRUCTURE");
    }

    #[test]
    fn test_epoch_second_instants_accepted() {
        // 2026-01-28T09:00:00Z as epoch seconds.
        let parsed = parse_instant(&json!(1769590800)).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-01-28T09:00:00+00:00");
        assert!(parse_instant(&json!(["not", "an", "instant"])).is_none());
        assert!(parse_instant(&json!("yesterday")).is_none());
    }
}
