//! Failure taxonomy — every observable machine code of the validation
//! engine, plus the storage error type.

use crate::types::{FraudFlag, FraudType, Severity};
use serde_json::json;
use thiserror::Error;

/// Terminal validation failures. Each variant maps to exactly one machine
/// code surfaced to the checkpoint client.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    // ── Client / input gate ─────────────────────────────────────
    #[error("QR code is missing or not a string")]
    MissingOrInvalidQrCode,
    #[error("QR code exceeds the maximum accepted size")]
    QrCodeTooLarge,
    #[error("scan context is not a valid record")]
    InvalidScanContext,
    #[error("ticket id is required")]
    MissingTicketId,

    // ── Decoding ────────────────────────────────────────────────
    #[error("QR payload matches no supported format")]
    UnsupportedQrFormat,
    #[error("malformed JWT payload: {0}")]
    InvalidJwtFormat(String),
    #[error("malformed JSON payload: {0}")]
    InvalidJsonFormat(String),
    #[error("malformed base64 payload: {0}")]
    InvalidBase64Format(String),
    #[error("malformed PNG payload: {0}")]
    InvalidPngBase64Format(String),
    #[error("JWT algorithm {0} is not accepted")]
    UnsupportedJwtAlgorithm(String),
    #[error("QR version {0} is not accepted")]
    UnsupportedQrVersion(String),
    #[error("structurally invalid claims: {0}")]
    InvalidQrStructure(String),
    #[error("QR code is expired")]
    QrCodeExpired,

    // ── Cryptographic / fraud ───────────────────────────────────
    /// `fraudulent` distinguishes a forged token (HMAC/RSA mismatch) from
    /// a verification that could not run (e.g. no RSA key configured).
    #[error("cryptographic signature verification failed: {detail}")]
    InvalidCryptographicSignature { detail: String, fraudulent: bool },
    #[error("another scan of this QR code is already in flight")]
    ConcurrentScanDetected,
    #[error("checkpoint is at its concurrent scan capacity")]
    TooManyConcurrentScans,
    #[error("fraud pattern analysis blocked this scan")]
    FraudDetected,

    // ── Business (mapped from the rules service) ────────────────
    #[error("ticket is not valid for admission")]
    Invalid,
    #[error("ticket has already been used")]
    AlreadyUsed,
    #[error("ticket is expired")]
    Expired,
    #[error("bearer is not authorized for this event")]
    NotAuthorized,
    #[error("event is not open for admission")]
    EventClosed,

    // ── Offline ─────────────────────────────────────────────────
    #[error("ticket is not present in the offline cache")]
    TicketNotFoundOffline,
    #[error("cached ticket is expired")]
    TicketExpiredOffline,
    #[error("cached ticket is not active")]
    TicketInactiveOffline,
    #[error("offline validation limit reached for this ticket")]
    MaxScansExceededOffline,

    // ── Infrastructure ──────────────────────────────────────────
    #[error("rules service is unavailable")]
    CoreServiceUnavailable,
    #[error("rules service communication failed: {0}")]
    CoreCommunicationError(String),
    #[error("validation failed unexpectedly: {0}")]
    Internal(String),
}

impl ValidationError {
    /// The machine code surfaced in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingOrInvalidQrCode => "MISSING_OR_INVALID_QR_CODE",
            Self::QrCodeTooLarge => "QR_CODE_TOO_LARGE",
            Self::InvalidScanContext => "INVALID_SCAN_CONTEXT",
            Self::MissingTicketId => "MISSING_TICKET_ID",
            Self::UnsupportedQrFormat => "UNSUPPORTED_QR_FORMAT",
            Self::InvalidJwtFormat(_) => "INVALID_JWT_FORMAT",
            Self::InvalidJsonFormat(_) => "INVALID_JSON_FORMAT",
            Self::InvalidBase64Format(_) => "INVALID_BASE64_FORMAT",
            Self::InvalidPngBase64Format(_) => "INVALID_PNG_BASE64_FORMAT",
            Self::UnsupportedJwtAlgorithm(_) => "UNSUPPORTED_JWT_ALGORITHM",
            Self::UnsupportedQrVersion(_) => "UNSUPPORTED_QR_VERSION",
            Self::InvalidQrStructure(_) => "INVALID_QR_STRUCTURE",
            Self::QrCodeExpired => "QR_CODE_EXPIRED",
            Self::InvalidCryptographicSignature { .. } => "INVALID_CRYPTOGRAPHIC_SIGNATURE",
            Self::ConcurrentScanDetected => "CONCURRENT_SCAN_DETECTED",
            Self::TooManyConcurrentScans => "MAX_CONCURRENT_SCANS_EXCEEDED",
            Self::FraudDetected => "FRAUD_DETECTED",
            Self::Invalid => "INVALID",
            Self::AlreadyUsed => "ALREADY_USED",
            Self::Expired => "EXPIRED",
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::EventClosed => "EVENT_CLOSED",
            Self::TicketNotFoundOffline => "TICKET_NOT_FOUND_OFFLINE",
            Self::TicketExpiredOffline => "TICKET_EXPIRED_OFFLINE",
            Self::TicketInactiveOffline => "TICKET_INACTIVE_OFFLINE",
            Self::MaxScansExceededOffline => "MAX_SCANS_EXCEEDED_OFFLINE",
            Self::CoreServiceUnavailable => "CORE_SERVICE_UNAVAILABLE",
            Self::CoreCommunicationError(_) => "CORE_COMMUNICATION_ERROR",
            Self::Internal(_) => "VALIDATION_ERROR",
        }
    }

    /// Fraud flag carried alongside the failure, when the failure itself
    /// is evidence of fraud.
    pub fn fraud_flags(&self) -> Option<FraudFlag> {
        match self {
            Self::InvalidCryptographicSignature { detail, fraudulent: true } => {
                Some(FraudFlag::new(
                    FraudType::ForgedQr,
                    Severity::High,
                    json!({ "details": detail }),
                ))
            }
            Self::ConcurrentScanDetected => Some(FraudFlag::new(
                FraudType::ConcurrentScanAttempt,
                Severity::Medium,
                json!({ "sameQRCode": true }),
            )),
            _ => None,
        }
    }

    /// Whether this failure counts against the fraud statistics.
    pub fn is_fraud(&self) -> bool {
        self.fraud_flags().is_some() || matches!(self, Self::FraudDetected)
    }

    /// The persisted scan-log result for this failure.
    pub fn scan_result_kind(&self) -> crate::types::ScanResultKind {
        use crate::types::ScanResultKind;
        match self {
            Self::QrCodeExpired | Self::Expired | Self::TicketExpiredOffline => {
                ScanResultKind::Expired
            }
            Self::AlreadyUsed => ScanResultKind::AlreadyUsed,
            e if e.is_fraud() => ScanResultKind::FraudDetected,
            _ => ScanResultKind::Invalid,
        }
    }
}

/// Typed persistence failures. The store never retries; callers decide.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ValidationError::QrCodeExpired.code(), "QR_CODE_EXPIRED");
        assert_eq!(
            ValidationError::CoreServiceUnavailable.code(),
            "CORE_SERVICE_UNAVAILABLE"
        );
        assert_eq!(
            ValidationError::ConcurrentScanDetected.code(),
            "CONCURRENT_SCAN_DETECTED"
        );
        assert_eq!(
            ValidationError::UnsupportedJwtAlgorithm("none".into()).code(),
            "UNSUPPORTED_JWT_ALGORITHM"
        );
    }

    #[test]
    fn test_forged_signature_raises_high_severity_flag() {
        let err = ValidationError::InvalidCryptographicSignature {
            detail: "HMAC mismatch".into(),
            fraudulent: true,
        };
        let flag = err.fraud_flags().unwrap();
        assert_eq!(flag.flag_type, FraudType::ForgedQr);
        assert_eq!(flag.severity, Severity::High);
        assert!(err.is_fraud());
    }

    #[test]
    fn test_unverifiable_signature_is_not_fraud() {
        let err = ValidationError::InvalidCryptographicSignature {
            detail: "no RSA public key configured".into(),
            fraudulent: false,
        };
        assert!(err.fraud_flags().is_none());
        assert!(!err.is_fraud());
        assert_eq!(err.code(), "INVALID_CRYPTOGRAPHIC_SIGNATURE");
    }

    #[test]
    fn test_concurrent_scan_flag_details() {
        let flag = ValidationError::ConcurrentScanDetected.fraud_flags().unwrap();
        assert_eq!(flag.flag_type, FraudType::ConcurrentScanAttempt);
        assert_eq!(flag.details["sameQRCode"], true);
    }

    #[test]
    fn test_scan_result_kind_classification() {
        use crate::types::ScanResultKind;
        assert_eq!(
            ValidationError::QrCodeExpired.scan_result_kind(),
            ScanResultKind::Expired
        );
        assert_eq!(
            ValidationError::AlreadyUsed.scan_result_kind(),
            ScanResultKind::AlreadyUsed
        );
        assert_eq!(
            ValidationError::ConcurrentScanDetected.scan_result_kind(),
            ScanResultKind::FraudDetected
        );
        assert_eq!(
            ValidationError::NotAuthorized.scan_result_kind(),
            ScanResultKind::Invalid
        );
    }
}
