//! Shared domain types — ticket claims, scan context, fraud flags,
//! validation outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Admission classes a ticket can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketType {
    Standard,
    Vip,
    Premium,
    #[serde(rename = "early-bird")]
    EarlyBird,
    Student,
    Staff,
}

impl TicketType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(Self::Standard),
            "vip" => Some(Self::Vip),
            "premium" => Some(Self::Premium),
            "early-bird" => Some(Self::EarlyBird),
            "student" => Some(Self::Student),
            "staff" => Some(Self::Staff),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Vip => "vip",
            Self::Premium => "premium",
            Self::EarlyBird => "early-bird",
            Self::Student => "student",
            Self::Staff => "staff",
        }
    }
}

/// Signature algorithms accepted on QR tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QrAlgorithm {
    HS256,
    RS256,
}

impl QrAlgorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HS256" => Some(Self::HS256),
            "RS256" => Some(Self::RS256),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HS256 => "HS256",
            Self::RS256 => "RS256",
        }
    }
}

/// Wire format a QR payload arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QrFormat {
    #[serde(rename = "JWT")]
    Jwt,
    #[serde(rename = "PNG-Base64")]
    PngBase64,
    #[serde(rename = "Base64")]
    Base64,
    #[serde(rename = "JSON")]
    Json,
}

impl QrFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jwt => "JWT",
            Self::PngBase64 => "PNG-Base64",
            Self::Base64 => "Base64",
            Self::Json => "JSON",
        }
    }
}

/// Canonical ticket claims recovered from a QR payload.
///
/// `raw` keeps the decoded document as the issuer rendered it; the
/// signature string is built from those scalars, not from re-serialized
/// typed fields.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketClaims {
    pub ticket_id: String,
    pub event_id: String,
    pub ticket_type: TicketType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: String,
    pub algorithm: QrAlgorithm,
    #[serde(skip_serializing)]
    pub signature: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    /// The normalized claims document as decoded from the wire.
    #[serde(skip_serializing)]
    pub raw: Value,
}

/// Context supplied by the checkpoint alongside a scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanContext {
    pub location: Option<String>,
    pub device_id: Option<String>,
    pub operator_id: Option<String>,
    pub checkpoint_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Device clock at scan time, used for skew analysis.
    pub timestamp: Option<DateTime<Utc>>,
}

impl ScanContext {
    pub fn location_or_unknown(&self) -> String {
        self.location.clone().unwrap_or_else(|| "unknown".into())
    }

    pub fn device_or_unknown(&self) -> String {
        self.device_id.clone().unwrap_or_else(|| "unknown".into())
    }
}

/// Fraud flag taxonomy across the decoder, the concurrency gate, and the
/// pattern analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FraudType {
    #[serde(rename = "FORGED_QR")]
    ForgedQr,
    #[serde(rename = "CONCURRENT_SCAN_ATTEMPT")]
    ConcurrentScanAttempt,
    #[serde(rename = "rapid_scans")]
    RapidScans,
    #[serde(rename = "location_hopping")]
    LocationHopping,
    #[serde(rename = "volume_anomaly")]
    VolumeAnomaly,
    #[serde(rename = "off_hours")]
    OffHours,
    #[serde(rename = "cyclic_scans")]
    CyclicScans,
    #[serde(rename = "metadata_anomaly")]
    MetadataAnomaly,
}

impl FraudType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ForgedQr => "FORGED_QR",
            Self::ConcurrentScanAttempt => "CONCURRENT_SCAN_ATTEMPT",
            Self::RapidScans => "rapid_scans",
            Self::LocationHopping => "location_hopping",
            Self::VolumeAnomaly => "volume_anomaly",
            Self::OffHours => "off_hours",
            Self::CyclicScans => "cyclic_scans",
            Self::MetadataAnomaly => "metadata_anomaly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

/// A tagged fraud record attached to a failed or suspicious scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudFlag {
    #[serde(rename = "type")]
    pub flag_type: FraudType,
    pub severity: Severity,
    pub details: Value,
}

impl FraudFlag {
    pub fn new(flag_type: FraudType, severity: Severity, details: Value) -> Self {
        Self { flag_type, severity, details }
    }
}

/// Terminal classification of one validation attempt, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanResultKind {
    Valid,
    Invalid,
    AlreadyUsed,
    Expired,
    FraudDetected,
}

impl ScanResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::AlreadyUsed => "already_used",
            Self::Expired => "expired",
            Self::FraudDetected => "fraud_detected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "valid" => Some(Self::Valid),
            "invalid" => Some(Self::Invalid),
            "already_used" => Some(Self::AlreadyUsed),
            "expired" => Some(Self::Expired),
            "fraud_detected" => Some(Self::FraudDetected),
            _ => None,
        }
    }
}

/// How a payload's authenticity was established.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationInfo {
    pub format_type: QrFormat,
    pub algorithm: QrAlgorithm,
    pub version: String,
    pub validated_at: DateTime<Utc>,
    pub cryptographic_method: &'static str,
}

/// A decoded and cryptographically verified ticket.
#[derive(Debug, Clone)]
pub struct DecodedTicket {
    pub claims: TicketClaims,
    pub validation_info: ValidationInfo,
}

/// The ticket block of a successful validation response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketBlock {
    pub id: String,
    pub event_id: String,
    pub ticket_type: TicketType,
    pub status: &'static str,
    pub scanned_at: DateTime<Utc>,
}

/// The scan-info block of a successful validation response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanInfo {
    pub scan_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub location: Option<String>,
    pub device_id: Option<String>,
}

/// Per-stage validation digests carried in the success metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationMetadata {
    pub qr_validation: Value,
    pub business_validation: Value,
}

/// A granted admission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationGrant {
    pub success: bool,
    pub validation_id: Uuid,
    pub ticket: TicketBlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<Value>,
    pub scan_info: ScanInfo,
    pub validation_time: i64,
    pub metadata: ValidationMetadata,
}

/// A denied admission, carrying the machine code for the checkpoint UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationDenial {
    pub success: bool,
    pub code: String,
    pub error: String,
    pub validation_id: Uuid,
    pub validation_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fraud_flags: Option<FraudFlag>,
}

/// Terminal outcome of one orchestrator call.
#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    Granted(ValidationGrant),
    Denied(ValidationDenial),
}

impl ValidationOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    pub fn validation_id(&self) -> Uuid {
        match self {
            Self::Granted(g) => g.validation_id,
            Self::Denied(d) => d.validation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_type_round_trip() {
        for s in ["standard", "vip", "premium", "early-bird", "student", "staff"] {
            let t = TicketType::parse(s).unwrap();
            assert_eq!(t.as_str(), s);
        }
        assert!(TicketType::parse("backstage").is_none());
    }

    #[test]
    fn test_ticket_type_serde_kebab() {
        let json = serde_json::to_string(&TicketType::EarlyBird).unwrap();
        assert_eq!(json, "\"early-bird\"");
        let back: TicketType = serde_json::from_str("\"early-bird\"").unwrap();
        assert_eq!(back, TicketType::EarlyBird);
    }

    #[test]
    fn test_fraud_flag_serializes_with_type_key() {
        let flag = FraudFlag::new(
            FraudType::ForgedQr,
            Severity::High,
            serde_json::json!({"reason": "signature mismatch"}),
        );
        let json = serde_json::to_value(&flag).unwrap();
        assert_eq!(json["type"], "FORGED_QR");
        assert_eq!(json["severity"], "HIGH");
    }

    #[test]
    fn test_scan_result_kind_round_trip() {
        for s in ["valid", "invalid", "already_used", "expired", "fraud_detected"] {
            assert_eq!(ScanResultKind::parse(s).unwrap().as_str(), s);
        }
        assert!(ScanResultKind::parse("pending").is_none());
    }

    #[test]
    fn test_scan_context_defaults() {
        let ctx: ScanContext = serde_json::from_str("{}").unwrap();
        assert!(ctx.location.is_none());
        assert_eq!(ctx.location_or_unknown(), "unknown");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}
