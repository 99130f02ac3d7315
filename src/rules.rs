//! Client for the upstream rules service — the system that owns event and
//! ticket business state. Each operation runs behind its own circuit
//! breaker; upstream error codes are mapped onto the orchestrator's
//! canonical set before they reach a checkpoint.

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::config::Config;
use crate::error::ValidationError;
use crate::types::{ScanContext, TicketClaims, ValidationInfo};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

const SERVICE_NAME: &str = "turnstile";

/// Successful business verdict from the rules service.
#[derive(Debug, Clone)]
pub struct RulesVerdict {
    pub ticket: Option<Value>,
    pub event: Option<Value>,
    /// Response digest kept for the scan log's validation details.
    pub raw: Value,
}

#[derive(Debug)]
pub struct RulesClient {
    http: reqwest::Client,
    base_url: String,
    validate_ticket_breaker: CircuitBreaker,
    validate_event_breaker: CircuitBreaker,
    ticket_status_breaker: CircuitBreaker,
    record_scan_breaker: CircuitBreaker,
}

impl RulesClient {
    pub fn new(config: &Config) -> Self {
        let breaker_config = BreakerConfig {
            error_threshold_percentage: config.breaker_error_threshold,
            reset_timeout: config.breaker_reset_timeout,
            rolling_count_window: config.breaker_window,
            rolling_count_buckets: config.breaker_buckets,
        };
        let http = reqwest::Client::builder()
            .timeout(config.rules_timeout)
            .build()
            .expect("HTTP client construction only fails without a TLS backend");

        Self {
            http,
            base_url: config.rules_service_url.trim_end_matches('/').to_string(),
            validate_ticket_breaker: CircuitBreaker::new("validate-ticket", breaker_config.clone()),
            validate_event_breaker: CircuitBreaker::new("validate-event", breaker_config.clone()),
            ticket_status_breaker: CircuitBreaker::new("ticket-status", breaker_config.clone()),
            record_scan_breaker: CircuitBreaker::new("record-scan", breaker_config),
        }
    }

    /// Ask the rules service whether this ticket may be admitted.
    pub async fn validate_ticket(
        &self,
        claims: &TicketClaims,
        context: &ScanContext,
        info: &ValidationInfo,
    ) -> Result<RulesVerdict, ValidationError> {
        self.validate_ticket_breaker.before_call()?;

        let body = json!({
            "ticketId": claims.ticket_id,
            "eventId": claims.event_id,
            "ticketType": claims.ticket_type,
            "userId": claims.user_id,
            "scanContext": {
                "location": context.location,
                "deviceId": context.device_id,
                "timestamp": Utc::now(),
                "operatorId": context.operator_id,
                "checkpointId": context.checkpoint_id,
            },
            "validationMetadata": {
                "qrVersion": info.version,
                "qrAlgorithm": info.algorithm,
                "validatedAt": info.validated_at,
            },
        });

        let url = format!("{}/api/internal/validation/validate-ticket", self.base_url);
        let response = self.post(&url, &body).await;
        self.settle(&self.validate_ticket_breaker, response)
            .map(|raw| RulesVerdict {
                ticket: raw.pointer("/data/ticket").cloned(),
                event: raw.pointer("/data/event").cloned(),
                raw,
            })
    }

    /// Check that an event is open for admission.
    pub async fn validate_event(&self, event_id: &str) -> Result<Value, ValidationError> {
        self.validate_event_breaker.before_call()?;
        let url = format!("{}/api/internal/events/{event_id}/validate", self.base_url);
        let response = self.get(&url).await;
        self.settle(&self.validate_event_breaker, response)
    }

    /// Fetch a ticket's current business status.
    pub async fn check_ticket_status(&self, ticket_id: &str) -> Result<Value, ValidationError> {
        self.ticket_status_breaker.before_call()?;
        let url = format!("{}/api/internal/tickets/{ticket_id}/status", self.base_url);
        let response = self.get(&url).await;
        self.settle(&self.ticket_status_breaker, response)
    }

    /// Report a completed scan upstream. Advisory: failures are logged
    /// and never surface to the checkpoint.
    pub async fn record_scan(&self, record: &Value) {
        match self.record_scan_checked(record).await {
            Ok(_) => {}
            Err(ValidationError::CoreServiceUnavailable) => {
                debug!("record-scan skipped, circuit open");
            }
            Err(e) => warn!(error = %e, "record-scan delivery failed"),
        }
    }

    /// `record_scan` with the delivery result exposed. The offline sync
    /// drain needs the acknowledgment to decide whether a queue entry may
    /// be removed.
    pub async fn record_scan_checked(&self, record: &Value) -> Result<Value, ValidationError> {
        self.record_scan_breaker.before_call()?;
        let url = format!("{}/api/internal/scans/record", self.base_url);
        let response = self.post(&url, record).await;
        self.settle(&self.record_scan_breaker, response)
    }

    /// Breaker states for the health snapshot.
    pub fn breaker_states(&self) -> Value {
        json!({
            "validateTicket": self.validate_ticket_breaker.state_name(),
            "validateEvent": self.validate_event_breaker.state_name(),
            "checkTicketStatus": self.ticket_status_breaker.state_name(),
            "recordScan": self.record_scan_breaker.state_name(),
        })
    }

    pub fn rules_available(&self) -> bool {
        !self.validate_ticket_breaker.is_open()
    }

    async fn post(&self, url: &str, body: &Value) -> Result<RawResponse, reqwest::Error> {
        let response = self
            .http
            .post(url)
            .header("X-Service-Name", SERVICE_NAME)
            .header("X-Request-ID", Uuid::new_v4().to_string())
            .header("X-Timestamp", Utc::now().to_rfc3339())
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(RawResponse { status, body })
    }

    async fn get(&self, url: &str) -> Result<RawResponse, reqwest::Error> {
        let response = self
            .http
            .get(url)
            .header("X-Service-Name", SERVICE_NAME)
            .header("X-Request-ID", Uuid::new_v4().to_string())
            .header("X-Timestamp", Utc::now().to_rfc3339())
            .send()
            .await?;
        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(RawResponse { status, body })
    }

    /// Classify the transport result: transport errors and 5xx feed the
    /// breaker; business rejections are healthy service behavior and are
    /// mapped to canonical codes.
    fn settle(
        &self,
        breaker: &CircuitBreaker,
        response: Result<RawResponse, reqwest::Error>,
    ) -> Result<Value, ValidationError> {
        match response {
            Err(e) => {
                breaker.record_failure();
                Err(ValidationError::CoreCommunicationError(e.to_string()))
            }
            Ok(raw) if raw.status.is_server_error() => {
                breaker.record_failure();
                Err(ValidationError::CoreCommunicationError(format!(
                    "upstream returned {}",
                    raw.status
                )))
            }
            Ok(raw) => {
                breaker.record_success();
                let success = raw
                    .body
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(raw.status.is_success());
                if success && raw.status.is_success() {
                    Ok(raw.body)
                } else {
                    Err(map_rules_code(extract_code(&raw.body)))
                }
            }
        }
    }
}

struct RawResponse {
    status: reqwest::StatusCode,
    body: Value,
}

fn extract_code(body: &Value) -> &str {
    body.get("code")
        .and_then(Value::as_str)
        .or_else(|| body.pointer("/error/code").and_then(Value::as_str))
        .unwrap_or("")
}

/// Upstream code → canonical orchestrator code. Unknown codes collapse to
/// `INVALID` so upstream topology never leaks to checkpoints.
pub fn map_rules_code(code: &str) -> ValidationError {
    match code {
        "TICKET_NOT_FOUND" => ValidationError::Invalid,
        "TICKET_ALREADY_USED" => ValidationError::AlreadyUsed,
        "TICKET_EXPIRED" => ValidationError::Expired,
        "EVENT_NOT_FOUND" | "USER_NOT_AUTHORIZED" | "ZONE_ACCESS_DENIED"
        | "TIME_ACCESS_DENIED" => ValidationError::NotAuthorized,
        "EVENT_NOT_ACTIVE" | "EVENT_ENDED" => ValidationError::EventClosed,
        _ => ValidationError::Invalid,
    }
}
