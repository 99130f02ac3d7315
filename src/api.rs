//! HTTP API for the Turnstile validation engine.
//!
//! Thin handlers over the orchestrator and the stores: request-shape
//! gating happens here (so the machine codes for malformed requests are
//! produced before the orchestrator runs), everything else is delegated.

use crate::error::StoreError;
use crate::store::{NewFraudAttempt, NewScanLog, NewScanSession, SessionFilters};
use crate::types::{ScanContext, ScanResultKind, ValidationOutcome};
use crate::validator::Validator;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

// ── Envelopes ───────────────────────────────────────────────────

fn error_envelope(code: &str, message: &str, data: Option<Value>) -> Value {
    json!({
        "success": false,
        "message": message,
        "error": { "code": code, "data": data },
        "meta": { "timestamp": Utc::now() },
    })
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(error_envelope(code, message, None))).into_response()
}

/// Machine code → HTTP status, per the error-response contract.
fn status_for_code(code: &str) -> StatusCode {
    match code {
        "CONCURRENT_SCAN_DETECTED" => StatusCode::UNAUTHORIZED,
        "MAX_CONCURRENT_SCANS_EXCEEDED" => StatusCode::TOO_MANY_REQUESTS,
        "CORE_SERVICE_UNAVAILABLE" | "CORE_COMMUNICATION_ERROR" => StatusCode::SERVICE_UNAVAILABLE,
        "VALIDATION_ERROR" => StatusCode::INTERNAL_SERVER_ERROR,
        "TICKET_NOT_FOUND_OFFLINE" => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn store_error_response(e: StoreError) -> Response {
    match e {
        StoreError::NotFound(what) => error_response(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            &format!("{what} not found"),
        ),
        StoreError::Database(e) => {
            warn!(error = %e, "storage operation failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "VALIDATION_ERROR",
                "storage operation failed",
            )
        }
    }
}

// ── Validation endpoints ────────────────────────────────────────

/// POST /api/scans/validate
async fn validate(
    State(validator): State<Validator>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    // The request-shape gate produces its codes before the orchestrator
    // sees the payload.
    let qr_code = match body.get("qrCode") {
        Some(Value::String(s)) => s.clone(),
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "MISSING_OR_INVALID_QR_CODE",
                "qrCode must be a non-empty string",
            )
        }
    };
    let context = match body.get("scanContext") {
        None | Some(Value::Null) => ScanContext::default(),
        Some(raw @ Value::Object(_)) => match serde_json::from_value(raw.clone()) {
            Ok(ctx) => ctx,
            Err(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "INVALID_SCAN_CONTEXT",
                    "scanContext fields are malformed",
                )
            }
        },
        Some(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_SCAN_CONTEXT",
                "scanContext must be an object",
            )
        }
    };
    let context = enrich_context(context, &headers);

    match validator.validate_ticket(qr_code, context).await {
        ValidationOutcome::Granted(grant) => (StatusCode::OK, Json(json!(grant))).into_response(),
        ValidationOutcome::Denied(denial) => {
            (status_for_code(&denial.code), Json(json!(denial))).into_response()
        }
    }
}

/// POST /api/scans/validate-offline
async fn validate_offline(
    State(validator): State<Validator>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let Some(ticket_id) = body.get("ticketId").and_then(Value::as_str) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "MISSING_TICKET_ID",
            "ticketId is required",
        );
    };
    let context = body
        .get("scanContext")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let context = enrich_context(context, &headers);

    match validator.offline().validate_ticket_offline(ticket_id, &context) {
        Ok(outcome) => (StatusCode::OK, Json(json!({
            "success": true,
            "offline": true,
            "ticket": outcome.ticket_data,
            "validationCount": outcome.validation_count,
            "scanInfo": outcome.scan_info,
        })))
        .into_response(),
        Err(e) => (
            status_for_code(e.code()),
            Json(error_envelope(e.code(), &e.to_string(), None)),
        )
            .into_response(),
    }
}

// ── History / statistics endpoints ──────────────────────────────

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<i64>,
    offset: Option<i64>,
}

/// GET /api/scans/history/ticket/:ticket_id
async fn ticket_history(
    State(validator): State<Validator>,
    Path(ticket_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let limit = params.limit.unwrap_or(50);
    let offset = params.offset.unwrap_or(0);
    if !(1..=100).contains(&limit) || offset < 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "limit must be 1-100 and offset non-negative",
        );
    }

    match validator
        .store()
        .get_ticket_scan_history(&ticket_id, limit, offset)
        .await
    {
        Ok((history, total)) => (StatusCode::OK, Json(json!({
            "success": true,
            "data": {
                "ticketId": ticket_id,
                "history": history,
                "pagination": { "limit": limit, "offset": offset, "total": total },
            },
        })))
        .into_response(),
        Err(e) => store_error_response(e),
    }
}

/// GET /api/scans/ticket/:ticket_id/logs
async fn ticket_logs(
    State(validator): State<Validator>,
    Path(ticket_id): Path<String>,
) -> Response {
    match validator.store().get_ticket_logs(&ticket_id, 100).await {
        Ok(logs) => (StatusCode::OK, Json(json!({
            "success": true,
            "data": { "ticketId": ticket_id, "logs": logs },
        })))
        .into_response(),
        Err(e) => store_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsParams {
    start_date: Option<String>,
    end_date: Option<String>,
}

/// GET /api/scans/stats/event/:event_id
async fn event_stats(
    State(validator): State<Validator>,
    Path(event_id): Path<String>,
    Query(params): Query<StatsParams>,
) -> Response {
    let start = match parse_optional_instant(params.start_date.as_deref()) {
        Ok(v) => v,
        Err(response) => return response,
    };
    let end = match parse_optional_instant(params.end_date.as_deref()) {
        Ok(v) => v,
        Err(response) => return response,
    };

    match validator
        .store()
        .get_event_scan_stats(&event_id, start, end)
        .await
    {
        Ok(stats) => {
            (StatusCode::OK, Json(json!({ "success": true, "data": stats }))).into_response()
        }
        Err(e) => store_error_response(e),
    }
}

/// GET /api/scans/stats
async fn service_stats(State(validator): State<Validator>) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": {
            "scans": validator.stats.snapshot(),
            "pendingScans": validator.pending_scan_count(),
            "hotCacheEntries": validator.hot_cache().len(),
            "offline": {
                "tickets": validator.offline().ticket_count(),
                "pendingSync": validator.offline().pending_count(),
            },
            "breakers": validator.rules().breaker_states(),
        },
    }))
}

/// GET /api/scans/health
async fn health(State(validator): State<Validator>) -> Json<Value> {
    let rules_available = validator.rules().rules_available();
    Json(json!({
        "status": if rules_available { "ok" } else { "degraded" },
        "rulesService": if rules_available { "reachable" } else { "circuit-open" },
        "pendingScans": validator.pending_scan_count(),
        "offlineTickets": validator.offline().ticket_count(),
        "timestamp": Utc::now(),
    }))
}

// ── Session endpoints ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenSessionRequest {
    operator_id: String,
    event_id: Option<String>,
    location: Option<String>,
    device_info: Option<Value>,
}

/// POST /api/scans/sessions
async fn open_session(
    State(validator): State<Validator>,
    Json(body): Json<OpenSessionRequest>,
) -> Response {
    let new = NewScanSession {
        operator_id: body.operator_id,
        event_id: body.event_id,
        location: body.location,
        device_info: body.device_info,
    };
    match validator.store().create_scan_session(new).await {
        Ok(session) => {
            (StatusCode::OK, Json(json!({ "success": true, "data": session }))).into_response()
        }
        Err(e) => store_error_response(e),
    }
}

/// POST /api/scans/sessions/:id/end
async fn end_session(State(validator): State<Validator>, Path(id): Path<i64>) -> Response {
    match validator.store().end_scan_session(id).await {
        Ok(session) => {
            (StatusCode::OK, Json(json!({ "success": true, "data": session }))).into_response()
        }
        Err(e) => store_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    operator_id: Option<String>,
    event_id: Option<String>,
    location: Option<String>,
}

/// GET /api/scans/sessions/active
async fn active_sessions(
    State(validator): State<Validator>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let filters = SessionFilters {
        operator_id: query.operator_id,
        event_id: query.event_id,
        location: query.location,
    };
    match validator.store().get_active_scan_sessions(filters).await {
        Ok(sessions) => {
            let count = sessions.len();
            (StatusCode::OK, Json(json!({
                "success": true,
                "data": { "sessions": sessions, "count": count },
            })))
            .into_response()
        }
        Err(e) => store_error_response(e),
    }
}

// ── Offline management endpoints ────────────────────────────────

/// POST /api/scans/offline/tickets — cache warm-up.
async fn seed_offline(State(validator): State<Validator>, Json(body): Json<Value>) -> Response {
    let Some(ticket_id) = body.get("ticketId").and_then(Value::as_str) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "MISSING_TICKET_ID",
            "ticketId is required",
        );
    };
    let ticket_data = body.get("ticketData").cloned().unwrap_or(Value::Null);
    let expires_at = body
        .get("expiresAt")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let entry = validator
        .offline()
        .store_ticket(ticket_id, ticket_data, expires_at);
    (StatusCode::OK, Json(json!({ "success": true, "data": entry }))).into_response()
}

/// POST /api/scans/offline/sync — manual drain trigger.
async fn trigger_sync(State(validator): State<Validator>) -> Response {
    let batch = validator.config().offline_batch_size;
    match validator
        .offline()
        .sync_pending(validator.rules(), batch)
        .await
    {
        Some(report) => {
            (StatusCode::OK, Json(json!({ "success": true, "data": report }))).into_response()
        }
        None => error_response(
            StatusCode::CONFLICT,
            "SYNC_IN_PROGRESS",
            "an offline sync is already running",
        ),
    }
}

// ── Rules-service callback ──────────────────────────────────────

/// POST /api/internal/scan-confirmation
///
/// The rules service confirms a scan it processed: the cache row is
/// upserted, a scan log appended, and a fraud attempt recorded when the
/// confirmation carries fraud flags.
async fn scan_confirmation(State(validator): State<Validator>, Json(body): Json<Value>) -> Response {
    let Some(ticket_id) = body.get("ticketId").and_then(Value::as_str) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "MISSING_TICKET_ID",
            "ticketId is required",
        );
    };
    let result_block = body.get("validationResult").cloned().unwrap_or(Value::Null);
    let success = result_block
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let fraud_flags = result_block
        .get("fraud_flags")
        .filter(|v| !v.is_null())
        .cloned();
    let location = result_block
        .get("location")
        .and_then(Value::as_str)
        .map(str::to_string);

    let result = if fraud_flags.is_some() {
        ScanResultKind::FraudDetected
    } else if success {
        ScanResultKind::Valid
    } else {
        ScanResultKind::Invalid
    };

    let log = match validator
        .store()
        .record_scan(NewScanLog {
            // Confirmation callbacks carry no session.
            session_id: None,
            ticket_id: ticket_id.to_string(),
            result,
            location: location.clone(),
            device_id: result_block
                .get("device_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            ticket_data: None,
            validation_details: body.get("scanMetadata").cloned(),
            fraud_flags: fraud_flags.clone(),
            created_by: result_block
                .get("operator_id")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
        .await
    {
        Ok(log) => log,
        Err(e) => return store_error_response(e),
    };

    if let Some(flags) = fraud_flags {
        let attempt = validator
            .store()
            .create_fraud_attempt(NewFraudAttempt {
                scan_log_id: log.id,
                fraud_type: flags
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                severity: flags
                    .get("severity")
                    .and_then(Value::as_str)
                    .unwrap_or("LOW")
                    .to_string(),
                details: Some(flags),
                ip_address: None,
                user_agent: None,
                blocked: result_block
                    .get("blocked")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
            .await;
        if let Err(e) = attempt {
            return store_error_response(e);
        }
    }

    let row = match validator
        .store()
        .upsert_ticket_cache(
            ticket_id,
            location.as_deref(),
            validator.config().max_scans_per_ticket,
        )
        .await
    {
        Ok(row) => row,
        Err(e) => return store_error_response(e),
    };
    validator.hot_cache().apply_row(&row);

    (StatusCode::OK, Json(json!({
        "success": true,
        "data": { "scanLogId": log.id, "scanCount": row.scan_count },
    })))
    .into_response()
}

// ── Router ──────────────────────────────────────────────────────

pub fn build_router(validator: Validator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/api/scans/validate", post(validate))
        .route("/api/scans/validate-offline", post(validate_offline))
        .route("/api/scans/history/ticket/:ticket_id", get(ticket_history))
        .route("/api/scans/ticket/:ticket_id/logs", get(ticket_logs))
        .route("/api/scans/stats/event/:event_id", get(event_stats))
        .route("/api/scans/stats", get(service_stats))
        .route("/api/scans/health", get(health))
        .route("/api/scans/sessions", post(open_session))
        .route("/api/scans/sessions/:id/end", post(end_session))
        .route("/api/scans/sessions/active", get(active_sessions))
        .route("/api/scans/offline/tickets", post(seed_offline))
        .route("/api/scans/offline/sync", post(trigger_sync))
        .route("/api/internal/scan-confirmation", post(scan_confirmation))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(validator)
}

// ── Helpers ─────────────────────────────────────────────────────

/// Fill network metadata the checkpoint did not send from the transport.
fn enrich_context(mut context: ScanContext, headers: &HeaderMap) -> ScanContext {
    if context.ip_address.is_none() {
        context.ip_address = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string());
    }
    if context.user_agent.is_none() {
        context.user_agent = headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }
    context
}

fn parse_optional_instant(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, Response> {
    match raw {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| {
                error_response(
                    StatusCode::BAD_REQUEST,
                    "VALIDATION_ERROR",
                    "dates must be RFC3339 instants",
                )
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::HotCache;
    use crate::config::Config;
    use crate::fraud::FraudAnalyzer;
    use crate::offline::OfflineStore;
    use crate::rules::RulesClient;
    use crate::store::ScanStore;
    use axum::body::Body;
    use axum::http::Request;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn test_validator() -> Validator {
        let config = Config {
            database_url: "postgres://turnstile@127.0.0.1:1/turnstile".into(),
            ..Config::default()
        };
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy(&config.database_url)
            .unwrap();
        let offline = Arc::new(OfflineStore::new(
            Duration::from_secs(3600),
            std::env::temp_dir().join(format!("turnstile-api-{}.json", Uuid::new_v4())),
        ));
        Validator::new(
            config.clone(),
            Arc::new(RulesClient::new(&config)),
            ScanStore::new(pool),
            Arc::new(HotCache::new(config.cache_timeout)),
            Arc::new(FraudAnalyzer::new()),
            offline,
        )
    }

    async fn send_json(router: Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn send_get(router: Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_validate_rejects_missing_qr_code() {
        let router = build_router(test_validator());
        let (status, body) =
            send_json(router, "POST", "/api/scans/validate", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "MISSING_OR_INVALID_QR_CODE");
        assert_eq!(body["success"], false);
        assert!(body["meta"]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_validate_rejects_non_string_qr_code() {
        let router = build_router(test_validator());
        let (status, body) =
            send_json(router, "POST", "/api/scans/validate", json!({ "qrCode": 42 })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "MISSING_OR_INVALID_QR_CODE");
    }

    #[tokio::test]
    async fn test_validate_rejects_non_object_context() {
        let router = build_router(test_validator());
        let (status, body) = send_json(
            router,
            "POST",
            "/api/scans/validate",
            json!({ "qrCode": "abc", "scanContext": ["not", "a", "record"] }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_SCAN_CONTEXT");
    }

    #[tokio::test]
    async fn test_validate_offline_requires_ticket_id() {
        let router = build_router(test_validator());
        let (status, body) =
            send_json(router, "POST", "/api/scans/validate-offline", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "MISSING_TICKET_ID");
    }

    #[tokio::test]
    async fn test_validate_offline_unknown_ticket_is_404() {
        let router = build_router(test_validator());
        let (status, body) = send_json(
            router,
            "POST",
            "/api/scans/validate-offline",
            json!({ "ticketId": "GHOST" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "TICKET_NOT_FOUND_OFFLINE");
    }

    #[tokio::test]
    async fn test_offline_seed_then_validate() {
        let validator = test_validator();
        let router = build_router(validator.clone());

        let (status, body) = send_json(
            router.clone(),
            "POST",
            "/api/scans/offline/tickets",
            json!({
                "ticketId": "T1",
                "ticketData": { "ticketId": "T1", "eventId": "E1" },
                "expiresAt": (Utc::now() + chrono::Duration::hours(4)).to_rfc3339(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["validationCount"], 0);

        let (status, body) = send_json(
            router,
            "POST",
            "/api/scans/validate-offline",
            json!({ "ticketId": "T1", "scanContext": { "location": "Main" } }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["offline"], true);
        assert_eq!(body["scanInfo"]["offline"], true);
        assert_eq!(body["validationCount"], 1);
    }

    #[tokio::test]
    async fn test_history_param_validation() {
        let router = build_router(test_validator());
        let (status, body) = send_get(
            router.clone(),
            "/api/scans/history/ticket/T1?limit=0",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = send_get(router, "/api/scans/history/ticket/T1?limit=101").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_event_stats_rejects_bad_dates() {
        let router = build_router(test_validator());
        let (status, _) =
            send_get(router, "/api/scans/stats/event/E1?startDate=yesterday").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_is_ok() {
        let router = build_router(test_validator());
        let (status, body) = send_get(router, "/api/scans/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["rulesService"], "reachable");
    }

    #[tokio::test]
    async fn test_service_stats_shape() {
        let router = build_router(test_validator());
        let (status, body) = send_get(router, "/api/scans/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["scans"]["totalScans"], 0);
        assert_eq!(body["data"]["offline"]["pendingSync"], 0);
        assert_eq!(body["data"]["breakers"]["validateTicket"], "closed");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for_code("CONCURRENT_SCAN_DETECTED"), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for_code("MAX_CONCURRENT_SCANS_EXCEEDED"),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for_code("CORE_SERVICE_UNAVAILABLE"),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for_code("VALIDATION_ERROR"), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for_code("QR_CODE_EXPIRED"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for_code("INVALID"), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_enrich_context_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        headers.insert("user-agent", "TurnstileScanner/3.2".parse().unwrap());

        let context = enrich_context(ScanContext::default(), &headers);
        assert_eq!(context.ip_address.as_deref(), Some("203.0.113.9"));
        assert_eq!(context.user_agent.as_deref(), Some("TurnstileScanner/3.2"));

        // Explicit values are not overwritten.
        let explicit = ScanContext {
            ip_address: Some("198.51.100.7".into()),
            ..ScanContext::default()
        };
        let context = enrich_context(explicit, &headers);
        assert_eq!(context.ip_address.as_deref(), Some("198.51.100.7"));
    }
}
