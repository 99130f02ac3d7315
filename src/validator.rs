//! Validation orchestrator — the end-to-end flow behind
//! `POST /api/scans/validate`.
//!
//! A request passes through a fixed pipeline of gates, each of which may
//! short-circuit to a terminal failure carrying a machine code:
//! input gate → concurrency gate → decode → blocked-ticket check → rules
//! RPC → fraud analysis → response assembly. Persistence is scheduled
//! after assembly and never rolls back a response.

use crate::cache::HotCache;
use crate::config::Config;
use crate::decoder::{self, DecoderConfig};
use crate::error::ValidationError;
use crate::fraud::{FraudAnalysis, FraudAnalyzer};
use crate::offline::OfflineStore;
use crate::rules::{RulesClient, RulesVerdict};
use crate::store::{NewFraudAttempt, NewScanLog, ScanStore};
use crate::types::{
    DecodedTicket, FraudFlag, ScanContext, ScanInfo, ScanResultKind, TicketBlock,
    ValidationDenial, ValidationGrant, ValidationMetadata, ValidationOutcome,
};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Hard ceiling on the QR payload accepted at the front door.
const MAX_QR_INPUT_LEN: usize = 10_000;

/// One in-flight validation, keyed by the raw QR payload.
#[derive(Debug, Clone)]
struct PendingScan {
    validation_id: Uuid,
    started_at: Instant,
}

#[derive(Debug, Default)]
pub struct ValidatorStats {
    total_scans: AtomicU64,
    successful_scans: AtomicU64,
    failed_scans: AtomicU64,
    fraud_attempts: AtomicU64,
    concurrent_scans_blocked: AtomicU64,
    scan_records_dropped: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_scans: u64,
    pub successful_scans: u64,
    pub failed_scans: u64,
    pub fraud_attempts: u64,
    pub concurrent_scans_blocked: u64,
    pub scan_records_dropped: u64,
}

impl ValidatorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_scans: self.total_scans.load(Ordering::Relaxed),
            successful_scans: self.successful_scans.load(Ordering::Relaxed),
            failed_scans: self.failed_scans.load(Ordering::Relaxed),
            fraud_attempts: self.fraud_attempts.load(Ordering::Relaxed),
            concurrent_scans_blocked: self.concurrent_scans_blocked.load(Ordering::Relaxed),
            scan_records_dropped: self.scan_records_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Stage results carried across the pipeline so every failure keeps its
/// code and everything learned before the failure stays available to the
/// persistence path.
#[derive(Debug, Default)]
struct StageOutcome {
    decoded: Option<DecodedTicket>,
    verdict: Option<RulesVerdict>,
    fraud: Option<FraudAnalysis>,
    error: Option<ValidationError>,
}

/// Cheap to clone: every piece of shared state sits behind an `Arc` (or
/// is a pool handle), so request tasks and maintenance tasks all see the
/// same gate, cache, and counters.
#[derive(Clone)]
pub struct Validator {
    config: Config,
    decoder_config: DecoderConfig,
    rules: Arc<RulesClient>,
    store: ScanStore,
    hot_cache: Arc<HotCache>,
    fraud: Arc<FraudAnalyzer>,
    offline: Arc<OfflineStore>,
    pending_scans: Arc<DashMap<String, PendingScan>>,
    pub stats: Arc<ValidatorStats>,
}

impl Validator {
    pub fn new(
        config: Config,
        rules: Arc<RulesClient>,
        store: ScanStore,
        hot_cache: Arc<HotCache>,
        fraud: Arc<FraudAnalyzer>,
        offline: Arc<OfflineStore>,
    ) -> Self {
        Self {
            decoder_config: DecoderConfig::from_config(&config),
            config,
            rules,
            store,
            hot_cache,
            fraud,
            offline,
            pending_scans: Arc::new(DashMap::new()),
            stats: Arc::new(ValidatorStats::default()),
        }
    }

    pub fn store(&self) -> &ScanStore {
        &self.store
    }

    pub fn offline(&self) -> &Arc<OfflineStore> {
        &self.offline
    }

    pub fn rules(&self) -> &Arc<RulesClient> {
        &self.rules
    }

    pub fn hot_cache(&self) -> &Arc<HotCache> {
        &self.hot_cache
    }

    pub fn fraud_analyzer(&self) -> &Arc<FraudAnalyzer> {
        &self.fraud
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validate one scanned QR payload end to end.
    pub async fn validate_ticket(
        &self,
        qr_code: String,
        context: ScanContext,
    ) -> ValidationOutcome {
        let validation_id = Uuid::new_v4();
        let started = Instant::now();
        self.stats.total_scans.fetch_add(1, Ordering::Relaxed);

        // ── Input gate ──────────────────────────────────────────────
        if qr_code.trim().is_empty() {
            return self.deny(ValidationError::MissingOrInvalidQrCode, validation_id, started);
        }
        if qr_code.len() > MAX_QR_INPUT_LEN {
            return self.deny(ValidationError::QrCodeTooLarge, validation_id, started);
        }

        // ── Concurrency gate ────────────────────────────────────────
        // The guard releases the entry on every exit path, panics and
        // deadline hits included.
        let _guard = match self.acquire_pending(&qr_code, validation_id) {
            Ok(guard) => guard,
            Err(e) => {
                if matches!(e, ValidationError::ConcurrentScanDetected) {
                    self.stats.concurrent_scans_blocked.fetch_add(1, Ordering::Relaxed);
                }
                return self.deny(e, validation_id, started);
            }
        };

        // ── Pipeline, bounded and panic-isolated ────────────────────
        let pipeline = {
            let this = self.clone();
            let qr = qr_code.clone();
            let ctx = context.clone();
            tokio::spawn(async move { this.run_pipeline(&qr, &ctx).await })
        };

        let outcome = match tokio::time::timeout(self.config.scan_timeout, pipeline).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => {
                warn!(%validation_id, %join_error, "validation pipeline aborted");
                StageOutcome {
                    error: Some(ValidationError::Internal(
                        "validation aborted unexpectedly".into(),
                    )),
                    ..StageOutcome::default()
                }
            }
            Err(_) => {
                warn!(%validation_id, "validation deadline exceeded");
                StageOutcome {
                    error: Some(ValidationError::Internal("validation deadline exceeded".into())),
                    ..StageOutcome::default()
                }
            }
        };

        self.settle(outcome, validation_id, context, started)
    }

    /// Decode → blocked-ticket check → rules → fraud.
    async fn run_pipeline(&self, qr_code: &str, context: &ScanContext) -> StageOutcome {
        let mut out = StageOutcome::default();

        // ── Decode ──────────────────────────────────────────────────
        let decoded = match decoder::decode_and_verify(qr_code, &self.decoder_config, Utc::now()) {
            Ok(decoded) => decoded,
            Err(e) => {
                out.error = Some(e);
                return out;
            }
        };
        out.decoded = Some(decoded.clone());

        // ── Blocked-ticket check ────────────────────────────────────
        match self
            .hot_cache
            .status(&self.store, &decoded.claims.ticket_id)
            .await
        {
            Ok(Some(entry)) if entry.is_blocked => {
                out.error = Some(blocked_error(entry.block_reason.as_deref()));
                return out;
            }
            Ok(_) => {}
            Err(e) => {
                // A cache read failure must not turn away a valid bearer;
                // the rules service still owns the final verdict.
                warn!(error = %e, "ticket cache lookup failed, continuing");
            }
        }

        // ── Rules verdict ───────────────────────────────────────────
        let verdict = match self
            .rules
            .validate_ticket(&decoded.claims, context, &decoded.validation_info)
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                out.error = Some(e);
                return out;
            }
        };
        out.verdict = Some(verdict);

        // ── Fraud analysis ──────────────────────────────────────────
        // The analyzer never overrides the upstream verdict unless the
        // operator opted into hard blocking.
        if self.config.fraud_detection_enabled {
            let analysis = self.fraud.analyze(&decoded.claims, context, Utc::now());
            if self.config.block_on_fraud && analysis.wants_block() {
                out.error = Some(ValidationError::FraudDetected);
            }
            out.fraud = Some(analysis);
        }

        out
    }

    /// Turn stage results into the response, update the statistics, and
    /// schedule deferred persistence.
    fn settle(
        &self,
        outcome: StageOutcome,
        validation_id: Uuid,
        context: ScanContext,
        started: Instant,
    ) -> ValidationOutcome {
        let validation_time = started.elapsed().as_millis() as i64;

        match outcome.error {
            None => {
                // A clean pipeline always carries the decode and the
                // verdict; anything else is an internal inconsistency.
                let (decoded, verdict) = match (outcome.decoded, outcome.verdict) {
                    (Some(decoded), Some(verdict)) => (decoded, verdict),
                    _ => {
                        return self.deny(
                            ValidationError::Internal("incomplete pipeline result".into()),
                            validation_id,
                            started,
                        )
                    }
                };
                let now = Utc::now();

                self.stats.successful_scans.fetch_add(1, Ordering::Relaxed);
                if outcome.fraud.as_ref().is_some_and(|f| f.is_suspicious) {
                    self.stats.fraud_attempts.fetch_add(1, Ordering::Relaxed);
                }

                let grant = ValidationGrant {
                    success: true,
                    validation_id,
                    ticket: TicketBlock {
                        id: decoded.claims.ticket_id.clone(),
                        event_id: decoded.claims.event_id.clone(),
                        ticket_type: decoded.claims.ticket_type,
                        status: "VALID",
                        scanned_at: now,
                    },
                    event: verdict.event.clone(),
                    scan_info: ScanInfo {
                        scan_id: validation_id,
                        timestamp: now,
                        location: context.location.clone(),
                        device_id: context.device_id.clone(),
                    },
                    validation_time,
                    metadata: ValidationMetadata {
                        qr_validation: json!(&decoded.validation_info),
                        business_validation: business_digest(&verdict),
                    },
                };

                // Keep the checkpoint able to admit this ticket offline.
                self.offline.cache_from_validation(
                    &decoded.claims.ticket_id,
                    decoded.claims.raw.clone(),
                    decoded.claims.expires_at,
                );

                self.schedule_persistence(
                    validation_id,
                    context,
                    decoded,
                    ScanResultKind::Valid,
                    outcome.fraud.as_ref(),
                    None,
                    validation_time,
                    Some(&grant),
                );

                info!(%validation_id, validation_time, "scan granted");
                ValidationOutcome::Granted(grant)
            }
            Some(error) => {
                self.stats.failed_scans.fetch_add(1, Ordering::Relaxed);
                if error.is_fraud() {
                    self.stats.fraud_attempts.fetch_add(1, Ordering::Relaxed);
                }

                if let Some(decoded) = outcome.decoded {
                    self.schedule_persistence(
                        validation_id,
                        context,
                        decoded,
                        error.scan_result_kind(),
                        outcome.fraud.as_ref(),
                        error.fraud_flags(),
                        validation_time,
                        None,
                    );
                }

                info!(%validation_id, code = error.code(), validation_time, "scan denied");
                ValidationOutcome::Denied(ValidationDenial {
                    success: false,
                    code: error.code().to_string(),
                    error: error.to_string(),
                    validation_id,
                    validation_time,
                    fraud_flags: error
                        .fraud_flags()
                        .or_else(|| first_analysis_flag(outcome.fraud.as_ref())),
                })
            }
        }
    }

    /// Reserve the concurrency-gate slot for this payload.
    fn acquire_pending(
        &self,
        qr_code: &str,
        validation_id: Uuid,
    ) -> Result<PendingGuard<'_>, ValidationError> {
        let scan_timeout = self.config.scan_timeout;
        match self.pending_scans.entry(qr_code.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().started_at.elapsed() < scan_timeout {
                    return Err(ValidationError::ConcurrentScanDetected);
                }
                // Stale entry from a crashed or hung validation: evict by
                // taking its place.
                occupied.insert(PendingScan { validation_id, started_at: Instant::now() });
            }
            Entry::Vacant(vacant) => {
                if self.pending_scans.len() >= self.config.max_concurrent_scans {
                    return Err(ValidationError::TooManyConcurrentScans);
                }
                vacant.insert(PendingScan { validation_id, started_at: Instant::now() });
            }
        }
        Ok(PendingGuard {
            map: self.pending_scans.as_ref(),
            key: qr_code.to_string(),
            validation_id,
        })
    }

    /// Deferred write of the scan record: scan log, fraud attempt when
    /// flagged, cache upsert, and the advisory upstream notification.
    /// Failure is logged and counted, never surfaced.
    #[allow(clippy::too_many_arguments)]
    fn schedule_persistence(
        &self,
        validation_id: Uuid,
        context: ScanContext,
        decoded: DecodedTicket,
        result: ScanResultKind,
        analysis: Option<&FraudAnalysis>,
        error_flag: Option<FraudFlag>,
        validation_time: i64,
        grant: Option<&ValidationGrant>,
    ) {
        let this = self.clone();
        let fraud_flags = collect_fraud_flags(analysis, error_flag);
        let upstream_digest = grant.map(|g| json!({ "event": g.event.clone() }));

        tokio::spawn(async move {
            let details = json!({
                "validationId": validation_id,
                "validationTimeMs": validation_time,
                "upstream": upstream_digest,
                "fraudAnalysis": fraud_flags.as_ref().map(|f| f["analysis"].clone()),
            });

            let record = NewScanLog {
                session_id: None,
                ticket_id: decoded.claims.ticket_id.clone(),
                result,
                location: context.location.clone(),
                device_id: context.device_id.clone(),
                ticket_data: Some(decoded.claims.raw.clone()),
                validation_details: Some(details),
                fraud_flags: fraud_flags.clone(),
                created_by: context.operator_id.clone(),
            };

            if let Err(e) = this.persist_scan(record, &context, result, fraud_flags).await {
                this.stats.scan_records_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%validation_id, error = %e, "scan record dropped");
            }

            if result == ScanResultKind::Valid {
                this.rules
                    .record_scan(&json!({
                        "ticketId": decoded.claims.ticket_id,
                        "validationId": validation_id,
                        "result": result.as_str(),
                        "location": context.location,
                        "deviceId": context.device_id,
                        "operatorId": context.operator_id,
                        "scannedAt": Utc::now(),
                    }))
                    .await;
            }
        });
    }

    async fn persist_scan(
        &self,
        record: NewScanLog,
        context: &ScanContext,
        result: ScanResultKind,
        fraud_flags: Option<Value>,
    ) -> Result<(), crate::error::StoreError> {
        let ticket_id = record.ticket_id.clone();
        let location = record.location.clone();
        let log = self.store.record_scan(record).await?;

        // A fraud_detected log always gets exactly one attempt row.
        if let Some(flags) = fraud_flags {
            let (fraud_type, severity) = primary_flag_labels(&flags);
            self.store
                .create_fraud_attempt(NewFraudAttempt {
                    scan_log_id: log.id,
                    fraud_type,
                    severity,
                    details: Some(flags),
                    ip_address: context.ip_address.clone(),
                    user_agent: context.user_agent.clone(),
                    blocked: result == ScanResultKind::FraudDetected,
                })
                .await?;
        }

        let row = self
            .store
            .upsert_ticket_cache(
                &ticket_id,
                location.as_deref(),
                self.config.max_scans_per_ticket,
            )
            .await?;
        self.hot_cache.apply_row(&row);
        Ok(())
    }

    fn deny(
        &self,
        error: ValidationError,
        validation_id: Uuid,
        started: Instant,
    ) -> ValidationOutcome {
        self.stats.failed_scans.fetch_add(1, Ordering::Relaxed);
        if error.is_fraud() {
            self.stats.fraud_attempts.fetch_add(1, Ordering::Relaxed);
        }
        info!(%validation_id, code = error.code(), "scan rejected at the gate");
        ValidationOutcome::Denied(ValidationDenial {
            success: false,
            code: error.code().to_string(),
            error: error.to_string(),
            validation_id,
            validation_time: started.elapsed().as_millis() as i64,
            fraud_flags: error.fraud_flags(),
        })
    }

    pub fn pending_scan_count(&self) -> usize {
        self.pending_scans.len()
    }
}

/// Removes the concurrency-gate entry when the request finishes, however
/// it finishes. Only the owning validation may remove its entry.
struct PendingGuard<'a> {
    map: &'a DashMap<String, PendingScan>,
    key: String,
    validation_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.map
            .remove_if(&self.key, |_, pending| pending.validation_id == self.validation_id);
    }
}

/// A blocked cache row turns into the failure its block reason implies.
fn blocked_error(reason: Option<&str>) -> ValidationError {
    match reason {
        Some("Trop de scans") => ValidationError::AlreadyUsed,
        _ => ValidationError::Invalid,
    }
}

fn business_digest(verdict: &RulesVerdict) -> Value {
    json!({
        "success": true,
        "ticketStatus": verdict
            .ticket
            .as_ref()
            .and_then(|t| t.get("status"))
            .cloned()
            .unwrap_or(Value::Null),
        "eventStatus": verdict
            .event
            .as_ref()
            .and_then(|e| e.get("status"))
            .cloned()
            .unwrap_or(Value::Null),
    })
}

fn first_analysis_flag(analysis: Option<&FraudAnalysis>) -> Option<FraudFlag> {
    analysis.and_then(|a| a.fraud_flags.first().cloned())
}

/// Merge the error's own flag and the analyzer's flags into the scan-log
/// blob.
fn collect_fraud_flags(
    analysis: Option<&FraudAnalysis>,
    error_flag: Option<FraudFlag>,
) -> Option<Value> {
    let analysis_flags: Vec<&FraudFlag> =
        analysis.map(|a| a.fraud_flags.iter().collect()).unwrap_or_default();
    if error_flag.is_none() && analysis_flags.is_empty() {
        return None;
    }
    Some(json!({
        "primary": error_flag
            .as_ref()
            .or(analysis_flags.first().copied()),
        "analysis": {
            "flags": analysis_flags,
            "riskScore": analysis.map(|a| a.risk_score),
            "recommendations": analysis.map(|a| a.recommendations.clone()),
        },
    }))
}

fn primary_flag_labels(flags: &Value) -> (String, String) {
    let fraud_type = flags
        .pointer("/primary/type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let severity = flags
        .pointer("/primary/severity")
        .and_then(Value::as_str)
        .unwrap_or("LOW")
        .to_string();
    (fraud_type, severity)
}
