//! Offline validation store — local admission decisions on cached tickets
//! while the rules service is unreachable, with a deferred sync queue.
//!
//! No pending entry is dropped without a success acknowledgment from the
//! upstream; the queue and the ticket cache survive restarts through a
//! periodic JSON snapshot.

use crate::error::ValidationError;
use crate::rules::RulesClient;
use crate::types::ScanContext;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Local validations allowed per ticket between syncs.
const MAX_OFFLINE_VALIDATIONS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflineStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineScanInfo {
    pub scan_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub location: Option<String>,
    pub device_id: Option<String>,
    pub offline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineTicket {
    pub ticket_id: String,
    pub ticket_data: Value,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_validated: Option<DateTime<Utc>>,
    pub validation_count: u32,
    pub status: OfflineStatus,
    pub scan_history: Vec<OfflineScanInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Store,
    Validate,
    Update,
}

/// A buffered write intent, keyed by ticket id in the pending map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSync {
    pub action: SyncAction,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
}

/// Outcome of a local validation, mirrored onto the HTTP response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineValidation {
    pub success: bool,
    pub ticket_id: String,
    pub ticket_data: Value,
    pub validation_count: u32,
    pub scan_info: OfflineScanInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    pub pending: usize,
    pub sync_duration_ms: u64,
}

/// On-disk snapshot layout.
#[derive(Debug, Serialize, Deserialize, Default)]
struct Snapshot {
    tickets: HashMap<String, OfflineTicket>,
    pending: HashMap<String, PendingSync>,
}

#[derive(Debug)]
pub struct OfflineStore {
    tickets: DashMap<String, OfflineTicket>,
    pending: DashMap<String, PendingSync>,
    sync_running: AtomicBool,
    default_ttl: Duration,
    snapshot_path: PathBuf,
}

impl OfflineStore {
    pub fn new(default_ttl: Duration, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            tickets: DashMap::new(),
            pending: DashMap::new(),
            sync_running: AtomicBool::new(false),
            default_ttl,
            snapshot_path: snapshot_path.into(),
        }
    }

    /// Seed or refresh one ticket in the local cache (cache warm-up).
    pub fn store_ticket(
        &self,
        ticket_id: &str,
        ticket_data: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> OfflineTicket {
        let now = Utc::now();
        let expires_at = expires_at
            .or_else(|| parse_expiry(&ticket_data))
            .unwrap_or(now + chrono::Duration::seconds(self.default_ttl.as_secs() as i64));

        let entry = OfflineTicket {
            ticket_id: ticket_id.to_string(),
            ticket_data: ticket_data.clone(),
            stored_at: now,
            expires_at,
            last_validated: None,
            validation_count: 0,
            status: OfflineStatus::Active,
            scan_history: Vec::new(),
        };
        self.tickets.insert(ticket_id.to_string(), entry.clone());
        self.enqueue(ticket_id, SyncAction::Store, json!({
            "ticketId": ticket_id,
            "ticketData": ticket_data,
            "storedAt": now,
        }));
        entry
    }

    /// Decide admission locally. The ladder is strict: unknown ticket,
    /// then expiry (which dominates the offline window), then status,
    /// then the local validation budget.
    pub fn validate_ticket_offline(
        &self,
        ticket_id: &str,
        context: &ScanContext,
    ) -> Result<OfflineValidation, ValidationError> {
        let now = Utc::now();
        let mut entry = self
            .tickets
            .get_mut(ticket_id)
            .ok_or(ValidationError::TicketNotFoundOffline)?;

        if now > entry.expires_at {
            return Err(ValidationError::TicketExpiredOffline);
        }
        if entry.status != OfflineStatus::Active {
            return Err(ValidationError::TicketInactiveOffline);
        }

        let scan_info = OfflineScanInfo {
            scan_id: Uuid::new_v4(),
            timestamp: now,
            location: context.location.clone(),
            device_id: context.device_id.clone(),
            offline: true,
        };
        entry.scan_history.push(scan_info.clone());
        entry.validation_count += 1;
        entry.last_validated = Some(now);

        if entry.validation_count > MAX_OFFLINE_VALIDATIONS {
            return Err(ValidationError::MaxScansExceededOffline);
        }

        let outcome = OfflineValidation {
            success: true,
            ticket_id: ticket_id.to_string(),
            ticket_data: entry.ticket_data.clone(),
            validation_count: entry.validation_count,
            scan_info: scan_info.clone(),
        };
        drop(entry);

        self.enqueue(ticket_id, SyncAction::Validate, json!({
            "ticketId": ticket_id,
            "scanInfo": scan_info,
            "validationSource": "offline",
        }));
        Ok(outcome)
    }

    /// Mirror a successfully validated online ticket into the offline
    /// cache so the checkpoint can keep admitting it through an outage.
    /// Known upstream already, so nothing is queued for sync.
    pub fn cache_from_validation(
        &self,
        ticket_id: &str,
        ticket_data: Value,
        expires_at: DateTime<Utc>,
    ) {
        let now = Utc::now();
        self.tickets
            .entry(ticket_id.to_string())
            .and_modify(|t| {
                t.ticket_data = ticket_data.clone();
                t.expires_at = expires_at;
            })
            .or_insert_with(|| OfflineTicket {
                ticket_id: ticket_id.to_string(),
                ticket_data,
                stored_at: now,
                expires_at,
                last_validated: None,
                validation_count: 0,
                status: OfflineStatus::Active,
                scan_history: Vec::new(),
            });
    }

    fn enqueue(&self, ticket_id: &str, action: SyncAction, data: Value) {
        self.pending.insert(
            ticket_id.to_string(),
            PendingSync { action, data, timestamp: Utc::now(), attempts: 0 },
        );
    }

    /// Drain up to `batch_size` pending entries through the rules client.
    /// Returns `None` when another sync is already running; overlapping
    /// drains are refused rather than queued.
    pub async fn sync_pending(
        &self,
        rules: &RulesClient,
        batch_size: usize,
    ) -> Option<SyncReport> {
        if self.sync_running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let started = Instant::now();
        let mut synced = 0;
        let mut failed = 0;

        let batch: Vec<(String, PendingSync)> = self
            .pending
            .iter()
            .take(batch_size.max(1))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (ticket_id, record) in batch {
            let delivered = match record.action {
                SyncAction::Store | SyncAction::Validate => {
                    rules.record_scan_checked(&record.data).await.is_ok()
                }
                SyncAction::Update => match rules.check_ticket_status(&ticket_id).await {
                    Ok(status) => {
                        self.apply_upstream_status(&ticket_id, &status);
                        true
                    }
                    Err(_) => false,
                },
            };

            if delivered {
                self.pending.remove(&ticket_id);
                synced += 1;
            } else {
                failed += 1;
                if let Some(mut entry) = self.pending.get_mut(&ticket_id) {
                    entry.attempts += 1;
                }
            }
        }

        self.sync_running.store(false, Ordering::SeqCst);
        let report = SyncReport {
            synced,
            failed,
            pending: self.pending.len(),
            sync_duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            synced = report.synced,
            failed = report.failed,
            pending = report.pending,
            "offline sync pass completed"
        );
        Some(report)
    }

    fn apply_upstream_status(&self, ticket_id: &str, status: &Value) {
        let revoked = status
            .pointer("/data/status")
            .and_then(Value::as_str)
            .map(|s| s.eq_ignore_ascii_case("revoked"))
            .unwrap_or(false);
        if revoked {
            if let Some(mut entry) = self.tickets.get_mut(ticket_id) {
                entry.status = OfflineStatus::Revoked;
            }
        }
    }

    /// Drop cached tickets whose validity has lapsed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.tickets.len();
        self.tickets.retain(|_, t| t.expires_at >= now);
        before.saturating_sub(self.tickets.len())
    }

    pub fn ticket_count(&self) -> usize {
        self.tickets.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn get_ticket(&self, ticket_id: &str) -> Option<OfflineTicket> {
        self.tickets.get(ticket_id).map(|t| t.clone())
    }

    /// Serialize the in-memory state to the snapshot file, atomically via
    /// a temporary sibling.
    pub fn snapshot(&self) -> std::io::Result<()> {
        let snapshot = Snapshot {
            tickets: self
                .tickets
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            pending: self
                .pending
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        };
        let body = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = self.snapshot_path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.snapshot_path)?;
        Ok(())
    }

    /// Restore state from the snapshot file. Missing or unreadable
    /// snapshots are a clean start, not an error.
    pub fn restore(&self) {
        match load_snapshot(&self.snapshot_path) {
            Some(snapshot) => {
                for (k, v) in snapshot.tickets {
                    self.tickets.insert(k, v);
                }
                for (k, v) in snapshot.pending {
                    self.pending.insert(k, v);
                }
                info!(
                    tickets = self.tickets.len(),
                    pending = self.pending.len(),
                    "offline snapshot restored"
                );
            }
            None => info!("no offline snapshot found, starting clean"),
        }
    }
}

fn load_snapshot(path: &Path) -> Option<Snapshot> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!(error = %e, "offline snapshot unreadable, ignoring");
            None
        }
    }
}

fn parse_expiry(ticket_data: &Value) -> Option<DateTime<Utc>> {
    ticket_data
        .get("expiresAt")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> OfflineStore {
        let path = std::env::temp_dir().join(format!("turnstile-test-{}.json", Uuid::new_v4()));
        OfflineStore::new(Duration::from_secs(3600), path)
    }

    fn ticket_data(expires_at: &str) -> Value {
        json!({
            "ticketId": "T1",
            "eventId": "E1",
            "ticketType": "standard",
            "expiresAt": expires_at,
        })
    }

    fn far_future() -> String {
        (Utc::now() + chrono::Duration::days(30)).to_rfc3339()
    }

    #[test]
    fn test_unknown_ticket_rejected() {
        let store = store();
        let err = store
            .validate_ticket_offline("GHOST", &ScanContext::default())
            .unwrap_err();
        assert_eq!(err.code(), "TICKET_NOT_FOUND_OFFLINE");
    }

    #[test]
    fn test_store_then_validate() {
        let store = store();
        store.store_ticket("T1", ticket_data(&far_future()), None);

        let outcome = store
            .validate_ticket_offline("T1", &ScanContext::default())
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.scan_info.offline);
        assert_eq!(outcome.validation_count, 1);

        let entry = store.get_ticket("T1").unwrap();
        assert_eq!(entry.scan_history.len(), 1);
        assert!(entry.last_validated.is_some());
    }

    #[test]
    fn test_expiry_dominates() {
        let store = store();
        let expired = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        store.store_ticket("T1", ticket_data(&expired), None);

        let err = store
            .validate_ticket_offline("T1", &ScanContext::default())
            .unwrap_err();
        assert_eq!(err.code(), "TICKET_EXPIRED_OFFLINE");
    }

    #[test]
    fn test_revoked_ticket_rejected() {
        let store = store();
        store.store_ticket("T1", ticket_data(&far_future()), None);
        store.tickets.get_mut("T1").unwrap().status = OfflineStatus::Revoked;

        let err = store
            .validate_ticket_offline("T1", &ScanContext::default())
            .unwrap_err();
        assert_eq!(err.code(), "TICKET_INACTIVE_OFFLINE");
    }

    #[test]
    fn test_five_validations_accepted_sixth_rejected() {
        let store = store();
        store.store_ticket("T1", ticket_data(&far_future()), None);

        for i in 1..=5 {
            let outcome = store
                .validate_ticket_offline("T1", &ScanContext::default())
                .unwrap();
            assert_eq!(outcome.validation_count, i);
        }
        let err = store
            .validate_ticket_offline("T1", &ScanContext::default())
            .unwrap_err();
        assert_eq!(err.code(), "MAX_SCANS_EXCEEDED_OFFLINE");
    }

    #[test]
    fn test_pending_queue_keyed_by_ticket() {
        let store = store();
        store.store_ticket("T1", ticket_data(&far_future()), None);
        assert_eq!(store.pending_count(), 1);

        // A validation replaces the store intent for the same ticket.
        store
            .validate_ticket_offline("T1", &ScanContext::default())
            .unwrap();
        assert_eq!(store.pending_count(), 1);
        let entry = store.pending.get("T1").unwrap();
        assert_eq!(entry.action, SyncAction::Validate);
    }

    #[test]
    fn test_cleanup_removes_expired_only() {
        let store = store();
        store.store_ticket("LIVE", ticket_data(&far_future()), None);
        let expired = (Utc::now() - chrono::Duration::minutes(5)).to_rfc3339();
        store.store_ticket("DEAD", ticket_data(&expired), None);

        assert_eq!(store.cleanup_expired(), 1);
        assert!(store.get_ticket("LIVE").is_some());
        assert!(store.get_ticket("DEAD").is_none());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let store = store();
        store.store_ticket("T1", ticket_data(&far_future()), None);
        store
            .validate_ticket_offline("T1", &ScanContext::default())
            .unwrap();
        store.snapshot().unwrap();

        let restored = OfflineStore::new(
            Duration::from_secs(3600),
            store.snapshot_path.clone(),
        );
        restored.restore();
        assert_eq!(restored.ticket_count(), 1);
        assert_eq!(restored.pending_count(), 1);
        let entry = restored.get_ticket("T1").unwrap();
        assert_eq!(entry.validation_count, 1);
        assert_eq!(entry.scan_history.len(), 1);

        std::fs::remove_file(&store.snapshot_path).ok();
    }

    #[test]
    fn test_restore_with_missing_snapshot_is_clean_start() {
        let store = store();
        store.restore();
        assert_eq!(store.ticket_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_refuses_overlap() {
        let store = store();
        store.sync_running.store(true, Ordering::SeqCst);
        let config = crate::config::Config::default();
        let rules = RulesClient::new(&config);
        assert!(store.sync_pending(&rules, 10).await.is_none());
    }
}
