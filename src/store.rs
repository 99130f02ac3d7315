//! Scan store — the durable record of sessions, scan logs, the per-ticket
//! cache, and fraud attempts.
//!
//! Every operation either returns the persisted row or a typed error.
//! The store never retries transient failures; the caller decides what a
//! failed write means for its flow.

use crate::error::StoreError;
use crate::types::ScanResultKind;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

// ── Row types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSession {
    pub id: i64,
    pub uid: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub operator_id: String,
    pub event_id: Option<String>,
    pub location: Option<String>,
    pub device_info: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanLog {
    pub id: i64,
    pub uid: Uuid,
    pub session_id: Option<i64>,
    pub scanned_at: DateTime<Utc>,
    pub result: String,
    pub location: Option<String>,
    pub device_id: Option<String>,
    pub ticket_id: String,
    pub ticket_data: Option<Value>,
    pub validation_details: Option<Value>,
    pub fraud_flags: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketCacheRow {
    pub ticket_id: String,
    pub first_scan_at: DateTime<Utc>,
    pub last_scan_at: DateTime<Utc>,
    pub scan_count: i64,
    pub scan_locations: Vec<String>,
    pub is_blocked: bool,
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudAttempt {
    pub id: i64,
    pub uid: Uuid,
    pub scan_log_id: i64,
    pub fraud_type: String,
    pub severity: String,
    pub details: Option<Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub blocked: bool,
}

// ── Write inputs ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewScanSession {
    pub operator_id: String,
    pub event_id: Option<String>,
    pub location: Option<String>,
    pub device_info: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewScanLog {
    pub session_id: Option<i64>,
    pub ticket_id: String,
    pub result: ScanResultKind,
    pub location: Option<String>,
    pub device_id: Option<String>,
    pub ticket_data: Option<Value>,
    pub validation_details: Option<Value>,
    pub fraud_flags: Option<Value>,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewFraudAttempt {
    pub scan_log_id: i64,
    pub fraud_type: String,
    pub severity: String,
    pub details: Option<Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub blocked: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilters {
    pub operator_id: Option<String>,
    pub event_id: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScanStats {
    pub event_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub total_scans: i64,
    pub unique_tickets: i64,
    pub successful_scans: i64,
    pub failed_scans: i64,
    pub fraud_attempts: i64,
    pub locations: Vec<String>,
    pub success_rate: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSummary {
    pub scan_logs_deleted: u64,
    pub sessions_deleted: u64,
    pub fraud_attempts_deleted: u64,
    pub cache_rows_deleted: u64,
}

// ── Store ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScanStore {
    pool: PgPool,
}

impl ScanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_scan_session(
        &self,
        new: NewScanSession,
    ) -> Result<ScanSession, StoreError> {
        let row = sqlx::query(
            r#"INSERT INTO scan_sessions (uid, scan_operator_id, event_id, location, device_info)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.operator_id)
        .bind(&new.event_id)
        .bind(&new.location)
        .bind(&new.device_info)
        .fetch_one(&self.pool)
        .await?;
        Ok(session_from_row(&row))
    }

    pub async fn end_scan_session(&self, id: i64) -> Result<ScanSession, StoreError> {
        let row = sqlx::query(
            r#"UPDATE scan_sessions SET ended_at = NOW()
               WHERE id = $1 AND ended_at IS NULL
               RETURNING *"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("active scan session"))?;
        Ok(session_from_row(&row))
    }

    pub async fn get_active_scan_sessions(
        &self,
        filters: SessionFilters,
    ) -> Result<Vec<ScanSession>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM scan_sessions
               WHERE ended_at IS NULL
                 AND ($1::text IS NULL OR scan_operator_id = $1)
                 AND ($2::text IS NULL OR event_id = $2)
                 AND ($3::text IS NULL OR location = $3)
               ORDER BY started_at DESC"#,
        )
        .bind(&filters.operator_id)
        .bind(&filters.event_id)
        .bind(&filters.location)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    /// Append one scan log. Append-only: logs are never mutated.
    pub async fn record_scan(&self, new: NewScanLog) -> Result<ScanLog, StoreError> {
        let row = sqlx::query(
            r#"INSERT INTO scan_logs
                 (uid, scan_session_id, result, location, device_id,
                  ticket_id, ticket_data, validation_details, fraud_flags, created_by)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(new.session_id)
        .bind(new.result.as_str())
        .bind(&new.location)
        .bind(&new.device_id)
        .bind(&new.ticket_id)
        .bind(&new.ticket_data)
        .bind(&new.validation_details)
        .bind(&new.fraud_flags)
        .bind(&new.created_by)
        .fetch_one(&self.pool)
        .await?;
        Ok(scan_log_from_row(&row))
    }

    /// Upsert the per-ticket cache row: first scan inserts, later scans
    /// bump the counter and location set. Crossing `max_scans` blocks the
    /// ticket for every subsequent scan.
    pub async fn upsert_ticket_cache(
        &self,
        ticket_id: &str,
        location: Option<&str>,
        max_scans: i64,
    ) -> Result<TicketCacheRow, StoreError> {
        let row = sqlx::query(
            r#"INSERT INTO scanned_tickets_cache
                 (ticket_id, scan_locations)
               VALUES ($1, CASE WHEN $2::text IS NULL THEN '{}'::text[] ELSE ARRAY[$2] END)
               ON CONFLICT (ticket_id) DO UPDATE SET
                 last_scan_at = NOW(),
                 scan_count = scanned_tickets_cache.scan_count + 1,
                 scan_locations = CASE
                   WHEN $2::text IS NULL OR $2 = ANY(scanned_tickets_cache.scan_locations)
                     THEN scanned_tickets_cache.scan_locations
                   ELSE array_append(scanned_tickets_cache.scan_locations, $2)
                 END,
                 is_blocked = scanned_tickets_cache.is_blocked
                   OR scanned_tickets_cache.scan_count + 1 > $3,
                 block_reason = CASE
                   WHEN scanned_tickets_cache.is_blocked
                     THEN scanned_tickets_cache.block_reason
                   WHEN scanned_tickets_cache.scan_count + 1 > $3
                     THEN 'Trop de scans'
                   ELSE scanned_tickets_cache.block_reason
                 END,
                 updated_at = NOW()
               RETURNING *"#,
        )
        .bind(ticket_id)
        .bind(location)
        .bind(max_scans)
        .fetch_one(&self.pool)
        .await?;
        Ok(cache_row_from_row(&row))
    }

    pub async fn get_ticket_cache(
        &self,
        ticket_id: &str,
    ) -> Result<Option<TicketCacheRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM scanned_tickets_cache WHERE ticket_id = $1")
            .bind(ticket_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(cache_row_from_row))
    }

    pub async fn create_fraud_attempt(
        &self,
        new: NewFraudAttempt,
    ) -> Result<FraudAttempt, StoreError> {
        let row = sqlx::query(
            r#"INSERT INTO fraud_attempts
                 (uid, scan_log_id, fraud_type, severity, details,
                  ip_address, user_agent, blocked)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(new.scan_log_id)
        .bind(&new.fraud_type)
        .bind(&new.severity)
        .bind(&new.details)
        .bind(&new.ip_address)
        .bind(&new.user_agent)
        .bind(new.blocked)
        .fetch_one(&self.pool)
        .await?;
        Ok(FraudAttempt {
            id: row.get("id"),
            uid: row.get("uid"),
            scan_log_id: row.get("scan_log_id"),
            fraud_type: row.get("fraud_type"),
            severity: row.get("severity"),
            details: row.get("details"),
            ip_address: row.get("ip_address"),
            user_agent: row.get("user_agent"),
            blocked: row.get("blocked"),
        })
    }

    /// Paginated scan history for one ticket: newest first, plus the
    /// total count for the pagination envelope.
    pub async fn get_ticket_scan_history(
        &self,
        ticket_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ScanLog>, i64), StoreError> {
        let limit = limit.clamp(1, 100);
        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM scan_logs WHERE ticket_id = $1")
            .bind(ticket_id)
            .fetch_one(&self.pool)
            .await?
            .get("n");

        let rows = sqlx::query(
            r#"SELECT * FROM scan_logs
               WHERE ticket_id = $1
               ORDER BY scanned_at DESC
               LIMIT $2 OFFSET $3"#,
        )
        .bind(ticket_id)
        .bind(limit)
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok((rows.iter().map(scan_log_from_row).collect(), total))
    }

    pub async fn get_ticket_logs(
        &self,
        ticket_id: &str,
        limit: i64,
    ) -> Result<Vec<ScanLog>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM scan_logs
               WHERE ticket_id = $1
               ORDER BY scanned_at DESC
               LIMIT $2"#,
        )
        .bind(ticket_id)
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(scan_log_from_row).collect())
    }

    /// Event statistics over a window, defaulting to the last 24 hours.
    pub async fn get_event_scan_stats(
        &self,
        event_id: &str,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<EventScanStats, StoreError> {
        let end = end_date.unwrap_or_else(Utc::now);
        let start = start_date.unwrap_or(end - ChronoDuration::hours(24));

        let row = sqlx::query(
            r#"SELECT
                 COUNT(*) AS total_scans,
                 COUNT(DISTINCT ticket_id) AS unique_tickets,
                 COUNT(*) FILTER (WHERE result = 'valid') AS successful_scans,
                 COUNT(*) FILTER (WHERE result <> 'valid') AS failed_scans,
                 COUNT(*) FILTER (WHERE result = 'fraud_detected') AS fraud_attempts
               FROM scan_logs
               WHERE ticket_data ->> 'eventId' = $1
                 AND scanned_at >= $2 AND scanned_at <= $3"#,
        )
        .bind(event_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        let locations: Vec<String> = sqlx::query(
            r#"SELECT DISTINCT location FROM scan_logs
               WHERE ticket_data ->> 'eventId' = $1
                 AND scanned_at >= $2 AND scanned_at <= $3
                 AND location IS NOT NULL"#,
        )
        .bind(event_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| r.get("location"))
        .collect();

        let total: i64 = row.get("total_scans");
        let successful: i64 = row.get("successful_scans");
        Ok(EventScanStats {
            event_id: event_id.to_string(),
            start_date: start,
            end_date: end,
            total_scans: total,
            unique_tickets: row.get("unique_tickets"),
            successful_scans: successful,
            failed_scans: row.get("failed_scans"),
            fraud_attempts: row.get("fraud_attempts"),
            locations,
            success_rate: success_rate(successful, total),
        })
    }

    /// Retention sweep: scan logs, ended sessions and fraud attempts past
    /// the cutoff are deleted. Cache rows survive unless the ticket's own
    /// validity has lapsed.
    pub async fn cleanup_old_scans(&self, retention_days: i64) -> Result<CleanupSummary, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days.max(0));
        let mut summary = CleanupSummary::default();

        // Cache rows are judged before their supporting logs disappear.
        summary.cache_rows_deleted = sqlx::query(
            r#"DELETE FROM scanned_tickets_cache c
               WHERE EXISTS (
                 SELECT 1 FROM scan_logs l
                 WHERE l.ticket_id = c.ticket_id
                   AND (l.ticket_data ->> 'expiresAt')::timestamptz < NOW()
               )"#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        summary.fraud_attempts_deleted = sqlx::query(
            "DELETE FROM fraud_attempts WHERE created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        summary.scan_logs_deleted = sqlx::query("DELETE FROM scan_logs WHERE scanned_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        summary.sessions_deleted = sqlx::query(
            "DELETE FROM scan_sessions WHERE ended_at IS NOT NULL AND ended_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        info!(
            retention_days,
            scan_logs = summary.scan_logs_deleted,
            sessions = summary.sessions_deleted,
            fraud_attempts = summary.fraud_attempts_deleted,
            cache_rows = summary.cache_rows_deleted,
            "retention sweep completed"
        );
        Ok(summary)
    }
}

// ── Row mapping ─────────────────────────────────────────────────

fn session_from_row(row: &PgRow) -> ScanSession {
    ScanSession {
        id: row.get("id"),
        uid: row.get("uid"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        operator_id: row.get("scan_operator_id"),
        event_id: row.get("event_id"),
        location: row.get("location"),
        device_info: row.get("device_info"),
    }
}

fn scan_log_from_row(row: &PgRow) -> ScanLog {
    ScanLog {
        id: row.get("id"),
        uid: row.get("uid"),
        session_id: row.get("scan_session_id"),
        scanned_at: row.get("scanned_at"),
        result: row.get("result"),
        location: row.get("location"),
        device_id: row.get("device_id"),
        ticket_id: row.get("ticket_id"),
        ticket_data: row.get("ticket_data"),
        validation_details: row.get("validation_details"),
        fraud_flags: row.get("fraud_flags"),
    }
}

fn cache_row_from_row(row: &PgRow) -> TicketCacheRow {
    TicketCacheRow {
        ticket_id: row.get("ticket_id"),
        first_scan_at: row.get("first_scan_at"),
        last_scan_at: row.get("last_scan_at"),
        scan_count: row.get("scan_count"),
        scan_locations: row.get("scan_locations"),
        is_blocked: row.get("is_blocked"),
        block_reason: row.get("block_reason"),
    }
}

fn success_rate(successful: i64, total: i64) -> String {
    if total == 0 {
        "0.0%".to_string()
    } else {
        format!("{:.1}%", successful as f64 / total as f64 * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_formatting() {
        assert_eq!(success_rate(0, 0), "0.0%");
        assert_eq!(success_rate(1, 2), "50.0%");
        assert_eq!(success_rate(2, 3), "66.7%");
        assert_eq!(success_rate(10, 10), "100.0%");
    }

    #[test]
    fn test_event_stats_serialization_shape() {
        let stats = EventScanStats {
            event_id: "E1".into(),
            start_date: Utc::now(),
            end_date: Utc::now(),
            total_scans: 4,
            unique_tickets: 3,
            successful_scans: 3,
            failed_scans: 1,
            fraud_attempts: 0,
            locations: vec!["Main".into()],
            success_rate: success_rate(3, 4),
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["totalScans"], 4);
        assert_eq!(json["successRate"], "75.0%");
        assert_eq!(json["locations"][0], "Main");
    }

    #[test]
    fn test_cleanup_summary_default_is_zeroed() {
        let summary = CleanupSummary::default();
        assert_eq!(summary.scan_logs_deleted, 0);
        assert_eq!(summary.cache_rows_deleted, 0);
    }
}
