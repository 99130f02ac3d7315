//! Hot ticket cache — the in-memory per-ticket row consulted before the
//! database cache. Authoritative for a short TTL; misses backfill from
//! the scan store and every write goes through to both.

use crate::error::StoreError;
use crate::store::{ScanStore, TicketCacheRow};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HotEntry {
    pub scan_count: i64,
    pub scan_locations: Vec<String>,
    pub last_scan: DateTime<Utc>,
    pub is_blocked: bool,
    pub block_reason: Option<String>,
}

impl From<&TicketCacheRow> for HotEntry {
    fn from(row: &TicketCacheRow) -> Self {
        Self {
            scan_count: row.scan_count,
            scan_locations: row.scan_locations.clone(),
            last_scan: row.last_scan_at,
            is_blocked: row.is_blocked,
            block_reason: row.block_reason.clone(),
        }
    }
}

#[derive(Debug)]
pub struct HotCache {
    entries: DashMap<String, HotEntry>,
    ttl: ChronoDuration,
}

impl HotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: ChronoDuration::seconds(ttl.as_secs() as i64),
        }
    }

    /// Constant-time status lookup. Entries past the TTL are treated as
    /// misses and dropped on contact.
    pub fn get(&self, ticket_id: &str) -> Option<HotEntry> {
        let fresh = self
            .entries
            .get(ticket_id)
            .filter(|e| Utc::now() - e.last_scan <= self.ttl)
            .map(|e| e.clone());
        if fresh.is_none() {
            self.entries.remove_if(ticket_id, |_, e| Utc::now() - e.last_scan > self.ttl);
        }
        fresh
    }

    /// Lookup with read-through: a miss consults the store and backfills.
    pub async fn status(
        &self,
        store: &ScanStore,
        ticket_id: &str,
    ) -> Result<Option<HotEntry>, StoreError> {
        if let Some(entry) = self.get(ticket_id) {
            return Ok(Some(entry));
        }
        let row = store.get_ticket_cache(ticket_id).await?;
        Ok(row.map(|row| {
            let entry = HotEntry::from(&row);
            self.entries.insert(ticket_id.to_string(), entry.clone());
            entry
        }))
    }

    /// Write-through update after the store upsert returned the fresh row.
    pub fn apply_row(&self, row: &TicketCacheRow) {
        self.entries
            .insert(row.ticket_id.clone(), HotEntry::from(row));
    }

    /// Periodic TTL sweep. Returns the number of evicted entries.
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        let horizon = Utc::now() - self.ttl;
        self.entries.retain(|_, e| e.last_scan >= horizon);
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(evicted, "hot cache TTL sweep");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ticket_id: &str, scan_count: i64, last_scan: DateTime<Utc>) -> TicketCacheRow {
        TicketCacheRow {
            ticket_id: ticket_id.into(),
            first_scan_at: last_scan,
            last_scan_at: last_scan,
            scan_count,
            scan_locations: vec!["Main".into()],
            is_blocked: false,
            block_reason: None,
        }
    }

    #[test]
    fn test_write_through_then_hit() {
        let cache = HotCache::new(Duration::from_secs(300));
        cache.apply_row(&row("T1", 1, Utc::now()));

        let entry = cache.get("T1").unwrap();
        assert_eq!(entry.scan_count, 1);
        assert_eq!(entry.scan_locations, vec!["Main".to_string()]);
        assert!(cache.get("T2").is_none());
    }

    #[test]
    fn test_stale_entry_is_a_miss() {
        let cache = HotCache::new(Duration::from_secs(300));
        let stale = Utc::now() - ChronoDuration::seconds(301);
        cache.apply_row(&row("T1", 3, stale));

        assert!(cache.get("T1").is_none());
        // Dropped on contact, not just filtered.
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sweep_evicts_only_expired() {
        let cache = HotCache::new(Duration::from_secs(300));
        cache.apply_row(&row("fresh", 1, Utc::now()));
        cache.apply_row(&row("stale", 1, Utc::now() - ChronoDuration::seconds(600)));

        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("fresh").is_some());
    }

    #[test]
    fn test_apply_row_updates_block_state() {
        let cache = HotCache::new(Duration::from_secs(300));
        cache.apply_row(&row("T1", 5, Utc::now()));

        let mut blocked = row("T1", 6, Utc::now());
        blocked.is_blocked = true;
        blocked.block_reason = Some("Trop de scans".into());
        cache.apply_row(&blocked);

        let entry = cache.get("T1").unwrap();
        assert!(entry.is_blocked);
        assert_eq!(entry.block_reason.as_deref(), Some("Trop de scans"));
    }
}
