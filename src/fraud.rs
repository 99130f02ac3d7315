//! Fraud-pattern analyzer — sliding-window heuristics over scan activity
//! with a composite risk score and action recommendations.
//!
//! Histories live in process memory, keyed per pattern, pruned to their
//! window on every touch and swept wholesale every 24 h. The analyzer
//! never blocks a scan by itself; the orchestrator decides what to do
//! with the verdict.

use crate::types::{FraudFlag, FraudType, ScanContext, Severity, TicketClaims};
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use tracing::debug;

// Pattern windows and thresholds.
const RAPID_SCAN_WINDOW_SECS: i64 = 10;
const RAPID_SCAN_THRESHOLD: usize = 5;
const LOCATION_HOP_WINDOW_SECS: i64 = 300;
const LOCATION_HOP_THRESHOLD: usize = 3;
const VOLUME_WINDOW_SECS: i64 = 3600;
const VOLUME_THRESHOLD: usize = 100;
const CYCLIC_MIN_INTERVALS: usize = 3;
const CLOCK_SKEW_LIMIT_SECS: i64 = 60;

// Composite scores per pattern.
const SCORE_RAPID_SCANS: u32 = 40;
const SCORE_LOCATION_HOPPING: u32 = 30;
const SCORE_VOLUME_ANOMALY: u32 = 50;
const SCORE_OFF_HOURS: u32 = 20;
const SCORE_CYCLIC_SCANS: u32 = 25;
const SCORE_METADATA_MAX: u32 = 25;

// History caps. The per-address volume buffer must hold more than the
// volume threshold or the pattern could never fire.
const MAX_TRACKED_EVENTS: usize = 50;
const MAX_TRACKED_INTERVALS: usize = 10;
const MAX_TRACKED_IP_EVENTS: usize = 2 * VOLUME_THRESHOLD;

lazy_static::lazy_static! {
    /// User-agent markers typical of scripted clients rather than the
    /// checkpoint scanner app.
    static ref BOT_UA_MARKERS: Vec<&'static str> = vec![
        "bot", "curl", "wget", "python", "httpclient", "spider",
        "scraper", "headless", "phantom",
    ];
}

/// Analyzer verdict for one scan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudAnalysis {
    pub is_suspicious: bool,
    pub fraud_flags: Vec<FraudFlag>,
    pub risk_score: u32,
    pub recommendations: Vec<String>,
}

impl FraudAnalysis {
    pub fn wants_block(&self) -> bool {
        self.recommendations.iter().any(|r| r == "block_scan")
    }
}

#[derive(Debug)]
pub struct FraudAnalyzer {
    /// ticketId:ip → recent scan instants (rapid_scans).
    rapid_events: DashMap<String, VecDeque<DateTime<Utc>>>,
    /// ticketId → recent (instant, location) pairs (location_hopping).
    location_events: DashMap<String, VecDeque<(DateTime<Utc>, String)>>,
    /// ip → recent scan instants (volume_anomaly).
    ip_events: DashMap<String, VecDeque<DateTime<Utc>>>,
    /// ticketId → last inter-scan intervals in seconds (cyclic_scans).
    intervals: DashMap<String, VecDeque<f64>>,
    /// ticketId → previous scan instant, for interval derivation.
    last_seen: DashMap<String, DateTime<Utc>>,
}

impl FraudAnalyzer {
    pub fn new() -> Self {
        Self {
            rapid_events: DashMap::new(),
            location_events: DashMap::new(),
            ip_events: DashMap::new(),
            intervals: DashMap::new(),
            last_seen: DashMap::new(),
        }
    }

    /// Evaluate all patterns against one scan. `now` is the server scan
    /// instant.
    pub fn analyze(
        &self,
        claims: &TicketClaims,
        context: &ScanContext,
        now: DateTime<Utc>,
    ) -> FraudAnalysis {
        let mut flags = Vec::new();
        let mut score = 0u32;
        let mut recommendations = Vec::new();

        let ip = context.ip_address.clone().unwrap_or_else(|| "unknown".into());

        // ── rapid_scans: same ticket + ip hammering the gate ────────
        let rapid_key = format!("{}:{}", claims.ticket_id, ip);
        let rapid_count = record_event(
            &self.rapid_events,
            &rapid_key,
            now,
            ChronoDuration::seconds(RAPID_SCAN_WINDOW_SECS),
            MAX_TRACKED_EVENTS,
        );
        if rapid_count >= RAPID_SCAN_THRESHOLD {
            score += SCORE_RAPID_SCANS;
            flags.push(FraudFlag::new(
                FraudType::RapidScans,
                Severity::Medium,
                json!({ "count": rapid_count, "windowSeconds": RAPID_SCAN_WINDOW_SECS }),
            ));
            recommendations.push("increase_monitoring".to_string());
        }

        // ── location_hopping: one ticket across distinct gates ──────
        if let Some(location) = &context.location {
            let distinct = {
                let mut entry = self
                    .location_events
                    .entry(claims.ticket_id.clone())
                    .or_default();
                let horizon = now - ChronoDuration::seconds(LOCATION_HOP_WINDOW_SECS);
                entry.retain(|(t, _)| *t >= horizon);
                entry.push_back((now, location.clone()));
                truncate_front(&mut entry, MAX_TRACKED_EVENTS);
                let mut seen: Vec<&str> = entry.iter().map(|(_, l)| l.as_str()).collect();
                seen.sort_unstable();
                seen.dedup();
                seen.len()
            };
            if distinct >= LOCATION_HOP_THRESHOLD {
                score += SCORE_LOCATION_HOPPING;
                flags.push(FraudFlag::new(
                    FraudType::LocationHopping,
                    Severity::Medium,
                    json!({
                        "distinctLocations": distinct,
                        "windowSeconds": LOCATION_HOP_WINDOW_SECS,
                    }),
                ));
                recommendations.push("verify_ticket_holder_identity".to_string());
            }
        }

        // ── volume_anomaly: one source address, too many scans ──────
        let ip_count = record_event(
            &self.ip_events,
            &ip,
            now,
            ChronoDuration::seconds(VOLUME_WINDOW_SECS),
            MAX_TRACKED_IP_EVENTS,
        );
        if ip_count >= VOLUME_THRESHOLD {
            score += SCORE_VOLUME_ANOMALY;
            flags.push(FraudFlag::new(
                FraudType::VolumeAnomaly,
                Severity::High,
                json!({ "count": ip_count, "windowSeconds": VOLUME_WINDOW_SECS }),
            ));
            recommendations.push("block_ip_temporarily".to_string());
        }

        // ── off_hours: scans in the dead of night ───────────────────
        let local_hour = now.with_timezone(&chrono::Local).hour();
        if is_off_hours(local_hour) {
            score += SCORE_OFF_HOURS;
            flags.push(FraudFlag::new(
                FraudType::OffHours,
                Severity::Low,
                json!({ "localHour": local_hour }),
            ));
            recommendations.push("verify_operator_authorization".to_string());
        }

        // ── cyclic_scans: machine-regular inter-scan rhythm ─────────
        if let Some(previous) = self.last_seen.insert(claims.ticket_id.clone(), now) {
            let interval = (now - previous).num_milliseconds() as f64 / 1000.0;
            let mut entry = self.intervals.entry(claims.ticket_id.clone()).or_default();
            entry.push_back(interval);
            truncate_front(&mut entry, MAX_TRACKED_INTERVALS);
            if let Some((mean, variance)) = mean_variance(&entry) {
                if entry.len() >= CYCLIC_MIN_INTERVALS && variance < 0.2 * mean {
                    score += SCORE_CYCLIC_SCANS;
                    flags.push(FraudFlag::new(
                        FraudType::CyclicScans,
                        Severity::Medium,
                        json!({
                            "intervals": entry.len(),
                            "meanSeconds": mean,
                            "variance": variance,
                        }),
                    ));
                    recommendations.push("investigate_automation".to_string());
                }
            }
        }

        // ── metadata_anomaly: client metadata that does not add up ──
        let metadata_score = self.metadata_score(context, now, &mut flags);
        if metadata_score > 0 {
            score += metadata_score.min(SCORE_METADATA_MAX);
            recommendations.push("review_device_metadata".to_string());
        }

        // Threshold-driven actions join the pattern-specific ones.
        if score >= 80 {
            recommendations.push("block_scan".to_string());
        }
        if score >= 60 {
            recommendations.push("require_additional_verification".to_string());
        }
        if score >= 40 {
            recommendations.push("increase_monitoring".to_string());
        }
        recommendations.sort_unstable();
        recommendations.dedup();

        let analysis = FraudAnalysis {
            is_suspicious: score > 50 || !flags.is_empty(),
            fraud_flags: flags,
            risk_score: score.min(100),
            recommendations,
        };
        if analysis.is_suspicious {
            debug!(
                ticket_id = %claims.ticket_id,
                risk_score = analysis.risk_score,
                flags = analysis.fraud_flags.len(),
                "suspicious scan pattern"
            );
        }
        analysis
    }

    fn metadata_score(
        &self,
        context: &ScanContext,
        now: DateTime<Utc>,
        flags: &mut Vec<FraudFlag>,
    ) -> u32 {
        let mut score = 0u32;
        let mut details = Vec::new();

        if let Some(ua) = &context.user_agent {
            let lowered = ua.to_lowercase();
            if BOT_UA_MARKERS.iter().any(|marker| lowered.contains(marker)) {
                score += 10;
                details.push("bot-like user agent");
            }
        }
        if let Some(ip) = &context.ip_address {
            if is_private_ip(ip) {
                score += 10;
                details.push("private source address");
            }
        }
        if let Some(device_time) = context.timestamp {
            let skew = (now - device_time).num_seconds().abs();
            if skew > CLOCK_SKEW_LIMIT_SECS {
                score += 10;
                details.push("device clock skew");
            }
        }

        if score > 0 {
            flags.push(FraudFlag::new(
                FraudType::MetadataAnomaly,
                Severity::Low,
                json!({ "indicators": details }),
            ));
        }
        score
    }

    /// Drop per-key histories with no activity in the last 24 h.
    pub fn cleanup_histories(&self) -> usize {
        let horizon = Utc::now() - ChronoDuration::hours(24);
        let before = self.tracked_keys();

        self.rapid_events
            .retain(|_, events| events.back().is_some_and(|t| *t >= horizon));
        self.location_events
            .retain(|_, events| events.back().is_some_and(|(t, _)| *t >= horizon));
        self.ip_events
            .retain(|_, events| events.back().is_some_and(|t| *t >= horizon));
        self.last_seen.retain(|_, t| *t >= horizon);
        self.intervals
            .retain(|ticket, _| self.last_seen.contains_key(ticket));

        before.saturating_sub(self.tracked_keys())
    }

    fn tracked_keys(&self) -> usize {
        self.rapid_events.len()
            + self.location_events.len()
            + self.ip_events.len()
            + self.intervals.len()
            + self.last_seen.len()
    }
}

impl Default for FraudAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Append an event to a windowed history and return the count inside the
/// window, current event included.
fn record_event(
    histories: &DashMap<String, VecDeque<DateTime<Utc>>>,
    key: &str,
    now: DateTime<Utc>,
    window: ChronoDuration,
    cap: usize,
) -> usize {
    let mut entry = histories.entry(key.to_string()).or_default();
    let horizon = now - window;
    entry.retain(|t| *t >= horizon);
    entry.push_back(now);
    truncate_front(&mut entry, cap);
    entry.len()
}

fn truncate_front<T>(deque: &mut VecDeque<T>, cap: usize) {
    while deque.len() > cap {
        deque.pop_front();
    }
}

/// Population mean and variance of the interval buffer.
fn mean_variance(intervals: &VecDeque<f64>) -> Option<(f64, f64)> {
    if intervals.is_empty() {
        return None;
    }
    let n = intervals.len() as f64;
    let mean = intervals.iter().sum::<f64>() / n;
    let variance = intervals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance))
}

/// Admissions at 2–5 local are outside any plausible gate schedule.
fn is_off_hours(local_hour: u32) -> bool {
    (2..=5).contains(&local_hour)
}

fn is_private_ip(ip: &str) -> bool {
    if ip.starts_with("10.") || ip.starts_with("192.168.") || ip.starts_with("127.") {
        return true;
    }
    // 172.16.0.0/12
    if let Some(rest) = ip.strip_prefix("172.") {
        if let Some(second) = rest.split('.').next().and_then(|s| s.parse::<u8>().ok()) {
            return (16..=31).contains(&second);
        }
    }
    false
}
