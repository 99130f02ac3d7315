//! Per-operation circuit breaker with a bucketed rolling error window.
//!
//! Closed passes calls through while tracking success/failure counts in
//! rotating buckets. When the rolling error percentage crosses the
//! threshold the breaker opens and fails fast. After `reset_timeout` a
//! single probe call is admitted (half-open); its outcome decides between
//! closing and re-opening.

use crate::error::ValidationError;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Minimum calls inside the rolling window before the error percentage
/// is allowed to trip the breaker.
const REQUEST_VOLUME_THRESHOLD: u64 = 5;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub error_threshold_percentage: f64,
    pub reset_timeout: Duration,
    pub rolling_count_window: Duration,
    pub rolling_count_buckets: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_percentage: 50.0,
            reset_timeout: Duration::from_secs(30),
            rolling_count_window: Duration::from_secs(10),
            rolling_count_buckets: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Bucket {
    start: Instant,
    success: u64,
    failure: u64,
}

#[derive(Debug)]
struct Inner {
    state: State,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    buckets: VecDeque<Bucket>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                opened_at: None,
                probe_in_flight: false,
                buckets: VecDeque::new(),
            }),
        }
    }

    /// Gate a call. `Err` means fail fast with `CORE_SERVICE_UNAVAILABLE`
    /// without touching the network.
    pub fn before_call(&self) -> Result<(), ValidationError> {
        let mut inner = self.lock();
        match inner.state {
            State::Closed => Ok(()),
            State::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    info!(breaker = self.name, "circuit half-open, admitting probe");
                    inner.state = State::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(ValidationError::CoreServiceUnavailable)
                }
            }
            State::HalfOpen => {
                if inner.probe_in_flight {
                    Err(ValidationError::CoreServiceUnavailable)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            State::HalfOpen => {
                info!(breaker = self.name, "probe succeeded, circuit closed");
                inner.state = State::Closed;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                inner.buckets.clear();
            }
            _ => {
                let now = Instant::now();
                self.rotate(&mut inner, now);
                if let Some(bucket) = inner.buckets.back_mut() {
                    bucket.success += 1;
                }
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            State::HalfOpen => {
                warn!(breaker = self.name, "probe failed, circuit re-opened");
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
            State::Open => {}
            State::Closed => {
                let now = Instant::now();
                self.rotate(&mut inner, now);
                if let Some(bucket) = inner.buckets.back_mut() {
                    bucket.failure += 1;
                }
                let (success, failure) = window_totals(&inner.buckets);
                let total = success + failure;
                if total >= REQUEST_VOLUME_THRESHOLD {
                    let error_pct = failure as f64 / total as f64 * 100.0;
                    if error_pct >= self.config.error_threshold_percentage {
                        warn!(
                            breaker = self.name,
                            error_pct = format!("{error_pct:.1}"),
                            total,
                            "error threshold crossed, circuit opened"
                        );
                        inner.state = State::Open;
                        inner.opened_at = Some(Instant::now());
                        inner.buckets.clear();
                    }
                }
            }
        }
    }

    /// Current state label for the health snapshot.
    pub fn state_name(&self) -> &'static str {
        match self.lock().state {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().state == State::Open
    }

    fn bucket_duration(&self) -> Duration {
        let buckets = self.config.rolling_count_buckets.max(1) as u32;
        self.config.rolling_count_window / buckets
    }

    /// Advance the bucket ring: open a new bucket when the current one is
    /// full, drop buckets that slid out of the window.
    fn rotate(&self, inner: &mut Inner, now: Instant) {
        let bucket_len = self.bucket_duration();
        let needs_new = inner
            .buckets
            .back()
            .map(|b| now.duration_since(b.start) >= bucket_len)
            .unwrap_or(true);
        if needs_new {
            inner.buckets.push_back(Bucket { start: now, success: 0, failure: 0 });
        }
        let horizon = self.config.rolling_count_window;
        while let Some(front) = inner.buckets.front() {
            if now.duration_since(front.start) > horizon {
                inner.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Poisoning only happens if a panic occurred mid-update; the
        // counters are still structurally sound, so keep serving.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn window_totals(buckets: &VecDeque<Bucket>) -> (u64, u64) {
    buckets
        .iter()
        .fold((0, 0), |(s, f), b| (s + b.success, f + b.failure))
}
