//! # Circuit Breaker
//!
//! Failure-rate state machine protecting downstream dependencies from cascade
//! failures. One breaker per protected target, shared by all concurrent
//! callers through the registry.
//!
//! ## States
//! - **Closed**: calls pass through; outcomes feed a sliding window of the
//!   last N calls, and the circuit opens when the failure fraction reaches the
//!   configured threshold
//! - **Open**: calls fail fast with `CircuitOpen`, no network attempt; after
//!   `open_duration` the next caller transitions the breaker to half-open
//! - **HalfOpen**: a bounded number of trial calls are admitted; enough
//!   successes close the circuit, a single failure reopens it and restarts
//!   the open timer
//!
//! Transitions are the sole mutator of breaker state and run inside one short
//! `parking_lot::Mutex` guarding only the state fields, never the network
//! call, so concurrent I/O is not serialized.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::config::BreakerSettings;
use crate::core::error::{GatewayError, GatewayResult};

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Internal state machine with per-state bookkeeping
#[derive(Debug)]
enum State {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { admitted: u32, successes: u32 },
}

/// Sliding window over the most recent call outcomes
#[derive(Debug, Default)]
struct OutcomeWindow {
    outcomes: VecDeque<bool>,
    failures: usize,
}

impl OutcomeWindow {
    fn push(&mut self, success: bool, capacity: usize) {
        if self.outcomes.len() == capacity {
            if let Some(evicted) = self.outcomes.pop_front() {
                if !evicted {
                    self.failures -= 1;
                }
            }
        }
        self.outcomes.push_back(success);
        if !success {
            self.failures += 1;
        }
    }

    fn len(&self) -> usize {
        self.outcomes.len()
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.failures as f64 / self.outcomes.len() as f64
    }

    fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
    }
}

struct Inner {
    state: State,
    window: OutcomeWindow,
}

/// Lock-free counters for observability
#[derive(Debug, Default)]
pub struct BreakerMetrics {
    pub total_calls: AtomicU64,
    pub successful_calls: AtomicU64,
    pub failed_calls: AtomicU64,
    pub rejected_calls: AtomicU64,
    pub opened_count: AtomicU64,
    pub closed_count: AtomicU64,
}

/// Immutable metrics snapshot for admin/inspection
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetricsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub opened_count: u64,
    pub closed_count: u64,
}

impl BreakerMetrics {
    pub fn snapshot(&self) -> BreakerMetricsSnapshot {
        BreakerMetricsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            opened_count: self.opened_count.load(Ordering::Relaxed),
            closed_count: self.closed_count.load(Ordering::Relaxed),
        }
    }
}

/// Failure-rate circuit breaker for one protected call-site
pub struct CircuitBreaker {
    name: String,
    config: BreakerSettings,
    inner: Mutex<Inner>,
    metrics: Arc<BreakerMetrics>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                window: OutcomeWindow::default(),
            }),
            metrics: Arc::new(BreakerMetrics::default()),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BreakerSettings::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerSettings {
        &self.config
    }

    pub fn metrics(&self) -> Arc<BreakerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Current state (for logs, admin, and tests)
    pub fn state(&self) -> CircuitState {
        match self.inner.lock().state {
            State::Closed => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Gate a call attempt
    ///
    /// Returns `Ok(())` when the call may proceed; callers must follow up with
    /// exactly one `record_success` or `record_failure`. Rejected calls must
    /// not record anything.
    pub fn can_proceed(&self) -> GatewayResult<()> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            State::Closed => {
                self.metrics.total_calls.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            State::Open { opened_at } => {
                if now.duration_since(opened_at) >= self.config.open_duration {
                    inner.state = State::HalfOpen {
                        admitted: 1,
                        successes: 0,
                    };
                    info!(breaker = %self.name, "Circuit half-open, probing for recovery");
                    self.metrics.total_calls.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                } else {
                    self.metrics.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("breaker_rejected_calls").increment(1);
                    Err(GatewayError::CircuitOpen {
                        name: self.name.clone(),
                    })
                }
            }
            State::HalfOpen {
                ref mut admitted, ..
            } => {
                if *admitted < self.config.half_open_max_calls {
                    *admitted += 1;
                    self.metrics.total_calls.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                } else {
                    self.metrics.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    Err(GatewayError::CircuitOpen {
                        name: self.name.clone(),
                    })
                }
            }
        }
    }

    /// Record a successful call outcome
    pub fn record_success(&self) {
        self.metrics
            .successful_calls
            .fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => {
                let capacity = self.config.window_size;
                inner.window.push(true, capacity);
            }
            State::Open { .. } => {
                // A straggler finishing after the circuit opened; ignored.
            }
            State::HalfOpen { ref mut successes, .. } => {
                *successes += 1;
                if *successes >= self.config.success_threshold {
                    inner.state = State::Closed;
                    inner.window.clear();
                    self.metrics.closed_count.fetch_add(1, Ordering::Relaxed);
                    info!(breaker = %self.name, "Circuit closed after successful trials");
                }
            }
        }
    }

    /// Discard an admitted call that never reached the upstream
    ///
    /// Local errors (no instance available, request build failures) say
    /// nothing about upstream health, so they feed neither the outcome window
    /// nor the half-open success count. In half-open the trial permit is
    /// returned so a real attempt can follow.
    pub fn record_skipped(&self) {
        let mut inner = self.inner.lock();
        if let State::HalfOpen {
            ref mut admitted, ..
        } = inner.state
        {
            *admitted = admitted.saturating_sub(1);
        }
    }

    /// Record a failed call outcome
    pub fn record_failure(&self) {
        self.metrics.failed_calls.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => {
                let capacity = self.config.window_size;
                inner.window.push(false, capacity);

                let observed = inner.window.len();
                let rate = inner.window.failure_rate();
                if observed >= self.config.minimum_calls as usize
                    && rate >= self.config.failure_rate_threshold
                {
                    inner.state = State::Open {
                        opened_at: Instant::now(),
                    };
                    inner.window.clear();
                    self.metrics.opened_count.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        breaker = %self.name,
                        failure_rate = rate,
                        observed,
                        "Circuit opened"
                    );
                }
            }
            State::Open { .. } => {}
            State::HalfOpen { .. } => {
                // Trial failed, reopen and restart the timer.
                inner.state = State::Open {
                    opened_at: Instant::now(),
                };
                self.metrics.opened_count.fetch_add(1, Ordering::Relaxed);
                warn!(breaker = %self.name, "Trial call failed, circuit reopened");
            }
        }
    }

    /// Run a fallible call through the breaker
    ///
    /// Transport failures and 5xx responses count as failures; 4xx responses
    /// count as successes (the upstream answered); local errors that never
    /// reached the upstream are discarded without recording an outcome.
    pub async fn call<F, T>(&self, f: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        self.can_proceed()?;

        match f.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                if error.should_trip_breaker() {
                    self.record_failure();
                } else if error.reflects_upstream_response() {
                    self.record_success();
                } else {
                    self.record_skipped();
                }
                Err(error)
            }
        }
    }

    /// Run a call with a caller-supplied fallback
    ///
    /// The fallback is invoked whenever the call is short-circuited or
    /// ultimately fails, producing a degraded stand-in response instead of
    /// an error.
    pub async fn call_with_fallback<F, T, FB>(&self, f: F, fallback: FB) -> T
    where
        F: Future<Output = GatewayResult<T>>,
        FB: FnOnce(GatewayError) -> T,
    {
        match self.call(f).await {
            Ok(value) => value,
            Err(error) => {
                debug!(breaker = %self.name, error = %error, "Serving fallback");
                fallback(error)
            }
        }
    }
}

/// Registry sharing one breaker per protected target across callers
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: parking_lot::RwLock<BreakerSettings>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: BreakerSettings) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config: parking_lot::RwLock::new(default_config),
        }
    }

    /// Get the breaker for a target, creating it with the default settings
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return Arc::clone(&breaker);
        }
        let config = self.default_config.read().clone();
        Arc::clone(
            &self
                .breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
        )
    }

    /// All breakers currently tracked
    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.iter().map(|e| Arc::clone(&e)).collect()
    }

    /// Apply reloaded thresholds: new defaults for future breakers and a
    /// fresh start for existing ones
    pub fn reconfigure(&self, config: BreakerSettings) {
        let changed = *self.default_config.read() != config;
        if !changed {
            return;
        }
        *self.default_config.write() = config;
        self.breakers.clear();
        info!("Circuit breaker thresholds reconfigured");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(window: usize, minimum: u32, open_ms: u64) -> BreakerSettings {
        BreakerSettings {
            window_size: window,
            failure_rate_threshold: 0.5,
            minimum_calls: minimum,
            open_duration: Duration::from_millis(open_ms),
            half_open_max_calls: 1,
            success_threshold: 1,
        }
    }

    fn drive_open(breaker: &CircuitBreaker, failures: u32) {
        for _ in 0..failures {
            breaker.can_proceed().unwrap();
            breaker.record_failure();
        }
    }

    #[test]
    fn test_initial_state_is_closed() {
        let breaker = CircuitBreaker::with_defaults("license");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_proceed().is_ok());
    }

    #[test]
    fn test_opens_at_failure_rate_threshold() {
        let breaker = CircuitBreaker::new("license", settings(20, 4, 60_000));

        // Three failures: below minimum_calls, still closed.
        drive_open(&breaker, 3);
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Fourth failure reaches minimum with 100% failure rate.
        drive_open(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_successes_keep_rate_below_threshold() {
        let breaker = CircuitBreaker::new("license", settings(10, 4, 60_000));

        // Alternate success/failure: rate stays at 50%... threshold is >=,
        // so interleave more successes than failures.
        for _ in 0..6 {
            breaker.can_proceed().unwrap();
            breaker.record_success();
        }
        for _ in 0..3 {
            breaker.can_proceed().unwrap();
            breaker.record_failure();
        }

        // 3 failures / 9 calls = 33% < 50%.
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_circuit_rejects_without_recording() {
        let breaker = CircuitBreaker::new("license", settings(20, 2, 60_000));
        drive_open(&breaker, 2);

        let err = breaker.can_proceed().unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
        assert_eq!(breaker.metrics().snapshot().rejected_calls, 1);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let breaker = CircuitBreaker::new("license", settings(20, 2, 20));
        drive_open(&breaker, 2);

        std::thread::sleep(Duration::from_millis(30));

        // First caller after open_duration becomes the trial.
        assert!(breaker.can_proceed().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Concurrent second caller is rejected while the trial is pending.
        assert!(matches!(
            breaker.can_proceed(),
            Err(GatewayError::CircuitOpen { .. })
        ));

        // Successful trial closes the circuit and subsequent calls pass.
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_proceed().is_ok());
    }

    #[test]
    fn test_failed_trial_reopens_with_fresh_timer() {
        let breaker = CircuitBreaker::new("license", settings(20, 2, 20));
        drive_open(&breaker, 2);

        std::thread::sleep(Duration::from_millis(30));
        breaker.can_proceed().unwrap();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        // Timer restarted: immediately after reopening, calls are rejected.
        assert!(breaker.can_proceed().is_err());
    }

    #[test]
    fn test_window_slides_over_old_outcomes() {
        let breaker = CircuitBreaker::new("license", settings(4, 4, 60_000));

        // Two early failures...
        drive_open(&breaker, 2);
        // ...pushed out of the window by four successes.
        for _ in 0..4 {
            breaker.can_proceed().unwrap();
            breaker.record_success();
        }

        // Window now holds only successes; two fresh failures give 50% of 4.
        drive_open(&breaker, 2);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_call_records_outcomes() {
        let breaker = CircuitBreaker::new("license", settings(20, 2, 60_000));

        let ok: GatewayResult<u32> = breaker.call(async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: GatewayResult<u32> = breaker
            .call(async {
                Err(GatewayError::remote_call(
                    "license",
                    crate::core::error::RemoteCallKind::Timeout,
                ))
            })
            .await;
        assert!(err.is_err());

        let snapshot = breaker.metrics().snapshot();
        assert_eq!(snapshot.successful_calls, 1);
        assert_eq!(snapshot.failed_calls, 1);
    }

    #[tokio::test]
    async fn test_client_errors_do_not_trip_breaker() {
        let breaker = CircuitBreaker::new("license", settings(20, 2, 60_000));

        for _ in 0..5 {
            let _: GatewayResult<u32> = breaker
                .call(async {
                    Err(GatewayError::remote_call(
                        "license",
                        crate::core::error::RemoteCallKind::Http4xx(404),
                    ))
                })
                .await;
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_local_errors_do_not_close_half_open_circuit() {
        let breaker = CircuitBreaker::new("license", settings(20, 2, 20));
        drive_open(&breaker, 2);

        tokio::time::sleep(Duration::from_millis(30)).await;

        // The trial call dies locally (no instance registered): the circuit
        // must stay half-open, not close on fabricated evidence.
        let result: GatewayResult<u32> = breaker
            .call(async {
                Err(GatewayError::NoAvailableInstance {
                    service: "license".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // The trial permit was returned, so the next caller is admitted.
        assert!(breaker.can_proceed().is_ok());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_local_errors_leave_the_window_untouched() {
        let breaker = CircuitBreaker::new("license", settings(20, 2, 60_000));

        for _ in 0..5 {
            let _: GatewayResult<u32> = breaker
                .call(async {
                    Err(GatewayError::NoAvailableInstance {
                        service: "license".to_string(),
                    })
                })
                .await;
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        let snapshot = breaker.metrics().snapshot();
        assert_eq!(snapshot.successful_calls, 0);
        assert_eq!(snapshot.failed_calls, 0);
    }

    #[tokio::test]
    async fn test_fallback_on_short_circuit() {
        let breaker = CircuitBreaker::new("license", settings(20, 2, 60_000));
        drive_open(&breaker, 2);

        let value = breaker
            .call_with_fallback(async { Ok("live".to_string()) }, |_| "cached".to_string())
            .await;

        assert_eq!(value, "cached");
    }

    #[test]
    fn test_registry_shares_breakers_per_target() {
        let registry = CircuitBreakerRegistry::new(BreakerSettings::default());

        let a = registry.get_or_create("license");
        let b = registry.get_or_create("license");
        let c = registry.get_or_create("firm");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.all().len(), 2);
    }

    #[test]
    fn test_registry_reconfigure_resets_breakers() {
        let registry = CircuitBreakerRegistry::new(BreakerSettings::default());
        let before = registry.get_or_create("license");
        // Default minimum_calls failures at 100% rate open the circuit; one
        // more iteration would be rejected and panic the helper.
        drive_open(&before, BreakerSettings::default().minimum_calls);
        assert_eq!(before.state(), CircuitState::Open);

        let mut fresh = BreakerSettings::default();
        fresh.minimum_calls = 2;
        registry.reconfigure(fresh);

        let after = registry.get_or_create("license");
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.state(), CircuitState::Closed);
        assert_eq!(after.config().minimum_calls, 2);
    }
}
