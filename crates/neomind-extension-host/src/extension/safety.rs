//! Extension Safety Module
//!
//! Per-extension circuit breakers and call statistics, plus a panic hook that
//! routes panics raised by extension code into the log.
//!
//! Breaker state machine:
//!
//! ```text
//! Closed --(threshold consecutive failures)--> Open --(reset / reload)--> Closed
//!                                               |
//!                          (cooldown, if configured)
//!                                               v
//!                           HalfOpen --success--> Closed
//!                           HalfOpen --failure--> Open
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::system::ExtensionStats;

/// Circuit breaker state for an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests are allowed
    Closed,
    /// Circuit is open, requests are blocked
    Open,
    /// One trial call is allowed through after the cooldown
    HalfOpen,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

const NEVER: i64 = i64::MIN;

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    if millis == NEVER {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}

/// Per-extension circuit breaker.
///
/// All transitions are compare-and-swap on atomics so concurrent successes
/// and failures on the same extension never lose an update.
#[derive(Debug)]
pub struct CircuitBreaker {
    extension_id: String,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    last_failure_ms: AtomicI64,
    opened_at_ms: AtomicI64,
    failure_threshold: u32,
    cooldown: Option<Duration>,
}

impl CircuitBreaker {
    pub fn new(
        extension_id: impl Into<String>,
        failure_threshold: u32,
        cooldown: Option<Duration>,
    ) -> Self {
        Self {
            extension_id: extension_id.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            last_failure_ms: AtomicI64::new(NEVER),
            opened_at_ms: AtomicI64::new(NEVER),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    /// Check if a request should be allowed.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let Some(cooldown) = self.cooldown else {
                    return false;
                };
                let opened_at = self.opened_at_ms.load(Ordering::Acquire);
                let elapsed = now_millis().saturating_sub(opened_at);
                if elapsed < cooldown.as_millis() as i64 {
                    return false;
                }
                // Only the caller that wins the swap becomes the trial call.
                let granted = self
                    .state
                    .compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if granted {
                    info!(extension_id = %self.extension_id, "Circuit breaker HALF-OPEN (cooldown elapsed)");
                }
                granted
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => self.consecutive_failures.store(0, Ordering::Release),
            CircuitState::HalfOpen => {
                if self
                    .state
                    .compare_exchange(
                        CircuitState::HalfOpen as u8,
                        CircuitState::Closed as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.consecutive_failures.store(0, Ordering::Release);
                    info!(extension_id = %self.extension_id, "Circuit breaker CLOSED (trial call succeeded)");
                }
            }
            // A call admitted before the trip finished late; the circuit stays open.
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation. Returns true when this failure opened the
    /// circuit.
    pub fn record_failure(&self) -> bool {
        let now = now_millis();
        self.last_failure_ms.store(now, Ordering::Release);

        match self.state() {
            CircuitState::Closed => {
                let threshold = self.failure_threshold;
                let previous = self
                    .consecutive_failures
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        Some((n + 1).min(threshold))
                    })
                    .unwrap_or(threshold);
                let failures = (previous + 1).min(threshold);
                let tripped = failures >= threshold && self.trip(CircuitState::Closed, now);
                if tripped {
                    warn!(
                        extension_id = %self.extension_id,
                        failures,
                        threshold,
                        "Circuit breaker OPEN (threshold exceeded)"
                    );
                }
                tripped
            }
            CircuitState::HalfOpen => {
                let tripped = self.trip(CircuitState::HalfOpen, now);
                if tripped {
                    warn!(extension_id = %self.extension_id, "Circuit breaker OPEN (trial call failed)");
                }
                tripped
            }
            CircuitState::Open => false,
        }
    }

    fn trip(&self, from: CircuitState, now: i64) -> bool {
        let tripped = self
            .state
            .compare_exchange(
                from as u8,
                CircuitState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if tripped {
            self.opened_at_ms.store(now, Ordering::Release);
        }
        tripped
    }

    /// Hand back a half-open grant whose call never ran.
    ///
    /// The breaker returns to Open with its original `opened_at`, so the
    /// cooldown has already elapsed and the next caller may try again.
    pub fn release_half_open(&self) {
        if self
            .state
            .compare_exchange(
                CircuitState::HalfOpen as u8,
                CircuitState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            debug!(extension_id = %self.extension_id, "Circuit breaker back to OPEN (trial call not started)");
        }
    }

    /// Manually reset the circuit breaker.
    pub fn reset(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.opened_at_ms.store(NEVER, Ordering::Release);
        info!(extension_id = %self.extension_id, "Circuit breaker manually RESET");
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn status(&self) -> CircuitStatus {
        CircuitStatus {
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            failure_threshold: self.failure_threshold,
            last_failure: millis_to_datetime(self.last_failure_ms.load(Ordering::Acquire)),
            opened_at: millis_to_datetime(self.opened_at_ms.load(Ordering::Acquire)),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Breakers and statistics for every extension, created on first use.
pub struct SafetyManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    stats: RwLock<HashMap<String, Arc<Mutex<ExtensionStats>>>>,
    failure_threshold: u32,
    cooldown: Option<Duration>,
}

impl SafetyManager {
    pub fn new(failure_threshold: u32, cooldown: Option<Duration>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            stats: RwLock::new(HashMap::new()),
            failure_threshold,
            cooldown,
        }
    }

    pub fn breaker(&self, extension_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(extension_id) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .entry(extension_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    extension_id,
                    self.failure_threshold,
                    self.cooldown,
                ))
            })
            .clone()
    }

    pub(crate) fn stats_cell(&self, extension_id: &str) -> Arc<Mutex<ExtensionStats>> {
        if let Some(stats) = self.stats.read().get(extension_id) {
            return stats.clone();
        }
        self.stats
            .write()
            .entry(extension_id.to_string())
            .or_default()
            .clone()
    }

    pub fn stats(&self, extension_id: &str) -> ExtensionStats {
        self.stats
            .read()
            .get(extension_id)
            .map(|cell| cell.lock().clone())
            .unwrap_or_default()
    }

    pub fn status(&self, extension_id: &str) -> CircuitStatus {
        self.breaker(extension_id).status()
    }

    pub fn reset(&self, extension_id: &str) {
        self.breaker(extension_id).reset();
    }

    /// Forget an unloaded extension.
    pub fn remove(&self, extension_id: &str) {
        self.breakers.write().remove(extension_id);
        self.stats.write().remove(extension_id);
    }
}

/// Route panics into `tracing` so failures inside extension calls are visible
/// even though the supervisor catches them.
pub fn install_extension_panic_hook() {
    use std::panic;
    use std::sync::atomic::AtomicBool;

    static INSTALLED: AtomicBool = AtomicBool::new(false);
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }

    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info: &panic::PanicHookInfo| {
        let thread = std::thread::current();
        let payload = super::supervisor::panic_message(panic_info.payload());
        error!(
            thread = %thread.name().unwrap_or("unnamed"),
            payload = %payload,
            location = ?panic_info.location().map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())),
            "Panic detected"
        );

        #[cfg(debug_assertions)]
        original_hook(panic_info);
        #[cfg(not(debug_assertions))]
        let _ = &original_hook;
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_after_threshold() {
        let breaker = CircuitBreaker::new("weather", 5, None);
        for _ in 0..4 {
            assert!(breaker.allow_request());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 4);

        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(!breaker.allow_request());

        // Counter stays at the threshold while open.
        breaker.record_failure();
        assert_eq!(breaker.consecutive_failures(), 5);
        assert!(breaker.status().opened_at.is_some());
    }

    #[test]
    fn test_success_resets_counter() {
        let breaker = CircuitBreaker::new("weather", 5, None);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.status().last_failure.is_some());
    }

    #[test]
    fn test_stays_open_without_cooldown() {
        let breaker = CircuitBreaker::new("weather", 1, None);
        breaker.record_failure();
        breaker.record_success();
        assert!(breaker.is_open());
        assert!(!breaker.allow_request());

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_half_open_trial() {
        let breaker = CircuitBreaker::new("weather", 1, Some(Duration::ZERO));
        breaker.record_failure();
        assert!(breaker.is_open());

        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Only one trial call at a time.
        assert!(!breaker.allow_request());

        breaker.record_failure();
        assert!(breaker.is_open());

        assert!(breaker.allow_request());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_concurrent_failures_trip_once() {
        let breaker = Arc::new(CircuitBreaker::new("weather", 3, None));
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let breaker = breaker.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    breaker.record_failure()
                })
            })
            .collect();
        let trips = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|tripped| *tripped)
            .count();

        assert_eq!(trips, 1);
        assert!(breaker.is_open());
        assert_eq!(breaker.consecutive_failures(), 3);
    }

    #[test]
    fn test_release_half_open_allows_retry() {
        let breaker = CircuitBreaker::new("weather", 1, Some(Duration::ZERO));
        breaker.record_failure();
        let opened_at = breaker.status().opened_at;

        assert!(breaker.allow_request());
        breaker.release_half_open();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.status().opened_at, opened_at);

        // No-op unless half-open.
        breaker.release_half_open();
        assert!(breaker.is_open());

        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_manager_creates_and_forgets() {
        let manager = SafetyManager::new(2, None);
        let first = manager.breaker("a");
        assert!(Arc::ptr_eq(&first, &manager.breaker("a")));

        first.record_failure();
        first.record_failure();
        assert_eq!(manager.status("a").state, CircuitState::Open);

        manager.reset("a");
        assert_eq!(manager.status("a").state, CircuitState::Closed);

        manager.stats_cell("a").lock().commands_executed = 3;
        assert_eq!(manager.stats("a").commands_executed, 3);
        manager.remove("a");
        assert_eq!(manager.stats("a").commands_executed, 0);
    }
}
