//! Circuit breaker: per-provider failure isolation.
//!
//! ```text
//!   CLOSED ──(failure_threshold consecutive failures)──► OPEN
//!     ▲                                                   │
//!     │                                   (recovery_timeout elapsed,
//!     │                                    next call admitted)
//!     │                                                   ▼
//!     └──(success_threshold consecutive successes)── HALF_OPEN
//!                                                         │
//!                     any failure: back to OPEN, timer reset
//! ```
//!
//! Each breaker serialises its counters behind its own mutex, so racing
//! dispatch tasks for the same provider never lose updates. The
//! [`BreakerRegistry`] is an explicit object owned by the caller; its
//! lifetime (one run, or the whole process) decides how long health is
//! remembered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tierloop_core::{DomainEvent, EventBus};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast.
    Open,
    /// Probe calls are admitted to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds shared by every breaker in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it
    pub success_threshold: u32,
    /// How long an open circuit rejects calls
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

impl From<&tierloop_config::BreakerConfig> for CircuitBreakerConfig {
    fn from(config: &tierloop_config::BreakerConfig) -> Self {
        Self::default()
            .with_failure_threshold(config.failure_threshold)
            .with_success_threshold(config.success_threshold)
            .with_recovery_timeout(config.recovery_timeout())
    }
}

/// Returned instead of running the operation while the circuit is open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit '{name}' is open; retry in {}ms", .retry_in.as_millis())]
pub struct CircuitOpenError {
    pub name: String,
    pub retry_in: Duration,
}

/// Outcome of [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(CircuitOpenError),
    #[error("{0}")]
    Inner(E),
}

/// Point-in-time view of one breaker, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub provider_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
}

/// A breaker guarding one provider identity.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    events: Option<Arc<EventBus>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                last_failure_at: None,
            }),
            events: None,
        }
    }

    /// Publish `CircuitStateChanged` events on transitions.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state. An open circuit whose recovery timeout has elapsed
    /// still reports `Open` until a call is attempted.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run `op` unless the circuit is open, recording its outcome.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire().map_err(BreakerError::Open)?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Admission check. Moves OPEN to HALF_OPEN once the recovery timeout
    /// has elapsed.
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = inner.opened_at.map_or(Duration::MAX, |t| t.elapsed());
        if elapsed >= self.config.recovery_timeout {
            let change = self.transition(&mut inner, CircuitState::HalfOpen);
            drop(inner);
            self.announce(change);
            return Ok(());
        }

        Err(CircuitOpenError {
            name: self.name.clone(),
            retry_in: self.config.recovery_timeout - elapsed,
        })
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        let change = match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed)
                } else {
                    None
                }
            }
            _ => None,
        };
        drop(inner);
        self.announce(change);
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        inner.last_failure_at = Some(Utc::now());

        let change = match inner.state {
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                self.transition(&mut inner, CircuitState::Open)
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            // A late result from a call admitted before the circuit opened
            // extends the open period.
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                None
            }
            CircuitState::Closed => None,
        };
        drop(inner);
        self.announce(change);
    }

    /// Force the breaker back to CLOSED with cleared counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        let change = self.transition(&mut inner, CircuitState::Closed);
        drop(inner);
        self.announce(change);
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            provider_id: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_failure_at: inner.last_failure_at,
        }
    }

    fn transition(
        &self,
        inner: &mut Inner,
        to: CircuitState,
    ) -> Option<(CircuitState, CircuitState)> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        match to {
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
            CircuitState::HalfOpen => inner.consecutive_successes = 0,
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
            }
        }
        Some((from, to))
    }

    fn announce(&self, change: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = change else {
            return;
        };
        match to {
            CircuitState::Open => warn!(
                provider = %self.name,
                from = %from,
                recovery_secs = self.config.recovery_timeout.as_secs(),
                "Circuit opened"
            ),
            CircuitState::HalfOpen => debug!(provider = %self.name, "Circuit half-open, probing"),
            CircuitState::Closed => info!(provider = %self.name, from = %from, "Circuit closed"),
        }
        if let Some(events) = &self.events {
            events.publish(DomainEvent::CircuitStateChanged {
                provider_id: self.name.clone(),
                from: from.to_string(),
                to: to.to_string(),
                timestamp: Utc::now(),
            });
        }
    }
}

/// Breakers keyed by provider id, created on first use.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    events: Option<Arc<EventBus>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    /// Breakers created after this call publish state changes on `events`.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// The breaker for `provider_id`, creating a CLOSED one if needed.
    pub fn get_or_create(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = breakers.get(provider_id) {
            return Arc::clone(existing);
        }
        let mut breaker = CircuitBreaker::new(provider_id, self.config);
        if let Some(events) = &self.events {
            breaker = breaker.with_event_bus(Arc::clone(events));
        }
        let breaker = Arc::new(breaker);
        breakers.insert(provider_id.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
            .cloned()
    }

    /// All breakers, sorted by provider id.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<CircuitSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshots
    }

    pub fn reset_all(&self) {
        for breaker in self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            breaker.reset();
        }
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "groq",
            CircuitBreakerConfig::default()
                .with_failure_threshold(3)
                .with_success_threshold(2)
                .with_recovery_timeout(Duration::from_secs(30)),
        )
    }

    async fn fail(b: &CircuitBreaker) {
        let _ = b.execute(|| async { Err::<(), _>("boom") }).await;
    }

    async fn succeed(b: &CircuitBreaker) {
        let _ = b.execute(|| async { Ok::<_, &str>(()) }).await;
    }

    #[tokio::test]
    async fn starts_closed_and_passes_results_through() {
        let b = breaker();
        assert_eq!(b.state(), CircuitState::Closed);
        let ok = b.execute(|| async { Ok::<_, &str>(7) }).await.unwrap();
        assert_eq!(ok, 7);
        let err = b.execute(|| async { Err::<(), _>("bad") }).await.unwrap_err();
        assert!(matches!(err, BreakerError::Inner("bad")));
    }

    #[tokio::test]
    async fn success_resets_failure_count_while_closed() {
        let b = breaker();
        fail(&b).await;
        fail(&b).await;
        succeed(&b).await;
        fail(&b).await;
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let result = b
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;
        match result {
            Err(BreakerError::Open(e)) => {
                assert_eq!(e.name, "groq");
                assert!(e.retry_in <= Duration::from_secs(30));
            }
            other => panic!("expected open circuit, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_recovery_timeout_invokes_operation() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(b.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let calls = AtomicUsize::new(0);
        b.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>(())
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn success_threshold_closes_from_half_open() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        succeed(&b).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_and_resets_timer() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        // The recovery timer restarted at the half-open failure.
        tokio::time::advance(Duration::from_secs(20)).await;
        let err = b.try_acquire().unwrap_err();
        assert_eq!(err.retry_in, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn failures_record_timestamp() {
        let b = breaker();
        assert!(b.snapshot().last_failure_at.is_none());
        fail(&b).await;
        assert!(b.snapshot().last_failure_at.is_some());
    }

    #[tokio::test]
    async fn transitions_are_published() {
        let events = Arc::new(EventBus::new(16));
        let mut rx = events.subscribe();
        let b = breaker().with_event_bus(Arc::clone(&events));
        for _ in 0..3 {
            fail(&b).await;
        }
        match rx.recv().await.unwrap().as_ref() {
            DomainEvent::CircuitStateChanged { provider_id, from, to, .. } => {
                assert_eq!(provider_id, "groq");
                assert_eq!(from, "closed");
                assert_eq!(to, "open");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn registry_returns_same_breaker_per_id() {
        let registry = BreakerRegistry::default();
        let a = registry.get_or_create("groq");
        let b = registry.get_or_create("groq");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("openai").is_none());

        registry.get_or_create("cerebras");
        let ids: Vec<String> = registry.snapshot().into_iter().map(|s| s.provider_id).collect();
        assert_eq!(ids, vec!["cerebras", "groq"]);
    }

    #[tokio::test]
    async fn registry_reset_closes_everything() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default().with_failure_threshold(1));
        let b = registry.get_or_create("groq");
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
        registry.reset_all();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn config_from_engine_config() {
        let cfg = tierloop_config::BreakerConfig {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout_secs: 12,
        };
        let converted = CircuitBreakerConfig::from(&cfg);
        assert_eq!(converted.failure_threshold, 5);
        assert_eq!(converted.recovery_timeout, Duration::from_secs(12));
    }

    #[test]
    fn state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(
            serde_json::to_string(&CircuitState::Open).unwrap(),
            "\"open\""
        );
    }
}
