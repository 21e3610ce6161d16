//! Provider dispatcher: fault-tolerant, tier-aware request issuance.
//!
//! Tiers are walked primary first. Within a tier the resolved strategy
//! decides how endpoints are tried:
//!
//! - **sequential**: one endpoint at a time, in tier order
//! - **racing**: every admitted endpoint at once, first success wins
//! - **adaptive**: sequential for free tiers, racing for metered ones
//!
//! Endpoints whose breaker is open are skipped without a call. Every call
//! runs in its own task under the per-call timeout; a timed-out or losing
//! call is left to finish in the background and its result is dropped,
//! but its outcome still lands in the breaker and the metrics.

use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::sync::Arc;
use std::time::Duration;
use tierloop_core::{
    AllProvidersExhaustedError, CostClass, DispatchStrategy, DomainEvent, EventBus, FailureKind,
    Provider, ProviderError, ProviderFailure, ProviderRequest, ProviderResponse,
};
use tierloop_telemetry::MetricsCollector;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerError, BreakerRegistry, CircuitBreaker};
use crate::tier::{ProviderTier, TierEndpoint, dispatch_order};

/// The response that won a dispatch, with where it came from.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub response: ProviderResponse,
    pub provider_id: String,
    pub model: String,
    pub tier: String,
    pub cost: CostClass,
    /// Estimated spend of the winning call in USD
    pub spend_usd: f64,
    pub latency: Duration,
}

/// Issues requests across provider tiers.
#[derive(Clone)]
pub struct Dispatcher {
    breakers: Arc<BreakerRegistry>,
    call_timeout: Duration,
    events: Option<Arc<EventBus>>,
}

impl Dispatcher {
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            breakers,
            call_timeout: Duration::from_secs(60),
            events: None,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Send `request` to the first provider able to serve it.
    ///
    /// Each endpoint receives the request with its own model substituted.
    pub async fn dispatch(
        &self,
        tiers: &[ProviderTier],
        request: &ProviderRequest,
        strategy: DispatchStrategy,
        metrics: &Arc<MetricsCollector>,
    ) -> Result<DispatchOutcome, AllProvidersExhaustedError> {
        let mut failures = Vec::new();
        let order = dispatch_order(tiers);

        for (position, &index) in order.iter().enumerate() {
            let tier = &tiers[index];
            let resolved = strategy.resolve(tier.cost);
            debug!(
                tier = %tier.name,
                priority = %tier.priority,
                strategy = %resolved,
                endpoints = tier.len(),
                "Dispatching to tier"
            );

            let served = match resolved {
                DispatchStrategy::Racing => self.race(tier, request, metrics, &mut failures).await,
                _ => self.sequential(tier, request, metrics, &mut failures).await,
            };

            if let Some(outcome) = served {
                info!(
                    provider = %outcome.provider_id,
                    tier = %outcome.tier,
                    latency_ms = outcome.latency.as_millis() as u64,
                    "Dispatch served"
                );
                return Ok(outcome);
            }

            if position + 1 < order.len() {
                info!(tier = %tier.name, "Tier exhausted, escalating to next tier");
            }
        }

        warn!(failures = failures.len(), "All providers exhausted");
        Err(AllProvidersExhaustedError { failures })
    }

    async fn sequential(
        &self,
        tier: &ProviderTier,
        request: &ProviderRequest,
        metrics: &Arc<MetricsCollector>,
        failures: &mut Vec<ProviderFailure>,
    ) -> Option<DispatchOutcome> {
        for endpoint in &tier.endpoints {
            match self.attempt_for(tier, endpoint, request, metrics).run().await {
                Ok(outcome) => return Some(outcome),
                Err(failure) => failures.push(failure),
            }
        }
        None
    }

    async fn race(
        &self,
        tier: &ProviderTier,
        request: &ProviderRequest,
        metrics: &Arc<MetricsCollector>,
        failures: &mut Vec<ProviderFailure>,
    ) -> Option<DispatchOutcome> {
        let mut in_flight = FuturesUnordered::new();

        for endpoint in &tier.endpoints {
            let attempt = self.attempt_for(tier, endpoint, request, metrics);
            // Skips are settled here so only healthy endpoints race.
            if let Err(open) = attempt.breaker.try_acquire() {
                failures.push(attempt.skipped(open.to_string()));
                continue;
            }
            let provider_id = endpoint.provider_id.clone();
            let model = endpoint.model.clone();
            let handle = tokio::spawn(attempt.run_admitted());
            in_flight.push(async move { (provider_id, model, handle.await) });
        }

        while let Some((provider_id, model, joined)) = in_flight.next().await {
            match joined {
                Ok(Ok(outcome)) => {
                    debug!(
                        provider = %outcome.provider_id,
                        pending = in_flight.len(),
                        "Race won; remaining calls continue detached"
                    );
                    return Some(outcome);
                }
                Ok(Err(failure)) => failures.push(failure),
                Err(join_error) => failures.push(ProviderFailure {
                    provider_id,
                    model,
                    tier: tier.name.clone(),
                    kind: FailureKind::Error,
                    message: format!("attempt task failed: {join_error}"),
                }),
            }
        }
        None
    }

    fn attempt_for(
        &self,
        tier: &ProviderTier,
        endpoint: &TierEndpoint,
        request: &ProviderRequest,
        metrics: &Arc<MetricsCollector>,
    ) -> Attempt {
        Attempt {
            provider_id: endpoint.provider_id.clone(),
            model: endpoint.model.clone(),
            tier: tier.name.clone(),
            cost: tier.cost,
            provider: Arc::clone(&endpoint.provider),
            breaker: self.breakers.get_or_create(&endpoint.provider_id),
            request: request.for_model(&endpoint.model),
            call_timeout: self.call_timeout,
            metrics: Arc::clone(metrics),
            events: self.events.clone(),
        }
    }
}

/// Everything one provider call needs, owned so it can run detached.
struct Attempt {
    provider_id: String,
    model: String,
    tier: String,
    cost: CostClass,
    provider: Arc<dyn Provider>,
    breaker: Arc<CircuitBreaker>,
    request: ProviderRequest,
    call_timeout: Duration,
    metrics: Arc<MetricsCollector>,
    events: Option<Arc<EventBus>>,
}

impl Attempt {
    /// Go through the breaker, then call.
    async fn run(self) -> Result<DispatchOutcome, ProviderFailure> {
        let breaker = Arc::clone(&self.breaker);
        let started = Instant::now();
        let result = breaker.execute(|| self.call()).await;
        self.settle(result, started)
    }

    /// Call without another admission check; the caller already passed
    /// `try_acquire`.
    async fn run_admitted(self) -> Result<DispatchOutcome, ProviderFailure> {
        let started = Instant::now();
        let result = self.call().await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        self.settle(result.map_err(BreakerError::Inner), started)
    }

    /// Issue the provider call in its own task under the call timeout.
    async fn call(&self) -> Result<ProviderResponse, ProviderError> {
        self.metrics.record_attempt(&self.provider_id, self.cost);
        debug!(provider = %self.provider_id, model = %self.model, tier = %self.tier, "Calling provider");

        let provider = Arc::clone(&self.provider);
        let request = self.request.clone();
        let handle = tokio::spawn(async move { provider.complete(request).await });

        match tokio::time::timeout(self.call_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ProviderError::InvalidResponse(format!(
                "provider task failed: {join_error}"
            ))),
            Err(_) => Err(ProviderError::Timeout(format!(
                "no response within {}ms",
                self.call_timeout.as_millis()
            ))),
        }
    }

    fn settle(
        self,
        result: Result<ProviderResponse, BreakerError<ProviderError>>,
        started: Instant,
    ) -> Result<DispatchOutcome, ProviderFailure> {
        let latency = started.elapsed();
        match result {
            Ok(response) => {
                let spend_usd =
                    self.metrics
                        .record_success(&self.provider_id, self.cost, &self.request, &response);
                self.publish(DomainEvent::ProviderSucceeded {
                    provider_id: self.provider_id.clone(),
                    tier: self.tier.clone(),
                    latency_ms: latency.as_millis() as u64,
                    timestamp: Utc::now(),
                });
                Ok(DispatchOutcome {
                    response,
                    provider_id: self.provider_id,
                    model: self.model,
                    tier: self.tier,
                    cost: self.cost,
                    spend_usd,
                    latency,
                })
            }
            Err(BreakerError::Open(open)) => Err(self.skipped(open.to_string())),
            Err(BreakerError::Inner(error)) => {
                let kind = if error.is_timeout() {
                    FailureKind::Timeout
                } else {
                    FailureKind::Error
                };
                warn!(
                    provider = %self.provider_id,
                    tier = %self.tier,
                    kind = %kind,
                    error = %error,
                    "Provider call failed"
                );
                self.metrics.record_failure(&self.provider_id);
                self.publish(DomainEvent::ProviderFailed {
                    provider_id: self.provider_id.clone(),
                    tier: self.tier.clone(),
                    reason: error.to_string(),
                    timestamp: Utc::now(),
                });
                Err(self.failure(kind, error.to_string()))
            }
        }
    }

    fn skipped(&self, message: String) -> ProviderFailure {
        debug!(provider = %self.provider_id, "Skipping provider with open circuit");
        self.metrics.record_skip(&self.provider_id);
        self.failure(FailureKind::CircuitOpen, message)
    }

    fn failure(&self, kind: FailureKind, message: String) -> ProviderFailure {
        ProviderFailure {
            provider_id: self.provider_id.clone(),
            model: self.model.clone(),
            tier: self.tier.clone(),
            kind,
            message,
        }
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}
