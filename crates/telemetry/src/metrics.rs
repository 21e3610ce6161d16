//! Per-run execution metrics.
//!
//! [`MetricsCollector`] is shared between the execution loop and the
//! dispatch tasks it spawns (racing losers keep reporting after the winner
//! returns), so every update goes through one mutex.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tierloop_core::{CostClass, ProviderRequest, ProviderResponse, Usage};
use tracing::debug;

use crate::pricing::PricingTable;

/// Characters per token when a provider reports no usage.
const CHARS_PER_TOKEN: usize = 4;

/// Counters for a single provider id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub skips: u64,
}

/// Read-only metrics snapshot returned to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Provider calls issued (attempts, whatever the outcome)
    pub provider_calls: u64,
    pub provider_successes: u64,
    pub provider_failures: u64,
    /// Providers passed over because their breaker was open
    pub provider_skips: u64,
    /// Calls issued to free tiers
    pub free_calls: u64,
    /// Calls issued to metered tiers
    pub metered_calls: u64,
    pub per_provider: BTreeMap<String, ProviderStats>,

    pub tool_executions: u64,
    pub tool_failures: u64,

    pub malformed_fragments: u64,
    pub repaired_fragments: u64,
    pub unknown_tools: u64,
    pub dropped_invocations: u64,

    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Spend on metered tiers
    pub estimated_cost_usd: f64,
    /// What free-tier calls would have cost on the reference model
    pub estimated_savings_usd: f64,

    pub duration_ms: u64,
}

/// Extraction outcomes of one reply, fed to [`MetricsCollector::record_extraction`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractionCounts {
    pub malformed: usize,
    pub repaired: usize,
    pub unknown: usize,
    pub dropped: usize,
}

/// Thread-safe accumulator for [`ExecutionMetrics`].
pub struct MetricsCollector {
    metrics: Mutex<ExecutionMetrics>,
    pricing: PricingTable,
    reference_model: String,
    started: Instant,
}

impl MetricsCollector {
    pub fn new(pricing: PricingTable, reference_model: impl Into<String>) -> Self {
        Self {
            metrics: Mutex::new(ExecutionMetrics::default()),
            pricing,
            reference_model: reference_model.into(),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExecutionMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A provider call is about to be issued.
    pub fn record_attempt(&self, provider_id: &str, cost: CostClass) {
        let mut m = self.lock();
        m.provider_calls += 1;
        match cost {
            CostClass::Free => m.free_calls += 1,
            CostClass::Metered => m.metered_calls += 1,
        }
        m.per_provider.entry(provider_id.to_string()).or_default().attempts += 1;
    }

    /// A provider call succeeded. Returns the estimated spend of the call.
    pub fn record_success(
        &self,
        provider_id: &str,
        cost: CostClass,
        request: &ProviderRequest,
        response: &ProviderResponse,
    ) -> f64 {
        let usage = response
            .usage
            .unwrap_or_else(|| estimate_usage(request, response));

        let (spend, saved) = match cost {
            CostClass::Metered => (self.pricing.cost(&response.model, &usage), 0.0),
            CostClass::Free => (0.0, self.pricing.cost(&self.reference_model, &usage)),
        };

        let mut m = self.lock();
        m.provider_successes += 1;
        m.per_provider.entry(provider_id.to_string()).or_default().successes += 1;
        m.prompt_tokens += u64::from(usage.prompt_tokens);
        m.completion_tokens += u64::from(usage.completion_tokens);
        m.estimated_cost_usd += spend;
        m.estimated_savings_usd += saved;
        drop(m);

        debug!(
            provider = %provider_id,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            spend,
            saved,
            "Recorded provider success"
        );
        spend
    }

    /// A provider call errored or timed out.
    pub fn record_failure(&self, provider_id: &str) {
        let mut m = self.lock();
        m.provider_failures += 1;
        m.per_provider.entry(provider_id.to_string()).or_default().failures += 1;
    }

    /// A provider was skipped because its breaker is open.
    pub fn record_skip(&self, provider_id: &str) {
        let mut m = self.lock();
        m.provider_skips += 1;
        m.per_provider.entry(provider_id.to_string()).or_default().skips += 1;
    }

    pub fn record_tool(&self, success: bool) {
        let mut m = self.lock();
        m.tool_executions += 1;
        if !success {
            m.tool_failures += 1;
        }
    }

    pub fn record_extraction(&self, counts: ExtractionCounts) {
        let mut m = self.lock();
        m.malformed_fragments += counts.malformed as u64;
        m.repaired_fragments += counts.repaired as u64;
        m.unknown_tools += counts.unknown as u64;
        m.dropped_invocations += counts.dropped as u64;
    }

    /// Current values, with `duration_ms` measured from construction.
    pub fn snapshot(&self) -> ExecutionMetrics {
        let mut snapshot = self.lock().clone();
        snapshot.duration_ms = self.started.elapsed().as_millis() as u64;
        snapshot
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(PricingTable::with_defaults(), "openai/gpt-4o-mini")
    }
}

/// Rough usage from character counts, for providers that report none.
pub fn estimate_usage(request: &ProviderRequest, response: &ProviderResponse) -> Usage {
    let prompt_chars: usize = request.messages.iter().map(|m| m.text().len()).sum();
    let completion_chars = response.message.text().len()
        + response
            .message
            .tool_calls
            .iter()
            .map(|c| c.name.len() + serde_json::to_string(&c.arguments).map_or(0, |s| s.len()))
            .sum::<usize>();

    let prompt_tokens = prompt_chars.div_ceil(CHARS_PER_TOKEN) as u32;
    let completion_tokens = completion_chars.div_ceil(CHARS_PER_TOKEN) as u32;
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}
