//! Provider tiers: priority groups of endpoints handed to the dispatcher.
//!
//! Tiers are supplied read-only by the caller. [`build_tiers`] constructs
//! them from configuration, creating one OpenAI-compatible transport per
//! configured provider.

use std::sync::Arc;
use tierloop_config::{ConfigError, EngineConfig, ProviderConfig};
use tierloop_core::{CostClass, Provider, TierPriority};
use tracing::debug;

use crate::openai_compat::OpenAiCompatProvider;

/// One provider identity inside a tier.
#[derive(Clone)]
pub struct TierEndpoint {
    /// Breaker key and the name reported in provider history
    pub provider_id: String,
    /// Model sent with every request to this endpoint
    pub model: String,
    pub provider: Arc<dyn Provider>,
}

impl TierEndpoint {
    pub fn new(
        provider_id: impl Into<String>,
        model: impl Into<String>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            model: model.into(),
            provider,
        }
    }
}

impl std::fmt::Debug for TierEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierEndpoint")
            .field("provider_id", &self.provider_id)
            .field("model", &self.model)
            .field("provider", &self.provider.name())
            .finish()
    }
}

/// An ordered set of endpoints sharing a priority and a cost class.
#[derive(Debug, Clone)]
pub struct ProviderTier {
    pub name: String,
    pub priority: TierPriority,
    pub cost: CostClass,
    pub endpoints: Vec<TierEndpoint>,
}

impl ProviderTier {
    pub fn new(name: impl Into<String>, priority: TierPriority, cost: CostClass) -> Self {
        Self {
            name: name.into(),
            priority,
            cost,
            endpoints: Vec::new(),
        }
    }

    /// Builder-style endpoint registration; order is preserved.
    pub fn with_endpoint(
        mut self,
        provider_id: impl Into<String>,
        model: impl Into<String>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        self.endpoints.push(TierEndpoint::new(provider_id, model, provider));
        self
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Tier indices ordered primary first, caller order kept within a priority.
pub fn dispatch_order(tiers: &[ProviderTier]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..tiers.len()).collect();
    order.sort_by_key(|&i| tiers[i].priority);
    order
}

/// Build tiers from the `[[tiers]]` config sections.
pub fn build_tiers(config: &EngineConfig) -> Result<Vec<ProviderTier>, ConfigError> {
    config
        .tiers
        .iter()
        .map(|tier| {
            let mut built = ProviderTier::new(&tier.name, tier.priority, tier.cost);
            for provider in &tier.providers {
                let transport = build_provider(provider)?;
                debug!(tier = %tier.name, provider = %provider.id, model = %provider.model, "Built provider");
                built = built.with_endpoint(&provider.id, &provider.model, transport);
            }
            Ok(built)
        })
        .collect()
}

fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>, ConfigError> {
    let base_url = config
        .api_url
        .clone()
        .or_else(|| default_base_url(&config.id).map(String::from))
        .ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "provider '{}' has no api_url and no known default endpoint",
                config.id
            ))
        })?;

    let api_key = config.resolve_api_key().unwrap_or_default();
    let provider = OpenAiCompatProvider::new(&config.id, base_url, api_key)
        .map_err(|e| ConfigError::ValidationError(format!("provider '{}': {e}", config.id)))?;
    Ok(Arc::new(provider))
}

/// Default base URL for well-known OpenAI-compatible hosts.
pub fn default_base_url(provider_id: &str) -> Option<&'static str> {
    let url = match provider_id {
        "openai" => "https://api.openai.com/v1",
        "openrouter" | "openrouter-free" => "https://openrouter.ai/api/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "cerebras" => "https://api.cerebras.ai/v1",
        "together" => "https://api.together.xyz/v1",
        "fireworks" => "https://api.fireworks.ai/inference/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "mistral" => "https://api.mistral.ai/v1",
        "ollama" => "http://localhost:11434/v1",
        "vllm" => "http://localhost:8000/v1",
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1",
        _ => return None,
    };
    Some(url)
}
