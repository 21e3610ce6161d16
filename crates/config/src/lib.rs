//! Configuration loading, validation, and management for tierloop.
//!
//! Loads an [`EngineConfig`] from a TOML file with environment variable
//! overrides. Every field has a serde default, so an empty file is valid.
//! All settings are validated at load time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tierloop_core::{CostClass, DispatchStrategy, TierPriority};

/// The root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Loop limits and dispatch options
    #[serde(default)]
    pub engine: LoopConfig,

    /// Conversation memory bounds
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Circuit breaker thresholds (shared by every provider)
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Pricing used for cost and savings estimates
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Provider tiers, in caller order
    #[serde(default)]
    pub tiers: Vec<TierConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Maximum Plan → Execute → Reflect steps per run
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Wall-clock limit per run in seconds (0 = unlimited)
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,

    /// Dispatch strategy
    #[serde(default)]
    pub strategy: DispatchStrategy,

    /// Per provider call timeout in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Execute at most one invocation per model turn, even for native calls
    #[serde(default = "default_true")]
    pub enforce_sequential: bool,

    /// Run independent native invocations concurrently
    #[serde(default)]
    pub parallel_native_tools: bool,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Caller system prompt, placed before the tool-call instructions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_max_steps() -> u32 {
    10
}
fn default_max_duration_secs() -> u64 {
    300
}
fn default_call_timeout_secs() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.2
}
fn default_true() -> bool {
    true
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_duration_secs: default_max_duration_secs(),
            strategy: DispatchStrategy::default(),
            call_timeout_secs: default_call_timeout_secs(),
            enforce_sequential: true,
            parallel_native_tools: false,
            temperature: default_temperature(),
            max_tokens: None,
            system_prompt: None,
        }
    }
}

impl LoopConfig {
    /// Run time limit, `None` when unlimited.
    pub fn max_duration(&self) -> Option<Duration> {
        (self.max_duration_secs > 0).then(|| Duration::from_secs(self.max_duration_secs))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum messages retained after pruning
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Always keep system messages
    #[serde(default = "default_true")]
    pub preserve_system: bool,
}

fn default_max_messages() -> usize {
    40
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            preserve_system: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close it
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Seconds an open circuit waits before probing
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_success_threshold() -> u32 {
    2
}
fn default_recovery_timeout_secs() -> u64 {
    60
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Metered model a free call is compared against for savings
    #[serde(default = "default_reference_model")]
    pub reference_model: String,

    /// Custom per-million-token pricing (model name → pricing)
    #[serde(default)]
    pub custom: HashMap<String, PricingOverrideConfig>,
}

fn default_reference_model() -> String {
    "openai/gpt-4o-mini".into()
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            reference_model: default_reference_model(),
            custom: HashMap::new(),
        }
    }
}

/// Custom per-million-token pricing for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingOverrideConfig {
    /// Price per 1M input tokens in USD
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD
    pub output_per_m: f64,
}

/// A priority group of providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,

    #[serde(default)]
    pub priority: TierPriority,

    #[serde(default)]
    pub cost: CostClass,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider identity; also the circuit breaker key
    pub id: String,

    /// Model requested from this provider
    pub model: String,

    /// OpenAI-compatible base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Inline API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl ProviderConfig {
    /// Inline key first, then the named environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|k| !k.is_empty())
        })
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("api_key_env", &self.api_key_env)
            .finish()
    }
}

impl EngineConfig {
    /// Load configuration from a specific file path, then apply
    /// environment overrides.
    ///
    /// - `TIERLOOP_MAX_STEPS`
    /// - `TIERLOOP_STRATEGY`
    /// - `TIERLOOP_CALL_TIMEOUT_SECS`
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            tracing::info!("No config file found at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document (no environment overrides).
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(steps) = lookup("TIERLOOP_MAX_STEPS") {
            self.engine.max_steps = steps.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("TIERLOOP_MAX_STEPS is not a number: {steps}"))
            })?;
        }

        if let Some(strategy) = lookup("TIERLOOP_STRATEGY") {
            self.engine.strategy = strategy.parse().map_err(ConfigError::ValidationError)?;
        }

        if let Some(secs) = lookup("TIERLOOP_CALL_TIMEOUT_SECS") {
            self.engine.call_timeout_secs = secs.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "TIERLOOP_CALL_TIMEOUT_SECS is not a number: {secs}"
                ))
            })?;
        }

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_steps must be at least 1".into(),
            ));
        }

        if self.engine.call_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "engine.call_timeout_secs must be at least 1".into(),
            ));
        }

        if !(0.0..=2.0).contains(&self.engine.temperature) {
            return Err(ConfigError::ValidationError(
                "engine.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.memory.max_messages == 0 {
            return Err(ConfigError::ValidationError(
                "memory.max_messages must be at least 1".into(),
            ));
        }

        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "breaker thresholds must be at least 1".into(),
            ));
        }

        let mut tier_names = std::collections::HashSet::new();
        for tier in &self.tiers {
            if !tier_names.insert(tier.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate tier name '{}'",
                    tier.name
                )));
            }
            if tier.providers.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "tier '{}' has no providers",
                    tier.name
                )));
            }
            let mut ids = std::collections::HashSet::new();
            for provider in &tier.providers {
                if !ids.insert(provider.id.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "provider '{}' appears twice in tier '{}'",
                        provider.id, tier.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
