//! Error types for the tierloop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all tierloop operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Exhausted(#[from] AllProvidersExhaustedError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failure raised by a provider transport. Transports signal failure by
/// returning one of these, never by handing back a degraded response.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether this failure came from the per-call deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Invalid arguments for {tool_name}: {reason}")]
    InvalidArguments { tool_name: String, reason: String },
}

/// Why a single provider could not serve a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Skipped because its circuit breaker was open.
    CircuitOpen,
    /// The call exceeded the per-call timeout.
    Timeout,
    /// The provider returned an error.
    Error,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One provider's reason for not producing a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub provider_id: String,
    pub model: String,
    pub tier: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Every provider in every tier failed or was skipped.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("All providers exhausted after {} attempt(s): {}", .failures.len(), summarize(.failures))]
pub struct AllProvidersExhaustedError {
    pub failures: Vec<ProviderFailure>,
}

impl AllProvidersExhaustedError {
    /// Ids of the providers that were tried or skipped, in order.
    pub fn provider_ids(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.provider_id.as_str()).collect()
    }
}

fn summarize(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no providers configured".into();
    }
    failures
        .iter()
        .map(|f| format!("{} ({}: {})", f.provider_id, f.kind, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn tool_error_displays_correctly() {
        let err = Error::Tool(ToolError::InvalidArguments {
            tool_name: "divide".into(),
            reason: "missing required argument 'b'".into(),
        });
        assert!(err.to_string().contains("divide"));
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn exhausted_error_lists_every_provider() {
        let err = AllProvidersExhaustedError {
            failures: vec![
                ProviderFailure {
                    provider_id: "groq".into(),
                    model: "llama".into(),
                    tier: "free".into(),
                    kind: FailureKind::Timeout,
                    message: "timed out after 5s".into(),
                },
                ProviderFailure {
                    provider_id: "openai".into(),
                    model: "gpt-4o-mini".into(),
                    tier: "paid".into(),
                    kind: FailureKind::CircuitOpen,
                    message: "circuit open".into(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("2 attempt(s)"));
        assert!(text.contains("groq (timeout"));
        assert!(text.contains("openai (circuit_open"));
        assert_eq!(err.provider_ids(), vec!["groq", "openai"]);
    }

    #[test]
    fn exhausted_error_without_providers() {
        let err = AllProvidersExhaustedError { failures: vec![] };
        assert!(err.to_string().contains("no providers configured"));
    }
}
