//! What a run hands back to its caller.

use serde::Serialize;
use tierloop_core::{AllProvidersExhaustedError, Message, Role, ToolInvocation};
use tierloop_telemetry::ExecutionMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Why a run stopped before the model produced a final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    StepLimitExceeded,
    TimeLimitExceeded,
    AllProvidersExhausted,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StepLimitExceeded => write!(f, "step_limit_exceeded"),
            Self::TimeLimitExceeded => write!(f, "time_limit_exceeded"),
            Self::AllProvidersExhausted => write!(f, "all_providers_exhausted"),
        }
    }
}

/// Result of one run. Returned for every outcome; a run never errors.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<AbortReason>,
    /// Every message of the run in order, including the injected system
    /// prompt. Unlike the request context this is never pruned.
    pub messages: Vec<Message>,
    /// The model's final answer, or its last text when aborted
    pub final_content: Option<String>,
    pub metrics: ExecutionMetrics,
    /// Provider id that served each model turn, in order
    pub provider_history: Vec<String>,
    pub step_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exhausted: Option<AllProvidersExhaustedError>,
}

impl RunResult {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// All tool invocations the run executed, in order.
    pub fn invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.messages.iter().flat_map(|m| m.tool_calls.iter())
    }

    /// Tool-result messages, in order.
    pub fn tool_results(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role == Role::Tool)
    }
}
