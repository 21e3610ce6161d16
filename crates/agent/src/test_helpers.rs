//! Scripted providers and response builders shared by the agent tests.
//!
//! Compiled for unit tests and behind the `test-helpers` feature for the
//! integration tests in `tests/`.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tierloop_core::{
    CostClass, Message, Provider, ProviderError, ProviderRequest, ProviderResponse, TierPriority,
    ToolInvocation, Usage,
};
use tierloop_providers::ProviderTier;

/// Returns scripted responses in order, optionally after a delay.
///
/// A repeating provider returns its single response forever; otherwise
/// calls past the end of the script fail with `InvalidResponse`.
pub struct ScriptedProvider {
    name: String,
    responses: Vec<ProviderResponse>,
    repeat: bool,
    delay: Duration,
    call_count: Mutex<usize>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(name: &str, responses: Vec<ProviderResponse>) -> Arc<Self> {
        Arc::new(Self::build(name, responses, false, Duration::ZERO))
    }

    pub fn repeating(name: &str, response: ProviderResponse) -> Arc<Self> {
        Arc::new(Self::build(name, vec![response], true, Duration::ZERO))
    }

    /// Repeats `response`, sleeping `delay` before each reply.
    pub fn delayed(name: &str, response: ProviderResponse, delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(name, vec![response], true, delay))
    }

    fn build(name: &str, responses: Vec<ProviderResponse>, repeat: bool, delay: Duration) -> Self {
        Self {
            name: name.into(),
            responses,
            repeat,
            delay,
            call_count: Mutex::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    pub fn last_request(&self) -> Option<ProviderRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let index = {
            let mut count = self.call_count.lock().unwrap();
            *count += 1;
            *count - 1
        };
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let index = if self.repeat { 0 } else { index };
        let mut response = self.responses.get(index).cloned().ok_or_else(|| {
            ProviderError::InvalidResponse(format!("{}: script exhausted at call #{}", self.name, index + 1))
        })?;
        response.model = model;
        Ok(response)
    }
}

/// Always fails with a 500.
pub struct FailingProvider {
    name: String,
    call_count: Mutex<usize>,
}

impl FailingProvider {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            call_count: Mutex::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        *self.call_count.lock().unwrap()
    }
}

#[async_trait]
impl Provider for FailingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        *self.call_count.lock().unwrap() += 1;
        Err(ProviderError::ApiError {
            status_code: 500,
            message: format!("{} is down", self.name),
        })
    }
}

/// Never answers.
pub struct HangingProvider {
    name: String,
}

impl HangingProvider {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self { name: name.into() })
    }
}

#[async_trait]
impl Provider for HangingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        std::future::pending().await
    }
}

/// A tier holding one provider, with model `<name>-model`.
pub fn single_tier(
    name: &str,
    priority: TierPriority,
    cost: CostClass,
    provider: Arc<dyn Provider>,
) -> ProviderTier {
    tier(name, priority, cost, vec![provider])
}

/// A tier holding `providers` in order; each endpoint id is the provider name.
pub fn tier(
    name: &str,
    priority: TierPriority,
    cost: CostClass,
    providers: Vec<Arc<dyn Provider>>,
) -> ProviderTier {
    providers.into_iter().fold(ProviderTier::new(name, priority, cost), |t, p| {
        let id = p.name().to_string();
        t.with_endpoint(id.clone(), format!("{id}-model"), p)
    })
}

fn usage() -> Option<Usage> {
    Some(Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    })
}

/// A plain assistant reply.
pub fn text(content: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(content),
        usage: usage(),
        model: "mock-model".into(),
        metadata: serde_json::Map::new(),
    }
}

/// A reply carrying native tool calls and no text.
pub fn with_calls(calls: Vec<ToolInvocation>) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_with_calls(None, calls),
        usage: usage(),
        model: "mock-model".into(),
        metadata: serde_json::Map::new(),
    }
}

/// A native tool call with a fixed id.
pub fn native_call(id: &str, name: &str, arguments: Value) -> ToolInvocation {
    ToolInvocation {
        id: id.into(),
        name: name.into(),
        arguments: arguments.as_object().cloned().unwrap_or_default(),
    }
}
