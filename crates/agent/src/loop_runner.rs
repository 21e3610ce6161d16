//! The execution loop implementation.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tierloop_config::{ConfigError, EngineConfig};
use tierloop_core::{
    AllProvidersExhaustedError, ConversationId, DispatchStrategy, DomainEvent, EventBus, Message,
    ProviderRequest, ToolInvocation, ToolRegistry,
};
use tierloop_extract::{CallSource, Extraction, Extractor};
use tierloop_memory::ConversationMemory;
use tierloop_providers::{
    BreakerRegistry, CircuitBreakerConfig, DispatchOutcome, Dispatcher, ProviderTier, build_tiers,
};
use tierloop_telemetry::{ExtractionCounts, MetricsCollector, ModelPricing, PricingTable};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::outcome::{AbortReason, RunResult, RunStatus};
use crate::prompt;

/// Where a run is in its Plan → Execute → Reflect cycle.
#[derive(Debug)]
enum LoopState {
    /// Ready to ask the model for its next turn.
    Running,
    /// The model asked for tools; execute them, then go back to `Running`.
    AwaitingTool {
        reply: Message,
        calls: Vec<ToolInvocation>,
        concurrent: bool,
    },
    Completed,
    Aborted(AbortReason),
}

impl LoopState {
    fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::AwaitingTool { .. } => "awaiting_tool",
            Self::Completed => "completed",
            Self::Aborted(_) => "aborted",
        }
    }
}

/// Mutable state of one run. Created at start, consumed into a [`RunResult`].
struct Conversation {
    id: ConversationId,
    memory: ConversationMemory,
    transcript: Vec<Message>,
    metrics: Arc<MetricsCollector>,
    provider_history: Vec<String>,
    step_count: u32,
    exhausted: Option<AllProvidersExhaustedError>,
    started: Instant,
}

impl Conversation {
    fn append(&mut self, messages: Vec<Message>) {
        self.transcript.extend(messages.iter().cloned());
        let evicted = self.memory.extend(messages);
        if evicted > 0 {
            debug!(conversation_id = %self.id, evicted, "Pruned conversation memory");
        }
    }
}

/// Drives a conversation between a tool-using model and a tool registry.
///
/// Each turn builds a request from conversation memory, dispatches it
/// across the provider tiers, extracts tool calls from the reply, executes
/// them and appends the results. The loop ends when the model answers
/// without calling a tool, or aborts on the step limit, the time limit or
/// provider exhaustion.
pub struct ExecutionLoop {
    tiers: Vec<ProviderTier>,
    tools: Arc<ToolRegistry>,
    dispatcher: Dispatcher,
    extractor: Extractor,
    strategy: DispatchStrategy,
    max_steps: u32,
    max_duration: Option<Duration>,
    memory_limit: usize,
    preserve_system: bool,
    parallel_native_tools: bool,
    temperature: f32,
    max_tokens: Option<u32>,
    system_prompt: Option<String>,
    pricing: PricingTable,
    reference_model: String,
    event_bus: Option<Arc<EventBus>>,
}

impl ExecutionLoop {
    /// Create a loop over `tiers` with default limits.
    ///
    /// `breakers` decides the lifetime of provider health: share one
    /// registry between loops to carry it across runs.
    pub fn new(
        tiers: Vec<ProviderTier>,
        tools: Arc<ToolRegistry>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            tiers,
            tools,
            dispatcher: Dispatcher::new(breakers),
            extractor: Extractor::new(),
            strategy: DispatchStrategy::Adaptive,
            max_steps: 10,
            max_duration: Some(Duration::from_secs(300)),
            memory_limit: 40,
            preserve_system: true,
            parallel_native_tools: false,
            temperature: 0.2,
            max_tokens: None,
            system_prompt: None,
            pricing: PricingTable::with_defaults(),
            reference_model: "openai/gpt-4o-mini".into(),
            event_bus: None,
        }
    }

    /// Build tiers and breakers from configuration.
    pub fn from_config(config: &EngineConfig, tools: Arc<ToolRegistry>) -> Result<Self, ConfigError> {
        let tiers = build_tiers(config)?;
        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::from(&config.breaker)));
        Ok(Self::new(tiers, tools, breakers).with_config(config))
    }

    /// Apply the `[engine]`, `[memory]` and `[pricing]` sections.
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        let engine = &config.engine;
        self.strategy = engine.strategy;
        self.max_steps = engine.max_steps.max(1);
        self.max_duration = engine.max_duration();
        self.dispatcher = self.dispatcher.with_call_timeout(engine.call_timeout());
        self.extractor = self.extractor.with_sequential_native(engine.enforce_sequential);
        self.parallel_native_tools = engine.parallel_native_tools;
        self.temperature = engine.temperature;
        self.max_tokens = engine.max_tokens;
        self.system_prompt = engine.system_prompt.clone();
        self.memory_limit = config.memory.max_messages;
        self.preserve_system = config.memory.preserve_system;
        self.pricing = PricingTable::with_defaults().with_overrides(
            config
                .pricing
                .custom
                .iter()
                .map(|(model, p)| (model.clone(), ModelPricing::new(p.input_per_m, p.output_per_m))),
        );
        self.reference_model = config.pricing.reference_model.clone();
        self
    }

    pub fn with_strategy(mut self, strategy: DispatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Maximum number of tool steps. Clamped to at least 1.
    pub fn with_max_steps(mut self, max: u32) -> Self {
        self.max_steps = max.max(1);
        self
    }

    /// Wall-clock limit for a run; `None` disables it.
    pub fn with_max_duration(mut self, limit: Option<Duration>) -> Self {
        self.max_duration = limit;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.dispatcher = self.dispatcher.with_call_timeout(timeout);
        self
    }

    pub fn with_memory_limit(mut self, max_messages: usize) -> Self {
        self.memory_limit = max_messages;
        self
    }

    pub fn with_preserve_system(mut self, preserve: bool) -> Self {
        self.preserve_system = preserve;
        self
    }

    /// Whether native multi-call replies are cut to a single invocation.
    pub fn with_sequential_native(mut self, enforce: bool) -> Self {
        self.extractor = self.extractor.with_sequential_native(enforce);
        self
    }

    /// Run the invocations of a native multi-call reply concurrently.
    /// Results are still appended in invocation order.
    pub fn with_parallel_native_tools(mut self, enabled: bool) -> Self {
        self.parallel_native_tools = enabled;
        self
    }

    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Prompt placed before the engine's tool-call instructions.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_pricing(mut self, pricing: PricingTable, reference_model: impl Into<String>) -> Self {
        self.pricing = pricing;
        self.reference_model = reference_model.into();
        self
    }

    /// Publish provider, tool and run events to `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.dispatcher = self.dispatcher.with_event_bus(Arc::clone(&bus));
        self.event_bus = Some(bus);
        self
    }

    pub fn tiers(&self) -> &[ProviderTier] {
        &self.tiers
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        self.dispatcher.breakers()
    }

    /// Run a conversation to completion or abort. Never fails: abnormal
    /// endings are reported through [`RunResult::status`].
    pub async fn run(&self, messages: Vec<Message>) -> RunResult {
        let definitions = self.tools.definitions();
        let mut conversation = Conversation {
            id: ConversationId::new(),
            memory: ConversationMemory::new(self.memory_limit)
                .with_preserve_system(self.preserve_system),
            transcript: Vec::new(),
            metrics: Arc::new(MetricsCollector::new(self.pricing.clone(), &self.reference_model)),
            provider_history: Vec::new(),
            step_count: 0,
            exhausted: None,
            started: Instant::now(),
        };

        info!(
            conversation_id = %conversation.id,
            messages = messages.len(),
            tools = definitions.len(),
            tiers = self.tiers.len(),
            strategy = %self.strategy,
            "Starting run"
        );

        let mut seed = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = prompt::compose(self.system_prompt.as_deref(), &definitions) {
            seed.push(Message::system(system));
        }
        seed.extend(messages);
        conversation.append(seed);

        let mut state = LoopState::Running;
        let status = loop {
            debug!(conversation_id = %conversation.id, state = state.label(), step = conversation.step_count, "Loop state");
            state = match state {
                LoopState::Running => self.plan(&mut conversation).await,
                LoopState::AwaitingTool {
                    reply,
                    calls,
                    concurrent,
                } => {
                    self.execute(&mut conversation, reply, &calls, concurrent).await;
                    LoopState::Running
                }
                LoopState::Completed => break (RunStatus::Completed, None),
                LoopState::Aborted(reason) => break (RunStatus::Aborted, Some(reason)),
            };
        };

        self.finish(conversation, status.0, status.1)
    }

    /// Ask the model for its next turn and decide what follows.
    async fn plan(&self, conversation: &mut Conversation) -> LoopState {
        if let Some(limit) = self.max_duration {
            if conversation.started.elapsed() >= limit {
                warn!(conversation_id = %conversation.id, limit_secs = limit.as_secs(), "Time limit reached");
                return LoopState::Aborted(AbortReason::TimeLimitExceeded);
            }
        }

        let request = ProviderRequest {
            model: String::new(),
            messages: conversation.memory.messages().to_vec(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: self.tools.definitions(),
            stop: Vec::new(),
        };

        let outcome = match self
            .dispatcher
            .dispatch(&self.tiers, &request, self.strategy, &conversation.metrics)
            .await
        {
            Ok(outcome) => outcome,
            Err(exhausted) => {
                warn!(conversation_id = %conversation.id, error = %exhausted, "Dispatch exhausted every provider");
                conversation.exhausted = Some(exhausted);
                return LoopState::Aborted(AbortReason::AllProvidersExhausted);
            }
        };
        conversation.provider_history.push(outcome.provider_id.clone());

        let available = self.tools.names();
        let extraction = self.extractor.extract_message(&outcome.response.message, &available);
        conversation.metrics.record_extraction(ExtractionCounts {
            malformed: extraction.malformed.len(),
            repaired: extraction.repaired.len(),
            unknown: extraction.unknown.len(),
            dropped: extraction.dropped,
        });
        debug!(
            provider = %outcome.provider_id,
            source = ?extraction.source,
            invocations = extraction.invocations.len(),
            dropped = extraction.dropped,
            "Reply extracted"
        );

        self.reflect(conversation, outcome, extraction, &available)
    }

    /// Turn an extracted reply into the next state.
    fn reflect(
        &self,
        conversation: &mut Conversation,
        outcome: DispatchOutcome,
        extraction: Extraction,
        available: &[&str],
    ) -> LoopState {
        let raw_text = outcome.response.message.text().trim().to_string();

        if extraction.invocations.is_empty() {
            let Some(correction) = extraction.correction_message(available) else {
                conversation.append(vec![Message::assistant(raw_text)]);
                return LoopState::Completed;
            };
            if let Some(abort) = self.step_limit(conversation) {
                conversation.append(vec![Message::assistant(raw_text)]);
                return abort;
            }
            info!(conversation_id = %conversation.id, step = conversation.step_count + 1, "Asking the model to correct its tool call");
            conversation.append(vec![Message::assistant(raw_text), Message::user(correction)]);
            conversation.step_count += 1;
            return LoopState::Running;
        }

        if let Some(abort) = self.step_limit(conversation) {
            if !extraction.cleaned_text.is_empty() {
                conversation.append(vec![Message::assistant(extraction.cleaned_text)]);
            }
            return abort;
        }

        let concurrent = self.parallel_native_tools
            && extraction.source == CallSource::Native
            && extraction.invocations.len() > 1;
        let content = Some(extraction.cleaned_text).filter(|t| !t.is_empty());
        LoopState::AwaitingTool {
            reply: Message::assistant_with_calls(content, extraction.invocations.clone()),
            calls: extraction.invocations,
            concurrent,
        }
    }

    fn step_limit(&self, conversation: &Conversation) -> Option<LoopState> {
        if conversation.step_count < self.max_steps {
            return None;
        }
        warn!(conversation_id = %conversation.id, max_steps = self.max_steps, "Step limit reached");
        Some(LoopState::Aborted(AbortReason::StepLimitExceeded))
    }

    /// Execute the calls of one reply and append the reply with one
    /// correlated result per call, in invocation order.
    async fn execute(
        &self,
        conversation: &mut Conversation,
        reply: Message,
        calls: &[ToolInvocation],
        concurrent: bool,
    ) {
        let metrics = &conversation.metrics;
        let results = if concurrent {
            debug!(count = calls.len(), "Executing native tool calls concurrently");
            futures::future::join_all(calls.iter().map(|call| self.execute_one(call, metrics))).await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.execute_one(call, metrics).await);
            }
            results
        };

        let mut batch = Vec::with_capacity(results.len() + 1);
        batch.push(reply);
        batch.extend(results);
        conversation.append(batch);
        conversation.step_count += 1;
    }

    async fn execute_one(&self, call: &ToolInvocation, metrics: &MetricsCollector) -> Message {
        let started = Instant::now();
        let result = self.tools.execute(call).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (message, success) = match result {
            Ok(output) if output.success => {
                debug!(tool = %call.name, call = %call.signature(), output = %output.output, "Tool executed");
                (Message::tool_result(&call.id, &call.name, output.output), true)
            }
            Ok(output) => {
                warn!(tool = %call.name, output = %output.output, "Tool reported failure");
                (Message::tool_error(&call.id, &call.name, output.output), false)
            }
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool execution failed");
                (Message::tool_error(&call.id, &call.name, e), false)
            }
        };

        metrics.record_tool(success);
        self.publish(DomainEvent::ToolExecuted {
            tool_name: call.name.clone(),
            success,
            duration_ms,
            timestamp: Utc::now(),
        });
        message
    }

    fn finish(
        &self,
        conversation: Conversation,
        status: RunStatus,
        abort_reason: Option<AbortReason>,
    ) -> RunResult {
        let final_content = conversation
            .transcript
            .iter()
            .rev()
            .find(|m| m.role == tierloop_core::Role::Assistant && !m.text().is_empty())
            .map(|m| m.text().to_string());
        let metrics = conversation.metrics.snapshot();

        info!(
            conversation_id = %conversation.id,
            status = %status,
            reason = abort_reason.map(|r| r.to_string()),
            steps = conversation.step_count,
            provider_calls = metrics.provider_calls,
            duration_ms = metrics.duration_ms,
            "Run finished"
        );
        self.publish(DomainEvent::RunFinished {
            conversation_id: conversation.id.to_string(),
            status: status.to_string(),
            steps: conversation.step_count,
            timestamp: Utc::now(),
        });

        RunResult {
            status,
            abort_reason,
            messages: conversation.transcript,
            final_content,
            metrics,
            provider_history: conversation.provider_history,
            step_count: conversation.step_count,
            exhausted: conversation.exhausted,
        }
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

/// One-shot entry point: run `messages` against `tools` and `tiers` with
/// the limits in `config` and a fresh breaker registry.
pub async fn run(
    messages: Vec<Message>,
    tools: Arc<ToolRegistry>,
    tiers: Vec<ProviderTier>,
    config: &EngineConfig,
) -> RunResult {
    let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::from(&config.breaker)));
    ExecutionLoop::new(tiers, tools, breakers)
        .with_config(config)
        .run(messages)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use serde_json::json;
    use tierloop_core::{CostClass, Role, TierPriority};
    use tierloop_tools::arithmetic_registry;

    fn engine(provider: Arc<ScriptedProvider>) -> ExecutionLoop {
        ExecutionLoop::new(
            vec![single_tier("free", TierPriority::Primary, CostClass::Free, provider)],
            Arc::new(arithmetic_registry()),
            Arc::new(BreakerRegistry::default()),
        )
    }

    #[tokio::test]
    async fn plain_answer_completes_in_one_turn() {
        let provider = ScriptedProvider::new("p", vec![text("Hello! How can I help?")]);
        let result = engine(provider.clone()).run(vec![Message::user("Hello!")]).await;

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.final_content.as_deref(), Some("Hello! How can I help?"));
        assert_eq!(result.step_count, 0);
        assert_eq!(result.provider_history, vec!["p"]);
        // System prompt + user + assistant
        assert_eq!(result.messages.len(), 3);
        assert_eq!(result.messages[0].role, Role::System);
        assert!(result.messages[0].text().contains("TOOL_CALL"));
    }

    #[tokio::test]
    async fn request_carries_tool_schemas_and_sampling_options() {
        let provider = ScriptedProvider::new("p", vec![text("done")]);
        engine(provider.clone())
            .with_temperature(0.5)
            .with_max_tokens(99)
            .with_system_prompt("Be exact.")
            .run(vec![Message::user("hi")])
            .await;

        let request = provider.last_request().unwrap();
        assert_eq!(request.model, "p-model");
        assert_eq!(request.temperature, 0.5);
        assert_eq!(request.max_tokens, Some(99));
        assert_eq!(request.tools.len(), 4);
        assert!(request.messages[0].text().starts_with("Be exact."));
    }

    #[tokio::test]
    async fn text_tool_call_is_executed_and_correlated() {
        let provider = ScriptedProvider::new(
            "p",
            vec![
                text(r#"Let me add. TOOL_CALL: {"name": "add", "arguments": {"a": 2, "b": 3}}"#),
                text("The sum is 5."),
            ],
        );
        let result = engine(provider).run(vec![Message::user("2+3?")]).await;

        assert!(result.is_completed());
        assert_eq!(result.step_count, 1);
        let call = result.invocations().next().unwrap().clone();
        assert_eq!(call.name, "add");
        let tool_msg = result.tool_results().next().unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some(call.id.as_str()));
        assert_eq!(tool_msg.text(), "5");

        let assistant = result.messages.iter().find(|m| m.has_tool_calls()).unwrap();
        assert_eq!(assistant.text(), "Let me add.");
    }

    #[tokio::test]
    async fn tool_failure_becomes_error_result_and_loop_continues() {
        let provider = ScriptedProvider::new(
            "p",
            vec![
                text(r#"TOOL_CALL: {"name": "divide", "arguments": {"a": 1, "b": 0}}"#),
                text("Cannot divide by zero."),
            ],
        );
        let result = engine(provider).run(vec![Message::user("1/0")]).await;

        assert!(result.is_completed());
        let tool_msg = result.tool_results().next().unwrap();
        assert!(tool_msg.is_error());
        assert!(tool_msg.text().contains("division by zero"));
        assert_eq!(result.metrics.tool_failures, 1);
    }

    #[tokio::test]
    async fn invalid_arguments_surface_as_error_result() {
        let provider = ScriptedProvider::new(
            "p",
            vec![
                text(r#"TOOL_CALL: {"name": "add", "arguments": {"a": 1}}"#),
                text("ok"),
            ],
        );
        let result = engine(provider).run(vec![Message::user("add")]).await;
        let tool_msg = result.tool_results().next().unwrap();
        assert!(tool_msg.is_error());
        assert!(tool_msg.text().contains("'b'"));
    }

    #[tokio::test]
    async fn unknown_tool_gets_corrective_feedback() {
        let provider = ScriptedProvider::new(
            "p",
            vec![
                text(r#"TOOL_CALL: {"name": "sqrt", "arguments": {"x": 9}}"#),
                text("I will answer directly: 3."),
            ],
        );
        let result = engine(provider.clone()).run(vec![Message::user("sqrt 9")]).await;

        assert!(result.is_completed());
        assert_eq!(result.step_count, 1);
        assert_eq!(result.metrics.unknown_tools, 1);
        let correction = result
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .nth(1)
            .unwrap();
        assert!(correction.text().contains("no tool named 'sqrt'"));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn text_reply_with_several_calls_runs_only_the_first() {
        let provider = ScriptedProvider::new(
            "p",
            vec![
                text(
                    "TOOL_CALL: {\"name\": \"add\", \"arguments\": {\"a\": 1, \"b\": 1}}\n\
                     TOOL_CALL: {\"name\": \"add\", \"arguments\": {\"a\": 2, \"b\": 2}}",
                ),
                text("2"),
            ],
        );
        let result = engine(provider).run(vec![Message::user("go")]).await;
        assert_eq!(result.invocations().count(), 1);
        assert_eq!(result.metrics.dropped_invocations, 1);
    }

    #[tokio::test]
    async fn native_calls_can_run_concurrently_in_order() {
        let calls = vec![
            native_call("c1", "multiply", json!({"a": 2, "b": 3})),
            native_call("c2", "add", json!({"a": 1, "b": 1})),
        ];
        let provider = ScriptedProvider::new("p", vec![with_calls(calls), text("6 and 2")]);
        let result = engine(provider)
            .with_sequential_native(false)
            .with_parallel_native_tools(true)
            .run(vec![Message::user("go")])
            .await;

        let ids: Vec<_> = result
            .tool_results()
            .map(|m| m.tool_call_id.clone().unwrap_or_default())
            .collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        let outputs: Vec<_> = result.tool_results().map(|m| m.text().to_string()).collect();
        assert_eq!(outputs, vec!["6", "2"]);
    }

    /// Sleeps for `delay` and records when it finished.
    struct SleepTool {
        name: &'static str,
        delay: Duration,
        finished: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait::async_trait]
    impl tierloop_core::Tool for SleepTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "Sleeps, then answers with its own name"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            json!({ "type": "object", "properties": {} })
        }

        async fn execute(
            &self,
            _arguments: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<tierloop_core::ToolResult, tierloop_core::error::ToolError> {
            tokio::time::sleep(self.delay).await;
            self.finished.lock().unwrap().push(self.name);
            Ok(tierloop_core::ToolResult::ok(self.name))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_results_are_buffered_in_invocation_order() {
        let finished = Arc::new(std::sync::Mutex::new(Vec::new()));
        let tools = ToolRegistry::new()
            .with(Box::new(SleepTool {
                name: "slow",
                delay: Duration::from_millis(300),
                finished: finished.clone(),
            }))
            .with(Box::new(SleepTool {
                name: "fast",
                delay: Duration::from_millis(100),
                finished: finished.clone(),
            }));
        let calls = vec![
            native_call("c1", "slow", json!({})),
            native_call("c2", "fast", json!({})),
        ];
        let provider = ScriptedProvider::new("p", vec![with_calls(calls), text("both done")]);
        let engine = ExecutionLoop::new(
            vec![single_tier("free", TierPriority::Primary, CostClass::Free, provider)],
            Arc::new(tools),
            Arc::new(BreakerRegistry::default()),
        )
        .with_sequential_native(false)
        .with_parallel_native_tools(true);

        let started = tokio::time::Instant::now();
        let result = engine.run(vec![Message::user("go")]).await;
        let elapsed = started.elapsed();

        assert!(result.is_completed());
        // The fast tool finished first...
        assert_eq!(*finished.lock().unwrap(), vec!["fast", "slow"]);
        // ...yet results are committed in invocation order.
        let ids: Vec<_> = result
            .tool_results()
            .map(|m| m.tool_call_id.clone().unwrap_or_default())
            .collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        let outputs: Vec<_> = result.tool_results().map(|m| m.text().to_string()).collect();
        assert_eq!(outputs, vec!["slow", "fast"]);
        assert!(elapsed < Duration::from_millis(400), "tools did not overlap: {elapsed:?}");
    }

    #[tokio::test]
    async fn native_calls_are_cut_to_one_by_default() {
        let calls = vec![
            native_call("c1", "multiply", json!({"a": 2, "b": 3})),
            native_call("c2", "add", json!({"a": 1, "b": 1})),
        ];
        let provider = ScriptedProvider::new("p", vec![with_calls(calls), text("6")]);
        let result = engine(provider).run(vec![Message::user("go")]).await;

        assert_eq!(result.invocations().count(), 1);
        assert_eq!(result.tool_results().count(), 1);
    }

    #[tokio::test]
    async fn step_limit_aborts_without_unanswered_calls() {
        let looping = text(r#"TOOL_CALL: {"name": "add", "arguments": {"a": 1, "b": 1}}"#);
        let provider = ScriptedProvider::repeating("p", looping);
        let result = engine(provider.clone()).with_max_steps(3).run(vec![Message::user("loop")]).await;

        assert_eq!(result.status, RunStatus::Aborted);
        assert_eq!(result.abort_reason, Some(AbortReason::StepLimitExceeded));
        assert_eq!(result.step_count, 3);
        assert_eq!(result.invocations().count(), 3);
        assert_eq!(result.tool_results().count(), 3);
        assert_eq!(provider.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn time_limit_aborts_before_next_step() {
        let looping = text(r#"TOOL_CALL: {"name": "add", "arguments": {"a": 1, "b": 1}}"#);
        let provider = ScriptedProvider::delayed("p", looping, Duration::from_secs(4));
        let result = engine(provider)
            .with_max_duration(Some(Duration::from_secs(10)))
            .run(vec![Message::user("loop")])
            .await;

        assert_eq!(result.abort_reason, Some(AbortReason::TimeLimitExceeded));
        assert_eq!(result.step_count, 3);
    }

    #[tokio::test]
    async fn memory_limit_bounds_requests_but_not_transcript() {
        let looping = text(r#"TOOL_CALL: {"name": "add", "arguments": {"a": 1, "b": 1}}"#);
        let provider = ScriptedProvider::repeating("p", looping);
        let result = engine(provider.clone())
            .with_max_steps(5)
            .with_memory_limit(4)
            .run(vec![Message::user("loop")])
            .await;

        let request = provider.last_request().unwrap();
        assert!(request.messages.len() <= 4);
        assert_eq!(request.messages[0].role, Role::System);
        assert!(result.messages.len() > 4);
    }

    #[tokio::test]
    async fn events_cover_tools_and_run_end() {
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();
        let provider = ScriptedProvider::new(
            "p",
            vec![
                text(r#"TOOL_CALL: {"name": "add", "arguments": {"a": 1, "b": 1}}"#),
                text("2"),
            ],
        );
        engine(provider).with_event_bus(bus).run(vec![Message::user("go")]).await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(match event.as_ref() {
                DomainEvent::ProviderSucceeded { .. } => "provider",
                DomainEvent::ToolExecuted { .. } => "tool",
                DomainEvent::RunFinished { .. } => "finished",
                _ => "other",
            });
        }
        assert_eq!(seen, vec!["provider", "tool", "provider", "finished"]);
    }
}
