//! `tierloop run`: run one message through the execution loop.

use anyhow::{Context, bail};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tierloop_agent::{ExecutionLoop, RunResult, RunStatus};
use tierloop_config::EngineConfig;
use tierloop_core::{DispatchStrategy, Message, Role};
use tracing::info;

pub struct RunArgs {
    pub config: PathBuf,
    pub message: String,
    pub strategy: Option<DispatchStrategy>,
    pub max_steps: Option<u32>,
    pub json: bool,
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = EngineConfig::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(strategy) = args.strategy {
        config.engine.strategy = strategy;
    }
    if let Some(max_steps) = args.max_steps {
        config.engine.max_steps = max_steps;
    }
    config.validate()?;
    if config.tiers.is_empty() {
        bail!("no [[tiers]] configured in {}", args.config.display());
    }

    let tools = Arc::new(tierloop_tools::default_registry());
    let engine = ExecutionLoop::from_config(&config, tools).context("building provider tiers")?;
    info!(
        tiers = config.tiers.len(),
        strategy = %config.engine.strategy,
        max_steps = config.engine.max_steps,
        "Starting run"
    );
    let result = engine.run(vec![Message::user(args.message)]).await;
    info!(status = ?result.status, steps = result.step_count, "Run finished");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", render(&result));
    }

    if result.status == RunStatus::Aborted {
        let reason = result
            .abort_reason
            .map_or_else(|| "unknown".to_string(), |r| r.to_string());
        bail!("run aborted: {reason}");
    }
    Ok(())
}

/// Human-readable transcript and metrics summary.
pub fn render(result: &RunResult) -> String {
    let mut out = String::new();
    for message in &result.messages {
        render_message(&mut out, message);
    }

    let m = &result.metrics;
    let _ = writeln!(out);
    let _ = writeln!(out, "status:     {}", result.status);
    if let Some(reason) = result.abort_reason {
        let _ = writeln!(out, "reason:     {reason}");
    }
    if let Some(exhausted) = &result.exhausted {
        for failure in &exhausted.failures {
            let _ = writeln!(
                out,
                "  {} [{}] {}: {}",
                failure.provider_id, failure.tier, failure.kind, failure.message
            );
        }
    }
    let _ = writeln!(out, "steps:      {}", result.step_count);
    let _ = writeln!(out, "providers:  {}", result.provider_history.join(" → "));
    let _ = writeln!(
        out,
        "calls:      {} ({} ok, {} failed, {} skipped; {} free, {} metered)",
        m.provider_calls, m.provider_successes, m.provider_failures, m.provider_skips, m.free_calls, m.metered_calls
    );
    let _ = writeln!(out, "tools:      {} ({} failed)", m.tool_executions, m.tool_failures);
    let _ = writeln!(
        out,
        "tokens:     {} prompt, {} completion",
        m.prompt_tokens, m.completion_tokens
    );
    let _ = writeln!(
        out,
        "cost:       ${:.6} spent, ${:.6} saved",
        m.estimated_cost_usd, m.estimated_savings_usd
    );
    let _ = writeln!(out, "duration:   {}ms", m.duration_ms);
    out
}

fn render_message(out: &mut String, message: &Message) {
    match message.role {
        // The injected prompt is long and identical every run.
        Role::System => {}
        Role::User => {
            let _ = writeln!(out, "user      > {}", message.text());
        }
        Role::Assistant => {
            if !message.text().is_empty() {
                let _ = writeln!(out, "assistant > {}", message.text());
            }
            for call in &message.tool_calls {
                let _ = writeln!(out, "  call    > {}", call.signature());
            }
        }
        Role::Tool => {
            let marker = if message.is_error() { "error" } else { "result" };
            let _ = writeln!(out, "  {marker:<7} > {}", message.text());
        }
    }
}
