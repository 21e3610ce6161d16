//! `tierloop check`: validate a config and print the tier plan.

use anyhow::Context;
use std::path::Path;
use tierloop_config::EngineConfig;
use tierloop_providers::{ProviderTier, build_tiers, default_base_url, dispatch_order};

pub fn run(path: &Path) -> anyhow::Result<()> {
    let config =
        EngineConfig::load_from(path).with_context(|| format!("loading {}", path.display()))?;
    let tiers = build_tiers(&config).context("building provider tiers")?;

    println!("Config OK: {}", path.display());
    for line in plan(&config, &tiers) {
        println!("{line}");
    }
    Ok(())
}

/// The dispatch plan: engine limits, then tiers in the order they are tried.
pub fn plan(config: &EngineConfig, tiers: &[ProviderTier]) -> Vec<String> {
    let engine = &config.engine;
    let mut lines = vec![
        format!(
            "engine: strategy={} max_steps={} time_limit={} call_timeout={}s",
            engine.strategy,
            engine.max_steps,
            engine
                .max_duration()
                .map_or_else(|| "off".to_string(), |d| format!("{}s", d.as_secs())),
            engine.call_timeout_secs
        ),
        format!(
            "breaker: failure_threshold={} success_threshold={} recovery={}s",
            config.breaker.failure_threshold,
            config.breaker.success_threshold,
            config.breaker.recovery_timeout_secs
        ),
    ];

    if tiers.is_empty() {
        lines.push("no tiers configured".into());
        return lines;
    }

    for (position, index) in dispatch_order(tiers).into_iter().enumerate() {
        let tier = &tiers[index];
        lines.push(format!(
            "{}. tier '{}' ({}, {}) → {}",
            position + 1,
            tier.name,
            tier.priority,
            tier.cost,
            engine.strategy.resolve(tier.cost)
        ));

        let Some(tier_config) = config.tiers.iter().find(|t| t.name == tier.name) else {
            continue;
        };
        for provider in &tier_config.providers {
            let url = provider
                .api_url
                .as_deref()
                .or_else(|| default_base_url(&provider.id))
                .unwrap_or("?");
            let key = if provider.resolve_api_key().is_some() { "set" } else { "missing" };
            lines.push(format!(
                "   - {} model={} url={} key={}",
                provider.id, provider.model, url, key
            ));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_lists_primary_tier_first_with_resolved_strategy() {
        let config = EngineConfig::from_toml_str(
            r#"
[engine]
max_duration_secs = 0

[[tiers]]
name = "paid"
priority = "fallback"
cost = "metered"
[[tiers.providers]]
id = "openai"
model = "gpt-4o-mini"
api_key = "sk-test"

[[tiers]]
name = "free"
[[tiers.providers]]
id = "groq"
model = "llama-3.1-8b-instant"
"#,
        )
        .unwrap();
        let tiers = build_tiers(&config).unwrap();
        let lines = plan(&config, &tiers);

        assert!(lines[0].contains("strategy=adaptive"));
        assert!(lines[0].contains("time_limit=off"));
        assert!(lines[2].starts_with("1. tier 'free'"));
        assert!(lines[2].ends_with("→ sequential"));
        assert!(lines[3].contains("groq.com"));
        assert!(lines[4].starts_with("2. tier 'paid'"));
        assert!(lines[4].ends_with("→ racing"));
        assert!(lines[5].contains("key=set"));
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        let lines = plan(&config, &[]);
        assert_eq!(lines.last().unwrap(), "no tiers configured");
    }
}
