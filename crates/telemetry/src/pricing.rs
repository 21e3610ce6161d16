//! Built-in pricing table for common metered models.
//!
//! Prices are in USD per 1 million tokens. Each model has an input and
//! output price. Custom pricing is layered on top from the `[pricing]`
//! config section.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tierloop_core::Usage;

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per 1M input tokens in USD.
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD.
    pub output_per_m: f64,
}

impl ModelPricing {
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    /// Cost of one call with the given usage.
    pub fn cost(&self, usage: &Usage) -> f64 {
        (usage.prompt_tokens as f64 * self.input_per_m
            + usage.completion_tokens as f64 * self.output_per_m)
            / 1_000_000.0
    }
}

/// Model → pricing map with built-in defaults and custom overrides.
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: HashMap<String, ModelPricing>,
}

impl PricingTable {
    /// Create a pricing table with built-in model prices.
    pub fn with_defaults() -> Self {
        let entries: &[(&str, f64, f64)] = &[
            // ── OpenAI ─────────────────────────────────────────────
            ("openai/gpt-4o", 2.5, 10.0),
            ("openai/gpt-4o-mini", 0.15, 0.6),
            ("openai/gpt-4.1", 2.0, 8.0),
            ("openai/gpt-4.1-mini", 0.4, 1.6),
            ("openai/gpt-4.1-nano", 0.1, 0.4),
            ("openai/o3-mini", 1.1, 4.4),
            // ── Anthropic ──────────────────────────────────────────
            ("anthropic/claude-3.5-haiku", 0.8, 4.0),
            ("anthropic/claude-sonnet-4", 3.0, 15.0),
            // ── Google ─────────────────────────────────────────────
            ("google/gemini-2.0-flash", 0.1, 0.4),
            ("google/gemini-1.5-flash", 0.075, 0.3),
            // ── Meta (hosted) ──────────────────────────────────────
            ("meta-llama/llama-3.1-8b-instruct", 0.055, 0.055),
            ("meta-llama/llama-3.1-70b-instruct", 0.52, 0.75),
            ("meta-llama/llama-3.3-70b-instruct", 0.13, 0.4),
            // ── Mistral ────────────────────────────────────────────
            ("mistral/mistral-small", 0.2, 0.6),
            ("mistral/mistral-large", 2.0, 6.0),
            // ── DeepSeek ───────────────────────────────────────────
            ("deepseek/deepseek-chat", 0.27, 1.1),
        ];

        let prices = entries
            .iter()
            .map(|(name, input, output)| (name.to_string(), ModelPricing::new(*input, *output)))
            .collect();
        Self { prices }
    }

    /// Create an empty pricing table.
    pub fn empty() -> Self {
        Self {
            prices: HashMap::new(),
        }
    }

    /// Add or replace pricing for a model.
    pub fn set(&mut self, model: impl Into<String>, pricing: ModelPricing) {
        self.prices.insert(model.into(), pricing);
    }

    /// Builder-style [`set`](Self::set) for several models.
    pub fn with_overrides(
        mut self,
        overrides: impl IntoIterator<Item = (String, ModelPricing)>,
    ) -> Self {
        for (model, pricing) in overrides {
            self.set(model, pricing);
        }
        self
    }

    /// Look up pricing for a model.
    ///
    /// Tries an exact match, then the bare name against bare keys
    /// (`gpt-4o-mini` matches `openai/gpt-4o-mini`), then the longest key
    /// whose bare name prefixes the model (`gpt-4o-mini-2024-07-18`).
    pub fn lookup(&self, model: &str) -> Option<ModelPricing> {
        if let Some(p) = self.prices.get(model) {
            return Some(*p);
        }

        let model_lower = model.to_lowercase();
        let bare_model = bare(&model_lower);

        let mut best: Option<(usize, ModelPricing)> = None;
        for (key, pricing) in &self.prices {
            let key_lower = key.to_lowercase();
            let bare_key = bare(&key_lower);
            if bare_model == bare_key {
                return Some(*pricing);
            }
            if bare_model.starts_with(bare_key) && best.is_none_or(|(len, _)| bare_key.len() > len) {
                best = Some((bare_key.len(), *pricing));
            }
        }
        best.map(|(_, p)| p)
    }

    /// Cost of one call, 0.0 for unknown models.
    pub fn cost(&self, model: &str, usage: &Usage) -> f64 {
        self.lookup(model).map_or(0.0, |p| p.cost(usage))
    }

    /// All known model names, sorted.
    pub fn models(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.prices.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn bare(model: &str) -> &str {
    model.rsplit('/').next().unwrap_or(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(prompt: u32, completion: u32) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    #[test]
    fn default_table_has_models() {
        let table = PricingTable::with_defaults();
        assert!(table.len() >= 15);
        assert!(table.models().contains(&"openai/gpt-4o-mini"));
        assert!(table.models().windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn known_model_cost() {
        let table = PricingTable::with_defaults();
        // (1000 * 0.15 + 500 * 0.6) / 1M
        let cost = table.cost("openai/gpt-4o-mini", &usage(1000, 500));
        assert!((cost - 0.00045).abs() < 1e-12);
    }

    #[test]
    fn bare_and_versioned_names_resolve() {
        let table = PricingTable::with_defaults();
        let exact = table.lookup("openai/gpt-4o-mini").unwrap();
        assert_eq!(table.lookup("gpt-4o-mini"), Some(exact));
        assert_eq!(table.lookup("gpt-4o-mini-2024-07-18"), Some(exact));
        assert_eq!(table.lookup("gpt-4o").unwrap().input_per_m, 2.5);
    }

    #[test]
    fn unknown_model_costs_nothing() {
        let table = PricingTable::with_defaults();
        assert_eq!(table.cost("local/tinyllama", &usage(1000, 1000)), 0.0);
    }

    #[test]
    fn overrides_replace_defaults() {
        let table = PricingTable::with_defaults()
            .with_overrides([("openai/gpt-4o".to_string(), ModelPricing::new(5.0, 20.0))]);
        let cost = table.cost("openai/gpt-4o", &usage(1_000_000, 0));
        assert!((cost - 5.0).abs() < 1e-10);
    }

    #[test]
    fn empty_table() {
        let mut table = PricingTable::empty();
        assert!(table.is_empty());
        table.set("custom/model", ModelPricing::new(1.0, 2.0));
        let cost = table.cost("custom/model", &usage(1_000_000, 1_000_000));
        assert!((cost - 3.0).abs() < 1e-10);
    }
}
