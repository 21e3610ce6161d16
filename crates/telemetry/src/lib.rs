//! Execution metrics and cost estimation for tierloop.
//!
//! Counts provider attempts, tool executions and extraction outcomes for a
//! run, and estimates spend on metered tiers plus what free-tier calls
//! saved compared with a reference model.

pub mod metrics;
pub mod pricing;

pub use metrics::{ExecutionMetrics, ExtractionCounts, MetricsCollector, ProviderStats, estimate_usage};
pub use pricing::{ModelPricing, PricingTable};
