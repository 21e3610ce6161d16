//! Provider transports and tiered dispatch for tierloop.
//!
//! Every transport implements `tierloop_core::Provider`. The
//! [`Dispatcher`] walks [`ProviderTier`]s primary first, guarding each
//! provider identity with a [`CircuitBreaker`].

pub mod circuit_breaker;
pub mod dispatcher;
pub mod openai_compat;
pub mod tier;

pub use circuit_breaker::{
    BreakerError, BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitOpenError,
    CircuitSnapshot, CircuitState,
};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use openai_compat::OpenAiCompatProvider;
pub use tier::{ProviderTier, TierEndpoint, build_tiers, default_base_url, dispatch_order};
