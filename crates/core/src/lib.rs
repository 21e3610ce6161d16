//! # tierloop Core
//!
//! Domain types, traits, and error definitions for the tierloop
//! tool-calling engine. This crate has **no framework dependencies**. It
//! defines the domain model that all other crates implement against.
//!
//! Every seam is a trait here ([`Provider`], [`Tool`]); implementations live
//! in their respective crates, so tests can swap in scripted mocks.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{
    AllProvidersExhaustedError, Error, FailureKind, ProviderError, ProviderFailure, Result,
    ToolError,
};
pub use event::{DomainEvent, EventBus};
pub use message::{ConversationId, Message, Role, ToolInvocation};
pub use provider::{
    CostClass, DispatchStrategy, Provider, ProviderRequest, ProviderResponse, TierPriority,
    ToolDefinition, Usage,
};
pub use tool::{Tool, ToolRegistry, ToolResult};
