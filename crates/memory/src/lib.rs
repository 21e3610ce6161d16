//! Conversation memory for tierloop.
//!
//! History lives in process memory for the lifetime of one run. See
//! [`ConversationMemory`] for the pruning rules.

pub mod conversation;

pub use conversation::{ConversationMemory, prune};
