//! The execution loop at the heart of tierloop.
//!
//! A run follows a **Plan → Execute → Reflect** cycle:
//!
//! 1. **Plan**: build a request from conversation memory and tool schemas,
//!    dispatch it across the provider tiers
//! 2. **Execute**: extract tool calls from the reply, run them against the
//!    tool registry, append one correlated result per call
//! 3. **Reflect**: loop back so the model sees the results, or finish when
//!    it answers without calling a tool
//!
//! Runs always return a [`RunResult`]. Step limit, time limit and
//! provider exhaustion end a run as `Aborted` with the partial transcript.

pub mod loop_runner;
pub mod outcome;
pub mod prompt;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use loop_runner::{ExecutionLoop, run};
pub use outcome::{AbortReason, RunResult, RunStatus};
