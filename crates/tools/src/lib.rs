//! Built-in tools for tierloop.
//!
//! The four binary arithmetic tools cover step-by-step plans such as
//! "multiply, then divide"; the calculator evaluates a whole expression
//! in one call.

pub mod arithmetic;
pub mod calculator;

pub use arithmetic::{ArithmeticTool, Operation, arithmetic_tools};
pub use calculator::CalculatorTool;

use tierloop_core::tool::ToolRegistry;

/// Registry with every built-in tool.
pub fn default_registry() -> ToolRegistry {
    arithmetic_registry().with(Box::new(CalculatorTool))
}

/// Registry with only `add`, `subtract`, `multiply` and `divide`.
pub fn arithmetic_registry() -> ToolRegistry {
    arithmetic_tools()
        .into_iter()
        .fold(ToolRegistry::new(), |registry, tool| registry.with(tool))
}

/// Render a number without a trailing `.0` when it is whole.
pub(crate) fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}
