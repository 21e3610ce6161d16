//! Binary arithmetic tools: `add`, `subtract`, `multiply`, `divide`.
//!
//! Each takes two numbers `a` and `b`. Whole results are rendered without
//! a fractional part so `multiply(15, 8)` reads `120`, not `120.0`.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tierloop_core::error::ToolError;
use tierloop_core::tool::{Tool, ToolResult};
use tracing::debug;

use crate::format_number;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Operation {
    pub const ALL: [Operation; 4] = [Self::Add, Self::Subtract, Self::Multiply, Self::Divide];

    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Multiply => "multiply",
            Self::Divide => "divide",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Add => "Add two numbers and return a + b.",
            Self::Subtract => "Subtract b from a and return a - b.",
            Self::Multiply => "Multiply two numbers and return a * b.",
            Self::Divide => "Divide a by b and return a / b. b must not be zero.",
        }
    }

    /// Apply the operation. Division by zero is the only failure.
    pub fn apply(self, a: f64, b: f64) -> Result<f64, String> {
        match self {
            Self::Add => Ok(a + b),
            Self::Subtract => Ok(a - b),
            Self::Multiply => Ok(a * b),
            Self::Divide if b == 0.0 => Err("division by zero".into()),
            Self::Divide => Ok(a / b),
        }
    }
}

/// One arithmetic operation exposed as a tool.
#[derive(Debug, Clone, Copy)]
pub struct ArithmeticTool {
    op: Operation,
}

impl ArithmeticTool {
    pub fn new(op: Operation) -> Self {
        Self { op }
    }

    pub fn operation(&self) -> Operation {
        self.op
    }
}

#[async_trait]
impl Tool for ArithmeticTool {
    fn name(&self) -> &str {
        self.op.name()
    }

    fn description(&self) -> &str {
        self.op.description()
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": { "type": "number", "description": "First operand" },
                "b": { "type": "number", "description": "Second operand" }
            },
            "required": ["a", "b"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<ToolResult, ToolError> {
        let a = operand(self.op, arguments, "a")?;
        let b = operand(self.op, arguments, "b")?;

        let value = self.op.apply(a, b).map_err(|reason| ToolError::ExecutionFailed {
            tool_name: self.op.name().into(),
            reason,
        })?;
        debug!(tool = self.op.name(), a, b, value, "Arithmetic evaluated");

        Ok(ToolResult::ok(format_number(value)).with_data(json!({ "result": value })))
    }
}

fn operand(op: Operation, arguments: &Map<String, Value>, key: &str) -> Result<f64, ToolError> {
    arguments
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| ToolError::InvalidArguments {
            tool_name: op.name().into(),
            reason: format!("'{key}' must be a number"),
        })
}

/// All four arithmetic tools.
pub fn arithmetic_tools() -> Vec<Box<dyn Tool>> {
    Operation::ALL
        .into_iter()
        .map(|op| Box::new(ArithmeticTool::new(op)) as Box<dyn Tool>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(a: f64, b: f64) -> Map<String, Value> {
        json!({ "a": a, "b": b }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn operations_compute_and_format() {
        let cases = [
            (Operation::Add, 2.0, 3.0, "5"),
            (Operation::Subtract, 2.0, 3.5, "-1.5"),
            (Operation::Multiply, 15.0, 8.0, "120"),
            (Operation::Divide, 120.0, 3.0, "40"),
        ];
        for (op, a, b, expected) in cases {
            let result = ArithmeticTool::new(op).execute(&args(a, b)).await.unwrap();
            assert!(result.success);
            assert_eq!(result.output, expected, "{}", op.name());
        }
    }

    #[tokio::test]
    async fn divide_by_zero_fails() {
        let err = ArithmeticTool::new(Operation::Divide)
            .execute(&args(1.0, 0.0))
            .await
            .unwrap_err();
        match err {
            ToolError::ExecutionFailed { tool_name, reason } => {
                assert_eq!(tool_name, "divide");
                assert!(reason.contains("zero"));
            }
            other => panic!("expected ExecutionFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_numeric_operand_is_rejected() {
        let arguments = json!({ "a": "x", "b": 2 }).as_object().cloned().unwrap();
        let err = ArithmeticTool::new(Operation::Add).execute(&arguments).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[test]
    fn all_tools_have_distinct_names() {
        let names: Vec<String> = arithmetic_tools().iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, vec!["add", "subtract", "multiply", "divide"]);
    }
}
