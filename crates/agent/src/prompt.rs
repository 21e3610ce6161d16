//! System prompt injected at the start of every run.
//!
//! Describes the textual tool-call format so models without native
//! function calling can still request tools.

use tierloop_core::ToolDefinition;

const FORMAT: &str = "\
To use a tool, reply with exactly one line of the form:
TOOL_CALL: {\"name\": \"<tool name>\", \"arguments\": {<arguments>}}
Call one tool per reply and wait for its result before the next call. \
When you have the final answer, reply in plain text without TOOL_CALL.";

/// Tool-call instructions followed by one line per tool.
pub fn tool_instructions(tools: &[ToolDefinition]) -> String {
    let mut out = String::from(FORMAT);
    out.push_str("\n\nAvailable tools:");
    for tool in tools {
        out.push_str(&format!(
            "\n- {}: {} Parameters: {}",
            tool.name, tool.description, tool.parameters
        ));
    }
    out
}

/// The engine's system prompt: the caller's prompt, then the tool
/// instructions. `None` when there is neither.
pub fn compose(custom: Option<&str>, tools: &[ToolDefinition]) -> Option<String> {
    let custom = custom.map(str::trim).filter(|c| !c.is_empty());
    match (custom, tools.is_empty()) {
        (None, true) => None,
        (Some(c), true) => Some(c.to_string()),
        (None, false) => Some(tool_instructions(tools)),
        (Some(c), false) => Some(format!("{c}\n\n{}", tool_instructions(tools))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn multiply() -> ToolDefinition {
        ToolDefinition {
            name: "multiply".into(),
            description: "Multiply two numbers.".into(),
            parameters: json!({"type": "object", "required": ["a", "b"]}),
        }
    }

    #[test]
    fn instructions_list_every_tool_with_schema() {
        let text = tool_instructions(&[multiply()]);
        assert!(text.contains("TOOL_CALL: {\"name\""));
        assert!(text.contains("- multiply: Multiply two numbers."));
        assert!(text.contains("\"required\":[\"a\",\"b\"]"));
    }

    #[test]
    fn compose_orders_custom_prompt_first() {
        let text = compose(Some("You are terse."), &[multiply()]).unwrap();
        assert!(text.starts_with("You are terse.\n\n"));
        assert!(text.contains("Available tools:"));
    }

    #[test]
    fn compose_without_tools_or_prompt_is_none() {
        assert_eq!(compose(None, &[]), None);
        assert_eq!(compose(Some("  "), &[]), None);
        assert_eq!(compose(Some("Be kind."), &[]).as_deref(), Some("Be kind."));
    }
}
