//! Fragment parsing and the ordered list of repair transforms.
//!
//! Models that lack native function calling often emit near-miss JSON: a
//! dropped closing brace, a trailing comma, curly quotes. Each known shape
//! has one [`RepairTransform`]. [`parse_fragment`] tries the raw fragment
//! first, then applies the transforms cumulatively in order, re-parsing
//! after each one, and stops at the first success.

use serde_json::{Map, Value};
use tierloop_core::ToolInvocation;

/// Outcome of parsing one isolated fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    /// Parsed as-is.
    Valid(ToolInvocation),
    /// Parsed after the named transforms were applied, in order.
    Repaired(ToolInvocation, Vec<&'static str>),
    /// No transform sequence produced a tool call.
    Failed(String),
}

impl ParseResult {
    pub fn invocation(&self) -> Option<&ToolInvocation> {
        match self {
            Self::Valid(inv) | Self::Repaired(inv, _) => Some(inv),
            Self::Failed(_) => None,
        }
    }
}

/// A single text rewrite targeting one malformed-output shape.
pub trait RepairTransform: Send + Sync {
    /// Stable name reported in [`ParseResult::Repaired`].
    fn name(&self) -> &'static str;

    /// Rewrite the fragment, or `None` when the shape is not present.
    fn apply(&self, fragment: &str) -> Option<String>;
}

/// The built-in transforms, in application order.
pub fn default_transforms() -> Vec<Box<dyn RepairTransform>> {
    vec![
        Box::new(CloseDelimiters),
        Box::new(StripTrailingSeparator),
        Box::new(NormalizeQuotes),
        Box::new(TrimTrailing),
    ]
}

/// Parse `fragment` into a tool invocation, repairing it if needed.
pub fn parse_fragment(fragment: &str, transforms: &[Box<dyn RepairTransform>]) -> ParseResult {
    let first_error = match serde_json::from_str::<Value>(fragment) {
        Ok(value) => {
            return match invocation_from_value(value) {
                Ok(inv) => ParseResult::Valid(inv),
                Err(reason) => ParseResult::Failed(reason),
            };
        }
        Err(e) => e.to_string(),
    };

    let mut current = fragment.to_string();
    let mut applied = Vec::new();

    for transform in transforms {
        let Some(next) = transform.apply(&current) else {
            continue;
        };
        current = next;
        applied.push(transform.name());

        if let Ok(value) = serde_json::from_str::<Value>(&current) {
            return match invocation_from_value(value) {
                Ok(inv) => ParseResult::Repaired(inv, applied),
                Err(reason) => ParseResult::Failed(reason),
            };
        }
    }

    ParseResult::Failed(format!("invalid JSON: {first_error}"))
}

/// Interpret a JSON value as a tool call.
///
/// Accepts `{"name", "arguments"}` plus the common aliases `tool` for the
/// name and `args` / `parameters` / `input` for the arguments, an
/// OpenAI-style `{"function": {...}}` wrapper, and arguments encoded as a
/// JSON string.
pub fn invocation_from_value(value: Value) -> Result<ToolInvocation, String> {
    let Value::Object(mut obj) = value else {
        return Err("fragment is not a JSON object".into());
    };

    if let Some(Value::Object(function)) = obj.remove("function") {
        return invocation_from_value(Value::Object(function));
    }

    let name = ["name", "tool"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "missing tool name".to_string())?
        .to_string();

    let raw_args = ["arguments", "args", "parameters", "input"]
        .iter()
        .find_map(|key| obj.remove(*key));

    let arguments = match raw_args {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(Value::String(s)) if s.trim().is_empty() => Map::new(),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(map)) => map,
            _ => return Err(format!("arguments for '{name}' are not a JSON object")),
        },
        Some(_) => return Err(format!("arguments for '{name}' are not a JSON object")),
    };

    Ok(ToolInvocation::new(name, arguments))
}

// ── Built-in transforms ───────────────────────────────────────────────────

/// Append the closing delimiters a truncated fragment is missing,
/// terminating an open string first.
pub struct CloseDelimiters;

impl RepairTransform for CloseDelimiters {
    fn name(&self) -> &'static str {
        "close_delimiters"
    }

    fn apply(&self, fragment: &str) -> Option<String> {
        let mut stack = Vec::new();
        let mut in_string = false;
        let mut escaped = false;

        for c in fragment.chars() {
            if in_string {
                match c {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' => stack.push('}'),
                '[' => stack.push(']'),
                '}' | ']' if stack.last() == Some(&c) => {
                    stack.pop();
                }
                _ => {}
            }
        }

        if !in_string && stack.is_empty() {
            return None;
        }

        let mut out = if in_string {
            let mut s = fragment.to_string();
            if escaped {
                s.pop();
            }
            s.push('"');
            s
        } else {
            fragment.trim_end().to_string()
        };
        while let Some(closer) = stack.pop() {
            out.push(closer);
        }
        Some(out)
    }
}

/// Drop a `,` that directly precedes a `}` or `]`.
pub struct StripTrailingSeparator;

impl RepairTransform for StripTrailingSeparator {
    fn name(&self) -> &'static str {
        "strip_trailing_separator"
    }

    fn apply(&self, fragment: &str) -> Option<String> {
        let chars: Vec<char> = fragment.chars().collect();
        let mut out = String::with_capacity(fragment.len());
        let mut in_string = false;
        let mut escaped = false;
        let mut changed = false;

        for (i, &c) in chars.iter().enumerate() {
            if in_string {
                match c {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                out.push(c);
                continue;
            }
            if c == ',' {
                let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
                if matches!(next, Some('}') | Some(']')) {
                    changed = true;
                    continue;
                }
            }
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }

        changed.then_some(out)
    }
}

/// Replace typographic quotes with ASCII ones; if the fragment then has
/// no double quotes at all, treat single quotes as string delimiters.
pub struct NormalizeQuotes;

impl RepairTransform for NormalizeQuotes {
    fn name(&self) -> &'static str {
        "normalize_quotes"
    }

    fn apply(&self, fragment: &str) -> Option<String> {
        let mut out: String = fragment
            .chars()
            .map(|c| match c {
                '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{00AB}' | '\u{00BB}' => '"',
                '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => '\'',
                other => other,
            })
            .collect();

        if !out.contains('"') && out.contains('\'') {
            out = out.replace('\'', "\"");
        }

        (out != fragment).then_some(out)
    }
}

/// Cut whatever follows the close of the top-level value. When the value
/// never closes, cut after the last closing delimiter instead.
pub struct TrimTrailing;

impl RepairTransform for TrimTrailing {
    fn name(&self) -> &'static str {
        "trim_trailing"
    }

    fn apply(&self, fragment: &str) -> Option<String> {
        let end = top_level_end(fragment)
            .or_else(|| fragment.rfind(['}', ']']).map(|i| i + 1))?;
        let rest = &fragment[end..];
        if rest.trim().is_empty() {
            return None;
        }
        Some(fragment[..end].to_string())
    }
}

/// Byte offset just past the delimiter that closes the first top-level
/// object or array, ignoring delimiters inside strings.
pub(crate) fn top_level_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut started = false;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if started => in_string = true,
            '{' | '[' => {
                depth += 1;
                started = true;
            }
            '}' | ']' if started => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}
