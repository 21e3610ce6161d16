//! Calculator tool: evaluates an arithmetic expression in one call.
//!
//! Grammar: `+ - * / % ^`, parentheses, unary minus and decimal literals.
//! `^` is right-associative and binds tighter than unary minus, so
//! `-2^2` is `-4`.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tierloop_core::error::ToolError;
use tierloop_core::tool::{Tool, ToolResult};

use crate::format_number;

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression. Supports + - * / % ^, parentheses and decimals."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Expression to evaluate, e.g. '(15 * 8) / 3'"
                }
            },
            "required": ["expression"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<ToolResult, ToolError> {
        let expression = arguments
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments {
                tool_name: "calculator".into(),
                reason: "'expression' must be a string".into(),
            })?;

        let value = evaluate(expression).map_err(|reason| ToolError::ExecutionFailed {
            tool_name: "calculator".into(),
            reason,
        })?;
        Ok(ToolResult::ok(format_number(value)).with_data(json!({ "result": value })))
    }
}

/// Evaluate `expression`, returning a readable error on bad input.
pub fn evaluate(expression: &str) -> Result<f64, String> {
    let tokens = lex(expression)?;
    let mut parser = Parser { tokens: &tokens, pos: 0 };
    let value = parser.expression(0)?;
    match parser.tokens.get(parser.pos) {
        None => {}
        Some(token) => return Err(format!("unexpected {token} after expression")),
    }
    if !value.is_finite() {
        return Err("result is not a finite number".into());
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Op(char),
    Open,
    Close,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Num(n) => write!(f, "number {n}"),
            Self::Op(c) => write!(f, "'{c}'"),
            Self::Open => write!(f, "'('"),
            Self::Close => write!(f, "')'"),
        }
    }
}

fn lex(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '+' | '-' | '*' | '/' | '%' | '^' => tokens.push(Token::Op(c)),
            '(' => tokens.push(Token::Open),
            ')' => tokens.push(Token::Close),
            '0'..='9' | '.' => {
                let mut end = start + c.len_utf8();
                while let Some(&(i, d)) = chars.peek() {
                    if !(d.is_ascii_digit() || d == '.') {
                        break;
                    }
                    end = i + d.len_utf8();
                    chars.next();
                }
                let literal = &input[start..end];
                let n = literal
                    .parse()
                    .map_err(|_| format!("invalid number '{literal}'"))?;
                tokens.push(Token::Num(n));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

/// Binding power of a binary operator: (left, right).
fn binding(op: char) -> Option<(u8, u8)> {
    match op {
        '+' | '-' => Some((1, 2)),
        '*' | '/' | '%' => Some((3, 4)),
        '^' => Some((7, 6)),
        _ => None,
    }
}

const UNARY_MINUS: u8 = 5;

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl Parser<'_> {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).copied();
        self.pos += 1;
        token
    }

    /// Precedence climbing: parse while operators bind tighter than `min`.
    fn expression(&mut self, min: u8) -> Result<f64, String> {
        let mut lhs = match self.next() {
            Some(Token::Num(n)) => n,
            Some(Token::Open) => {
                let inner = self.expression(0)?;
                if self.next() != Some(Token::Close) {
                    return Err("missing closing parenthesis".into());
                }
                inner
            }
            Some(Token::Op('-')) => -self.expression(UNARY_MINUS)?,
            Some(token) => return Err(format!("unexpected {token}")),
            None => return Err("unexpected end of expression".into()),
        };

        while let Some(&Token::Op(op)) = self.tokens.get(self.pos) {
            let Some((left, right)) = binding(op) else { break };
            if left < min {
                break;
            }
            self.pos += 1;
            let rhs = self.expression(right)?;
            lhs = match op {
                '+' => lhs + rhs,
                '-' => lhs - rhs,
                '*' => lhs * rhs,
                '/' | '%' if rhs == 0.0 => return Err("division by zero".into()),
                '/' => lhs / rhs,
                '%' => lhs % rhs,
                _ => lhs.powf(rhs),
            };
        }
        Ok(lhs)
    }
}
