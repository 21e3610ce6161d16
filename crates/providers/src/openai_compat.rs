//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI, OpenRouter, Groq, Cerebras, Together, Ollama, vLLM
//! and any other host exposing `/chat/completions`. Failures are always
//! returned as `Err`; the dispatcher never sees a degraded response.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tierloop_core::error::ProviderError;
use tierloop_core::message::{Message, Role, ToolInvocation};
use tierloop_core::provider::*;
use tracing::{debug, warn};

/// An OpenAI-compatible chat provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    ///
    /// The HTTP client carries a generous transport timeout; the dispatcher
    /// applies the real per-call limit.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    /// OpenRouter (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key)
    }

    /// Groq (convenience constructor).
    pub fn groq(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new("groq", "https://api.groq.com/openai/v1", api_key)
    }

    /// Ollama (convenience constructor). Ollama doesn't need a real key.
    pub fn ollama(base_url: Option<&str>) -> Result<Self, ProviderError> {
        Self::new("ollama", base_url.unwrap_or("http://localhost:11434/v1"), "ollama")
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                    Role::System => "system".into(),
                    Role::Tool => "tool".into(),
                },
                content: m.content.clone(),
                tool_calls: (!m.tool_calls.is_empty()).then(|| {
                    m.tool_calls
                        .iter()
                        .map(|tc| ApiToolCall {
                            id: tc.id.clone(),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: tc.name.clone(),
                                arguments: Value::Object(tc.arguments.clone()).to_string(),
                            },
                        })
                        .collect()
                }),
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect()
    }

    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest) -> Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": false,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }
        if !request.stop.is_empty() {
            body["stop"] = serde_json::json!(request.stop);
        }
        body
    }
}

/// Convert a parsed API response into the engine's response type.
///
/// Native calls whose `arguments` string is not a JSON object are moved
/// into the text as `TOOL_CALL:` lines, so the extractor's repair path
/// gets a chance at them.
fn into_provider_response(
    provider: &str,
    api_response: ApiResponse,
) -> Result<ProviderResponse, ProviderError> {
    let choice = api_response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::InvalidResponse("no choices in response".into()))?;

    let mut content = choice.message.content.unwrap_or_default();
    let mut tool_calls = Vec::new();

    for tc in choice.message.tool_calls.unwrap_or_default() {
        match serde_json::from_str::<Value>(&tc.function.arguments) {
            Ok(Value::Object(arguments)) => tool_calls.push(ToolInvocation {
                id: tc.id,
                name: tc.function.name,
                arguments,
            }),
            _ if tc.function.arguments.trim().is_empty() => tool_calls.push(ToolInvocation {
                id: tc.id,
                name: tc.function.name,
                arguments: Map::new(),
            }),
            _ => {
                warn!(provider = %provider, tool = %tc.function.name, "Native tool call has malformed arguments");
                if !content.is_empty() {
                    content.push('\n');
                }
                content.push_str(&format!(
                    "TOOL_CALL: {{\"name\": {}, \"arguments\": {}}}",
                    Value::String(tc.function.name),
                    tc.function.arguments
                ));
            }
        }
    }

    let message = if tool_calls.is_empty() {
        Message::assistant(content)
    } else {
        Message::assistant_with_calls(Some(content), tool_calls)
    };

    let usage = api_response.usage.map(|u| Usage {
        prompt_tokens: u.prompt_tokens,
        completion_tokens: u.completion_tokens,
        total_tokens: u.total_tokens,
    });

    let mut metadata = Map::new();
    metadata.insert("provider".into(), Value::String(provider.to_string()));
    if let Some(reason) = choice.finish_reason {
        metadata.insert("finish_reason".into(), Value::String(reason));
    }

    Ok(ProviderResponse {
        message,
        usage,
        model: api_response.model,
        metadata,
    })
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(&request);

        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(5);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status.as_u16() == 404 {
            return Err(ProviderError::ModelNotFound(request.model));
        }

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(provider = %self.name, status = status.as_u16(), body = %error_body, "Provider returned error");
            return Err(ProviderError::ApiError {
                status_code: status.as_u16(),
                message: error_body,
            });
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse response: {e}")))?;

        into_provider_response(&self.name, api_response)
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(data: &str) -> Result<ProviderResponse, ProviderError> {
        let api: ApiResponse = serde_json::from_str(data).unwrap();
        into_provider_response("test", api)
    }

    #[test]
    fn constructors_set_base_urls() {
        let groq = OpenAiCompatProvider::groq("gsk").unwrap();
        assert_eq!(groq.name(), "groq");
        assert!(groq.base_url().contains("groq.com"));

        let ollama = OpenAiCompatProvider::ollama(Some("http://box:11434/v1/")).unwrap();
        assert_eq!(ollama.base_url(), "http://box:11434/v1");
    }

    #[test]
    fn message_conversion_round_trips_tool_calls() {
        let inv = ToolInvocation {
            id: "call_1".into(),
            name: "multiply".into(),
            arguments: serde_json::json!({"a": 15, "b": 8}).as_object().cloned().unwrap(),
        };
        let messages = vec![
            Message::system("rules"),
            Message::assistant_with_calls(None, vec![inv]),
            Message::tool_result("call_1", "multiply", "120"),
        ];
        let api = OpenAiCompatProvider::to_api_messages(&messages);
        assert_eq!(api[0].role, "system");
        assert!(api[1].content.is_none());
        let tc = &api[1].tool_calls.as_ref().unwrap()[0];
        assert_eq!(tc.function.name, "multiply");
        let args: Value = serde_json::from_str(&tc.function.arguments).unwrap();
        assert_eq!(args["b"], 8);
        assert_eq!(api[2].role, "tool");
        assert_eq!(api[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn request_body_includes_optional_fields() {
        let mut req = ProviderRequest::new("gpt-4o-mini", vec![Message::user("hi")]);
        req.max_tokens = Some(64);
        req.tools = vec![ToolDefinition {
            name: "add".into(),
            description: "Add".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let body = OpenAiCompatProvider::request_body(&req);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["tools"][0]["function"]["name"], "add");
        assert!(body.get("stop").is_none());
    }

    #[test]
    fn text_response_is_converted() {
        let resp = parse(
            r#"{"model":"llama-3.1-8b-instant","choices":[{"message":{"role":"assistant","content":"40"},"finish_reason":"stop"}],
                "usage":{"prompt_tokens":10,"completion_tokens":1,"total_tokens":11}}"#,
        )
        .unwrap();
        assert_eq!(resp.message.text(), "40");
        assert_eq!(resp.usage.unwrap().total_tokens, 11);
        assert_eq!(resp.metadata["finish_reason"], "stop");
    }

    #[test]
    fn native_tool_calls_are_parsed_into_maps() {
        let resp = parse(
            r#"{"model":"gpt-4o-mini","choices":[{"message":{"role":"assistant","content":null,
                "tool_calls":[{"id":"call_a","type":"function","function":{"name":"divide","arguments":"{\"a\":120,\"b\":3}"}}]}}]}"#,
        )
        .unwrap();
        assert!(resp.message.has_tool_calls());
        assert!(resp.message.content.is_none());
        assert_eq!(resp.message.tool_calls[0].id, "call_a");
        assert_eq!(resp.message.tool_calls[0].arguments["a"], 120);
    }

    #[test]
    fn malformed_native_arguments_fall_back_to_text() {
        let resp = parse(
            r#"{"model":"m","choices":[{"message":{"role":"assistant","content":"",
                "tool_calls":[{"id":"x","type":"function","function":{"name":"add","arguments":"{\"a\":1,\"b\":2"}}]}}]}"#,
        )
        .unwrap();
        assert!(!resp.message.has_tool_calls());
        assert_eq!(
            resp.message.text(),
            r#"TOOL_CALL: {"name": "add", "arguments": {"a":1,"b":2}"#
        );
    }

    #[test]
    fn empty_choices_is_invalid() {
        let err = parse(r#"{"model":"m","choices":[]}"#).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }
}
