use std::env;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;
use wayfarer_agents::{LanguageModel, ModelError, ModelRequest, ModelResponse, ModelStop};
use wayfarer_core::{ConversationMessage, Role, ToolCallRequest};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct OpenAiRuntimeConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl OpenAiRuntimeConfig {
    /// `None` unless `OPENAI_API_KEY` is set.
    pub fn from_env() -> Option<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .ok()
            .filter(|value| !value.trim().is_empty())?;
        let model = env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let base_url = env::var("OPENAI_BASE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Some(Self {
            api_key,
            model,
            base_url,
        })
    }
}

/// Chat-completions client with function tools.
#[derive(Debug, Clone)]
pub struct OpenAiChatModel {
    runtime: OpenAiRuntimeConfig,
    http_client: Client,
}

impl OpenAiChatModel {
    pub fn new(runtime: OpenAiRuntimeConfig) -> Result<Self, ModelError> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(6))
            .timeout(Duration::from_secs(25))
            .build()
            .map_err(|error| ModelError::Unconfigured(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            runtime,
            http_client,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.runtime.model
    }
}

impl LanguageModel for OpenAiChatModel {
    async fn respond(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let payload = completion_payload(&self.runtime.model, request);
        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.runtime.base_url))
            .bearer_auth(self.runtime.api_key.as_str())
            .json(&payload)
            .send()
            .await
            .map_err(|error| ModelError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Transport(format!(
                "non-success status {}: {}",
                status.as_u16(),
                body
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| ModelError::Protocol(error.to_string()))?;
        let parsed = parse_completion(&body)?;
        debug!(
            model = %self.runtime.model,
            tool_calls = parsed.tool_calls.len(),
            stop = ?parsed.stop,
            "model responded"
        );
        Ok(parsed)
    }
}

fn completion_payload(model: &str, request: &ModelRequest) -> Value {
    let mut messages = vec![json!({ "role": "system", "content": request.system_prompt })];
    messages.extend(request.messages.iter().map(wire_message));

    let tools = request
        .tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters
                }
            })
        })
        .collect::<Vec<_>>();

    json!({
        "model": model,
        "messages": messages,
        "tools": tools,
        "parallel_tool_calls": true
    })
}

fn wire_message(message: &ConversationMessage) -> Value {
    match message.role {
        Role::System => json!({ "role": "system", "content": message.content }),
        Role::User => json!({ "role": "user", "content": message.content }),
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content
        }),
        Role::Assistant if message.tool_calls.is_empty() => {
            json!({ "role": "assistant", "content": message.content })
        }
        Role::Assistant => {
            let calls = message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.call_id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": encoded_arguments(&call.arguments)
                        }
                    })
                })
                .collect::<Vec<_>>();
            let content = if message.content.is_empty() {
                Value::Null
            } else {
                Value::String(message.content.clone())
            };
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
    }
}

fn encoded_arguments(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

fn parse_completion(body: &Value) -> Result<ModelResponse, ModelError> {
    let choice = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or_else(|| ModelError::Protocol("response has no choices".to_string()))?;
    let message = choice
        .get("message")
        .ok_or_else(|| ModelError::Protocol("choice has no message".to_string()))?;

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut tool_calls = Vec::new();
    for raw in message
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let call_id = raw
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ModelError::Protocol("tool call without id".to_string()))?;
        let function = raw
            .get("function")
            .ok_or_else(|| ModelError::Protocol(format!("tool call {call_id} has no function")))?;
        let name = function
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ModelError::Protocol(format!("tool call {call_id} has no name")))?;
        let arguments = function.get("arguments").cloned().unwrap_or(Value::Null);

        tool_calls.push(ToolCallRequest {
            call_id: call_id.to_string(),
            name: name.to_string(),
            arguments,
        });
    }

    let stop = match choice.get("finish_reason").and_then(Value::as_str) {
        Some("length") => ModelStop::Length,
        Some("tool_calls") => ModelStop::ToolCalls,
        _ if !tool_calls.is_empty() => ModelStop::ToolCalls,
        _ => ModelStop::Stop,
    };

    Ok(ModelResponse {
        text,
        tool_calls,
        stop,
    })
}
