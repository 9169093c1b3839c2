use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use wayfarer_core::{ConversationMessage, ToolCallRequest, ToolDefinition};

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub messages: Vec<ConversationMessage>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStop {
    Stop,
    Length,
    ToolCalls,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub stop: ModelStop,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            stop: ModelStop::Stop,
        }
    }

    pub fn calls(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            text: String::new(),
            tool_calls,
            stop: ModelStop::ToolCalls,
        }
    }
}

pub fn tool_call(call_id: &str, name: &str, arguments: Value) -> ToolCallRequest {
    ToolCallRequest {
        call_id: call_id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model transport failed: {0}")]
    Transport(String),
    #[error("model returned an unreadable response: {0}")]
    Protocol(String),
    #[error("model is not configured: {0}")]
    Unconfigured(String),
}

pub trait LanguageModel: Send + Sync {
    async fn respond(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;
}

#[derive(Debug, Clone)]
pub struct ScriptedStep {
    delay: Option<Duration>,
    outcome: Result<ModelResponse, String>,
}

impl ScriptedStep {
    pub fn reply(response: ModelResponse) -> Self {
        Self {
            delay: None,
            outcome: Ok(response),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            delay: None,
            outcome: Err(message.into()),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Replays a fixed list of responses, one per step. Once the script runs
/// out it answers with an empty final message.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    steps: Mutex<VecDeque<ScriptedStep>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(responses: Vec<ModelResponse>) -> Self {
        Self::new(responses.into_iter().map(ScriptedStep::reply).collect())
    }

    pub fn push(&self, step: ScriptedStep) {
        self.steps.lock().push_back(step);
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().len()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }
}

impl LanguageModel for ScriptedModel {
    async fn respond(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        self.requests.lock().push(request.clone());
        let step = self.steps.lock().pop_front();

        let Some(step) = step else {
            return Ok(ModelResponse::text(""));
        };
        if let Some(delay) = step.delay {
            tokio::time::sleep(delay).await;
        }
        step.outcome.map_err(ModelError::Transport)
    }
}
