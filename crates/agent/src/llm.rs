//! OpenAI-compatible chat completions (`POST {base_url}/chat/completions`).
//!
//! Works against OpenAI itself and any server exposing the same wire format, Ollama included.
//! The API key is held as a `SecretString` and only exposed while building the request header.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use convoflow_core::config::{LlmConfig, LlmProvider};
use convoflow_core::errors::ExternalCallError;
use convoflow_core::flows::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, LlmClient, ToolCall, ToolSpec,
};

use crate::http::classify;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    default_model: String,
    timeout: Duration,
}

impl OpenAiCompatibleClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<SecretString>,
        default_model: impl Into<String>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().build()?,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key,
            default_model: default_model.into(),
            timeout: Duration::from_secs(30),
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, reqwest::Error> {
        let base_url = config.base_url.clone().unwrap_or_else(|| {
            match config.provider {
                LlmProvider::OpenAi => OPENAI_BASE_URL,
                LlmProvider::Ollama => OLLAMA_BASE_URL,
            }
            .to_owned()
        });
        let mut client = Self::new(base_url, config.api_key.clone(), config.model.clone())?;
        client.timeout = Duration::from_secs(config.timeout_secs.max(1));
        Ok(client)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn body(&self, request: &ChatRequest) -> CompletionBody {
        CompletionBody {
            model: request.model.clone().unwrap_or_else(|| self.default_model.clone()),
            messages: request.messages.iter().map(WireMessage::from).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tools: request.tools.iter().map(WireTool::from).collect(),
        }
    }

    /// One request, no retries; the engine applies its retry policy around this call.
    async fn send(&self, body: &CompletionBody) -> Result<ChatResponse, ExternalCallError> {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.timeout)
            .json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await.map_err(|error| classify(error, self.timeout))?;
        let status = response.status();
        let text = response.text().await.map_err(|error| classify(error, self.timeout))?;
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ExternalCallError::Provider(format!(
                "authentication rejected by {} ({status})",
                self.base_url
            )));
        }
        if !status.is_success() {
            return Err(ExternalCallError::Status { status: status.as_u16(), body: text });
        }

        let parsed: CompletionResponse = serde_json::from_str(&text)
            .map_err(|error| ExternalCallError::InvalidResponse(error.to_string()))?;
        parsed.into_chat_response()
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ExternalCallError> {
        let body = self.body(&request);
        let response = self.send(&body).await?;
        debug!(
            event_name = "agent.llm.completed",
            model = %body.model,
            tool_calls = response.tool_calls.len(),
            "chat completion received"
        );
        Ok(response)
    }
}

#[derive(Debug, Serialize)]
struct CompletionBody {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: ChatRole,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
            tool_call_id: message.tool_call_id.clone(),
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    kind: "function".to_owned(),
                    function: WireFunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunctionCall,
}

fn function_kind() -> String {
    "function".to_owned()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

impl From<&ToolSpec> for WireTool {
    fn from(spec: &ToolSpec) -> Self {
        let parameters = if spec.parameters.is_null() {
            serde_json::json!({"type": "object", "properties": {}})
        } else {
            spec.parameters.clone()
        };
        Self {
            kind: "function",
            function: WireFunction {
                name: spec.name.clone(),
                description: spec.description.clone(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

impl CompletionResponse {
    fn into_chat_response(self) -> Result<ChatResponse, ExternalCallError> {
        let choice = self.choices.into_iter().next().ok_or_else(|| {
            ExternalCallError::InvalidResponse("completion has no choices".to_owned())
        })?;
        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: parse_arguments(&call.function.arguments),
            })
            .collect();
        Ok(ChatResponse { content: choice.message.content, tool_calls })
    }
}

/// Providers send arguments as a JSON-encoded string. Non-JSON text is kept as a string value.
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}
