//! Boundaries to the outside world used by side-effecting blocks.
//!
//! Implementations live in `convoflow-agent`; the defaults here refuse every call so a solution
//! that never touches the network runs without configuration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::turn::NluResult;
use crate::errors::ExternalCallError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpCall {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body parsed as JSON, or the raw text when it is not JSON.
    pub fn body_value(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or_else(|_| Value::String(self.body.clone()))
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, call: HttpCall) -> Result<HttpReply, ExternalCallError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), tool_call_id: None, tool_calls: Vec::new() }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { tool_call_id: Some(call_id.into()), ..Self::new(ChatRole::Tool, content) }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatRequest {
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ExternalCallError>;
}

#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Tools visible to an agent: local tools named in `allowlist` plus every tool of `servers`.
    async fn list_tools(
        &self,
        allowlist: &[String],
        servers: &[String],
    ) -> Result<Vec<ToolSpec>, ExternalCallError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, ExternalCallError>;
}

#[async_trait]
pub trait NluClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<NluResult, ExternalCallError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledHttpTransport;

#[async_trait]
impl HttpTransport for DisabledHttpTransport {
    async fn send(&self, _call: HttpCall) -> Result<HttpReply, ExternalCallError> {
        Err(ExternalCallError::NotConfigured("http transport".to_owned()))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledLlmClient;

#[async_trait]
impl LlmClient for DisabledLlmClient {
    async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ExternalCallError> {
        Err(ExternalCallError::NotConfigured("llm client".to_owned()))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoTools;

#[async_trait]
impl ToolProvider for NoTools {
    async fn list_tools(
        &self,
        _allowlist: &[String],
        _servers: &[String],
    ) -> Result<Vec<ToolSpec>, ExternalCallError> {
        Ok(Vec::new())
    }

    async fn call_tool(&self, name: &str, _arguments: Value) -> Result<String, ExternalCallError> {
        Err(ExternalCallError::NotConfigured(format!("tool `{name}`")))
    }
}

/// Classifier used when turns arrive without precomputed NLU and none is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyNluClassifier;

#[async_trait]
impl NluClassifier for EmptyNluClassifier {
    async fn classify(&self, _text: &str) -> Result<NluResult, ExternalCallError> {
        Ok(NluResult::default())
    }
}

/// The set of outbound boundaries handed to the interpreter.
#[derive(Clone)]
pub struct Gateways {
    pub http: Arc<dyn HttpTransport>,
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<dyn ToolProvider>,
    pub nlu: Arc<dyn NluClassifier>,
}

impl Default for Gateways {
    fn default() -> Self {
        Self {
            http: Arc::new(DisabledHttpTransport),
            llm: Arc::new(DisabledLlmClient),
            tools: Arc::new(NoTools),
            nlu: Arc::new(EmptyNluClassifier),
        }
    }
}

impl Gateways {
    pub fn with_http(mut self, http: Arc<dyn HttpTransport>) -> Self {
        self.http = http;
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = llm;
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolProvider>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_nlu(mut self, nlu: Arc<dyn NluClassifier>) -> Self {
        self.nlu = nlu;
        self
    }
}
