//! Minimal MCP client speaking JSON-RPC 2.0 over plain HTTP POST.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use convoflow_core::config::McpServerConfig;
use convoflow_core::errors::ExternalCallError;
use convoflow_core::flows::ToolSpec;

use crate::http::classify;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

pub struct McpClient {
    name: String,
    url: String,
    client: Client,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ListedTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    input_schema: Value,
}

impl McpClient {
    pub fn new(name: impl Into<String>, url: impl Into<String>, client: Client) -> Self {
        Self { name: name.into(), url: url.into(), client, next_id: AtomicU64::new(1) }
    }

    pub fn from_config(config: &McpServerConfig, client: Client) -> Self {
        Self::new(config.name.clone(), config.url.clone(), client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, ExternalCallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let response = self
            .client
            .post(&self.url)
            .timeout(RPC_TIMEOUT)
            .json(&envelope)
            .send()
            .await
            .map_err(|error| classify(error, RPC_TIMEOUT))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|error| classify(error, RPC_TIMEOUT))?;
        if !(200..300).contains(&status) {
            return Err(ExternalCallError::Status { status, body });
        }

        let parsed: RpcResponse = serde_json::from_str(&body).map_err(|error| {
            ExternalCallError::InvalidResponse(format!("mcp server `{}`: {error}", self.name))
        })?;
        if let Some(error) = parsed.error {
            return Err(ExternalCallError::Provider(format!(
                "mcp server `{}` returned error {}: {}",
                self.name, error.code, error.message
            )));
        }
        debug!(event_name = "agent.mcp.rpc", server = %self.name, method, "mcp call completed");
        Ok(parsed.result.unwrap_or(Value::Null))
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolSpec>, ExternalCallError> {
        let result = self.rpc("tools/list", json!({})).await?;
        let tools: Vec<ListedTool> =
            serde_json::from_value(result.get("tools").cloned().unwrap_or_else(|| json!([])))
                .map_err(|error| {
                    ExternalCallError::InvalidResponse(format!(
                        "mcp server `{}` listed malformed tools: {error}",
                        self.name
                    ))
                })?;

        Ok(tools
            .into_iter()
            .map(|tool| ToolSpec {
                name: tool.name,
                description: tool.description.unwrap_or_default(),
                parameters: tool.input_schema,
            })
            .collect())
    }

    /// Calls a tool and flattens its text content blocks into one observation.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<String, ExternalCallError> {
        let result =
            self.rpc("tools/call", json!({"name": name, "arguments": arguments})).await?;
        let text = result
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|block| block.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_else(|| result.to_string());

        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            return Err(ExternalCallError::Provider(format!("tool `{name}` failed: {text}")));
        }
        Ok(text)
    }
}
