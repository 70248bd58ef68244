use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use convoflow_core::errors::ExternalCallError;
use convoflow_core::flows::{ToolProvider, ToolSpec};

use crate::mcp::McpClient;

/// A tool implemented in-process and offered to agent blocks by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str {
        ""
    }

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, input: Value) -> Result<Value>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.name().to_string(), Box::new(tool));
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Specs of the registered tools named in `allowlist`, in allowlist order.
    pub fn specs(&self, allowlist: &[String]) -> Vec<ToolSpec> {
        allowlist
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolSpec {
                name: tool.name().to_owned(),
                description: tool.description().to_owned(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    pub async fn call(&self, name: &str, input: Value) -> Option<Result<Value>> {
        let tool = self.tools.get(name)?;
        Some(tool.execute(input).await)
    }
}

/// Local tools plus remote MCP servers behind one [`ToolProvider`].
pub struct ToolHub {
    registry: ToolRegistry,
    servers: HashMap<String, McpClient>,
    routes: RwLock<HashMap<String, String>>,
}

impl ToolHub {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry, servers: HashMap::new(), routes: RwLock::new(HashMap::new()) }
    }

    pub fn with_server(mut self, client: McpClient) -> Self {
        self.servers.insert(client.name().to_owned(), client);
        self
    }

    pub fn server_names(&self) -> Vec<&str> {
        let mut names = self.servers.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ToolProvider for ToolHub {
    async fn list_tools(
        &self,
        allowlist: &[String],
        servers: &[String],
    ) -> Result<Vec<ToolSpec>, ExternalCallError> {
        let mut specs = self.registry.specs(allowlist);
        for server_name in servers {
            let Some(server) = self.servers.get(server_name) else {
                warn!(
                    event_name = "agent.tools.unknown_server",
                    server = %server_name,
                    "agent references an mcp server that is not configured"
                );
                continue;
            };
            let remote = server.list_tools().await?;
            let mut routes = self.routes.write().await;
            for spec in remote {
                routes.insert(spec.name.clone(), server_name.clone());
                specs.push(spec);
            }
        }
        Ok(specs)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, ExternalCallError> {
        if let Some(outcome) = self.registry.call(name, arguments.clone()).await {
            let value = outcome.map_err(|error| {
                ExternalCallError::Provider(format!("tool `{name}` failed: {error:#}"))
            })?;
            debug!(event_name = "agent.tools.local_call", tool = name, "local tool completed");
            return Ok(match value {
                Value::String(text) => text,
                other => other.to_string(),
            });
        }

        let route = self.routes.read().await.get(name).cloned();
        let server = route
            .and_then(|server_name| self.servers.get(&server_name))
            .ok_or_else(|| ExternalCallError::Provider(format!("unknown tool `{name}`")))?;
        server.call_tool(name, arguments).await
    }
}
