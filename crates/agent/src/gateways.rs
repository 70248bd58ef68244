use std::sync::Arc;

use reqwest::Client;
use tracing::info;

use convoflow_core::config::{AppConfig, LlmProvider};
use convoflow_core::flows::Gateways;

use crate::http::ReqwestTransport;
use crate::llm::OpenAiCompatibleClient;
use crate::mcp::McpClient;
use crate::tools::{ToolHub, ToolRegistry};

/// Wires the production gateways from configuration.
///
/// The LLM client is only installed when it can authenticate: Ollama needs no key, OpenAI does.
/// Without it, llm and agent blocks fail with `NotConfigured` and take their error branch.
pub fn build_gateways(
    config: &AppConfig,
    registry: ToolRegistry,
) -> Result<Gateways, reqwest::Error> {
    let transport = ReqwestTransport::new()?;
    let mcp_client = Client::builder().build()?;

    let mut hub = ToolHub::new(registry);
    for server in &config.mcp.servers {
        hub = hub.with_server(McpClient::from_config(server, mcp_client.clone()));
    }

    let mut gateways =
        Gateways::default().with_http(Arc::new(transport)).with_tools(Arc::new(hub));

    let llm_ready = config.llm.provider == LlmProvider::Ollama || config.llm.api_key.is_some();
    if llm_ready {
        gateways = gateways.with_llm(Arc::new(OpenAiCompatibleClient::from_config(&config.llm)?));
    }
    info!(
        event_name = "agent.gateways.built",
        llm_enabled = llm_ready,
        mcp_servers = config.mcp.servers.len(),
        "gateways configured"
    );
    Ok(gateways)
}
