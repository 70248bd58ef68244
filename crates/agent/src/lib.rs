//! Outbound adapters for the dialog engine.
//!
//! The engine only knows the boundary traits in `convoflow_core::flows::gateway`. This crate
//! provides the production implementations:
//! - `http`: reqwest transport for `http_request` blocks
//! - `llm`: OpenAI-compatible chat completions for `llm` and `agent` blocks
//! - `tools`: locally registered tools plus MCP servers, exposed as one `ToolProvider`
//! - `mcp`: JSON-RPC over HTTP client for `tools/list` and `tools/call`
//!
//! `build_gateways` wires them from an `AppConfig`.

pub mod gateways;
pub mod http;
pub mod llm;
pub mod mcp;
pub mod tools;

pub use gateways::build_gateways;
pub use http::ReqwestTransport;
pub use llm::OpenAiCompatibleClient;
pub use mcp::McpClient;
pub use tools::{Tool, ToolHub, ToolRegistry};
