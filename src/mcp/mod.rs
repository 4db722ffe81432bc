//! Async MCP (Model Context Protocol) client side.
//!
//! - `config`: `mcp.json` server definitions and timeouts
//! - `scope`: sharing-boundary resolution and `${projectDir}`/`${taskDir}` interpolation
//! - `transport`: stdio, streamable HTTP and SSE JSON-RPC transports
//! - `connector`: one live server connection plus its tool list
//! - `cache`: persisted tool listings for fast cold start
//! - `pool`: `McpManager`, the process-wide connector pool

pub mod cache;
pub mod config;
pub mod connector;
pub mod pool;
pub mod scope;
pub mod transport;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cache::ToolsCache;
pub use config::{McpConfig, McpServerConfig, McpTimeouts, McpTransportConfig};
pub use connector::{ConnectorFactory, DefaultConnectorFactory, McpConnector};
pub use pool::McpManager;
pub use scope::{GLOBAL_SCOPE, calculate_scope, interpolate};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Errors raised while talking to an MCP server.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to spawn MCP server '{server}': {message}")]
    Spawn { server: String, message: String },

    #[error("MCP I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MCP JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MCP HTTP error: {0}")]
    Http(String),

    #[error("MCP server error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("MCP request '{method}' timed out after {seconds}s")]
    Timeout { method: String, seconds: u64 },

    #[error("MCP server disconnected")]
    Disconnected,

    #[error("MCP protocol error: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        McpError::Http(err.to_string())
    }
}

// === MCP Tool Definition ===

/// Tool discovered from an MCP server
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: serde_json::Value,
    /// Owning server, filled in after listing.
    #[serde(rename = "serverName", default)]
    pub server_name: String,
}

/// Format MCP tool result for display
pub fn format_tool_result(result: &serde_json::Value) -> String {
    let is_error = result
        .get("isError")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    let content = result
        .get("content")
        .and_then(|v| v.as_array())
        .map_or_else(
            || serde_json::to_string_pretty(result).unwrap_or_default(),
            |arr| {
                arr.iter()
                    .filter_map(|item| match item.get("type")?.as_str()? {
                        "text" => item.get("text")?.as_str().map(String::from),
                        "resource" => item
                            .get("resource")
                            .and_then(|r| r.get("text"))
                            .and_then(|t| t.as_str())
                            .map(String::from)
                            .or_else(|| Some("[resource content]".to_string())),
                        other => Some(format!("[{other} content]")),
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            },
        );

    if is_error {
        format!("Error: {content}")
    } else {
        content
    }
}
