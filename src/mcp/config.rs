//! MCP server configuration loaded from `mcp.json`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const PROJECT_DIR_PLACEHOLDER: &str = "${projectDir}";
pub const TASK_DIR_PLACEHOLDER: &str = "${taskDir}";

// === Configuration Types ===

/// Full MCP configuration from mcp.json
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct McpConfig {
    #[serde(default)]
    pub timeouts: McpTimeouts,
    #[serde(default, alias = "mcpServers")]
    pub servers: HashMap<String, McpServerConfig>,
}

/// Global timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[allow(clippy::struct_field_names)]
pub struct McpTimeouts {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_execute_timeout")]
    pub execute_timeout: u64,
    #[serde(default = "default_list_tools_timeout")]
    pub list_tools_timeout: u64,
}

fn default_connect_timeout() -> u64 {
    30
}
fn default_execute_timeout() -> u64 {
    120
}
fn default_list_tools_timeout() -> u64 {
    600
}

impl Default for McpTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            execute_timeout: default_execute_timeout(),
            list_tools_timeout: default_list_tools_timeout(),
        }
    }
}

/// How to reach a server: a local subprocess speaking stdio, or a remote URL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum McpTransportConfig {
    Local {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Remote {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// Configuration for a single MCP server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct McpServerConfig {
    #[serde(flatten)]
    pub transport: McpTransportConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_timeout: Option<u64>,
    #[serde(default)]
    pub disabled: bool,
}

impl McpServerConfig {
    pub fn local(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            transport: McpTransportConfig::Local {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            connect_timeout: None,
            execute_timeout: None,
            disabled: false,
        }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            transport: McpTransportConfig::Remote {
                url: url.into(),
                headers: HashMap::new(),
            },
            connect_timeout: None,
            execute_timeout: None,
            disabled: false,
        }
    }

    pub fn effective_connect_timeout(&self, global: &McpTimeouts) -> u64 {
        self.connect_timeout.unwrap_or(global.connect_timeout)
    }

    pub fn effective_execute_timeout(&self, global: &McpTimeouts) -> u64 {
        self.execute_timeout.unwrap_or(global.execute_timeout)
    }

    /// Every string a placeholder may hide in: command, url, args, env and header values.
    pub fn string_fields(&self) -> Vec<&str> {
        match &self.transport {
            McpTransportConfig::Local { command, args, env } => std::iter::once(command.as_str())
                .chain(args.iter().map(String::as_str))
                .chain(env.values().map(String::as_str))
                .collect(),
            McpTransportConfig::Remote { url, headers } => std::iter::once(url.as_str())
                .chain(headers.values().map(String::as_str))
                .collect(),
        }
    }

    /// Short human-readable description of the transport.
    pub fn display_target(&self) -> String {
        match &self.transport {
            McpTransportConfig::Local { command, args, .. } if args.is_empty() => command.clone(),
            McpTransportConfig::Local { command, args, .. } => {
                format!("{} {}", command, args.join(" "))
            }
            McpTransportConfig::Remote { url, .. } => url.clone(),
        }
    }
}

impl McpConfig {
    /// Load configuration from a path, returning defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read MCP config: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse MCP config: {}", path.display()))
    }

    /// Servers that are not marked `disabled`.
    pub fn enabled_servers(&self) -> HashMap<String, McpServerConfig> {
        self.servers
            .iter()
            .filter(|(_, cfg)| !cfg.disabled)
            .map(|(name, cfg)| (name.clone(), cfg.clone()))
            .collect()
    }
}
