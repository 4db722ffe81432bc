//! The tool set assembled for one run.
//!
//! Tools are keyed by their composite id `server---tool` and keep insertion
//! order, which is also the order they are advertised to the model.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::models::{CacheControl, Tool};

use super::schema::ToolSchema;
use super::spec::{ToolContext, ToolError, ToolResult, ToolSpec};

pub const TOOL_ID_SEPARATOR: &str = "---";

/// Compose a tool id from server and tool names.
pub fn tool_id(server: &str, tool: &str) -> String {
    format!("{server}{TOOL_ID_SEPARATOR}{tool}")
}

/// Split a tool id into `(server, tool)`.
pub fn split_tool_id(id: &str) -> Option<(&str, &str)> {
    id.split_once(TOOL_ID_SEPARATOR)
}

// === Types ===

/// One callable tool with the schema the model sees and the one arguments are checked against.
#[derive(Clone)]
pub struct RegisteredTool {
    pub id: String,
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
    /// Provider-adapted schema sent to the model.
    pub parameters: Value,
    pub schema: ToolSchema,
    pub tool: Arc<dyn ToolSpec>,
}

impl RegisteredTool {
    pub fn validate(&self, args: &Value) -> Result<(), String> {
        self.schema.validate(args)
    }
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("id", &self.id)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Registry that holds every tool available to a run.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A duplicate id keeps the earlier entry.
    pub fn register(&mut self, tool: RegisteredTool) -> bool {
        if self.index.contains_key(&tool.id) {
            tracing::warn!("Duplicate tool id ignored: {}", tool.id);
            return false;
        }
        self.index.insert(tool.id.clone(), self.tools.len());
        self.tools.push(tool);
        true
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&RegisteredTool> {
        self.index.get(id).map(|&i| &self.tools[i])
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.id.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredTool> {
        self.tools.iter()
    }

    /// Tools with the given bare name under any server.
    pub fn find_by_tool_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a RegisteredTool> {
        self.tools.iter().filter(move |t| t.tool_name == name)
    }

    /// Execute a tool by id.
    pub async fn execute(
        &self,
        id: &str,
        input: Value,
        context: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let tool = self
            .get(id)
            .ok_or_else(|| ToolError::not_available(format!("tool '{id}' is not registered")))?;
        tool.tool.execute(input, context).await
    }

    /// Convert all tools to API Tool format with optional cache control on the last tool.
    #[must_use]
    pub fn to_api_tools(&self, enable_cache: bool) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self
            .tools
            .iter()
            .map(|tool| Tool {
                name: tool.id.clone(),
                description: tool.description.clone(),
                input_schema: tool.parameters.clone(),
                cache_control: None,
            })
            .collect();
        if enable_cache && let Some(last) = tools.last_mut() {
            last.cache_control = Some(CacheControl::ephemeral());
        }
        tools
    }
}
