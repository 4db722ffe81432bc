//! Helper tools the run loop reroutes malformed calls to.
//!
//! The model never needs to call these itself; the tool-call parser swaps a
//! broken call for one of them so the model gets a readable explanation on
//! the next step.

use async_trait::async_trait;
use serde_json::{Value, json};

use super::spec::{ToolContext, ToolError, ToolResult, ToolSpec, optional_str, required_str};

pub const HELPERS_SERVER: &str = "helpers";
pub const NO_SUCH_TOOL: &str = "no_such_tool";
pub const INVALID_TOOL_ARGUMENTS: &str = "invalid_tool_arguments";

/// Reports a call to a tool name that is not in the run's tool set.
pub struct NoSuchToolTool;

#[async_trait]
impl ToolSpec for NoSuchToolTool {
    fn name(&self) -> &'static str {
        NO_SUCH_TOOL
    }

    fn description(&self) -> &'static str {
        "Internal helper: reports that a requested tool does not exist."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "toolName": {"type": "string"},
                "availableTools": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["toolName"]
        })
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let tool_name = required_str(&input, "toolName")?;
        let available = input
            .get("availableTools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        Ok(ToolResult::error(format!(
            "Tool '{tool_name}' does not exist. Available tools: {available}"
        )))
    }
}

/// Reports a call whose arguments failed schema validation.
pub struct InvalidToolArgumentsTool;

#[async_trait]
impl ToolSpec for InvalidToolArgumentsTool {
    fn name(&self) -> &'static str {
        INVALID_TOOL_ARGUMENTS
    }

    fn description(&self) -> &'static str {
        "Internal helper: reports that a tool was called with invalid arguments."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "toolName": {"type": "string"},
                "toolArgs": {"type": "string"},
                "error": {"type": "string"}
            },
            "required": ["toolName", "error"]
        })
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let tool_name = required_str(&input, "toolName")?;
        let error = required_str(&input, "error")?;
        let args = optional_str(&input, "toolArgs").unwrap_or("");
        Ok(ToolResult::error(format!(
            "Invalid arguments for tool '{tool_name}': {error}\nArguments received: {args}\n\
             Call the tool again with arguments matching its schema."
        )))
    }
}
