//! Turn raw model tool calls into calls the registry can execute.
//!
//! A call that names an unknown tool is retried under another server that
//! exposes a tool with the same name, otherwise it becomes a
//! `helpers---no_such_tool` call. Arguments that are not JSON or fail the
//! schema become a `helpers---invalid_tool_arguments` call. Anything else
//! gets one repair round-trip through the model before the call is
//! declared unrepairable.

use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm_client::RawToolCall;
use crate::tools::helpers::{HELPERS_SERVER, INVALID_TOOL_ARGUMENTS, NO_SUCH_TOOL};
use crate::tools::{ToolRegistry, split_tool_id, tool_id};

use super::repair::ToolCallRepairer;

/// A call resolved against the run's tool set.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub id: String,
    pub tool_id: String,
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolCallError {
    #[error("Tool '{0}' does not exist")]
    NoSuchTool(String),

    #[error("Invalid arguments for tool '{tool}': {error}")]
    InvalidArguments { tool: String, error: String },

    #[error("Malformed tool call '{tool}': {error}")]
    Malformed { tool: String, error: String },

    #[error("Tool call '{tool}' could not be repaired: {error}")]
    Unrepairable { tool: String, error: String },
}

/// Strict parse: the name must be registered and the arguments must be a
/// JSON object that validates against the tool's schema.
pub fn parse_tool_call(registry: &ToolRegistry, call: &RawToolCall) -> Result<ParsedToolCall, ToolCallError> {
    if call.name.trim().is_empty() {
        return Err(ToolCallError::Malformed {
            tool: call.name.clone(),
            error: "tool name is empty".to_string(),
        });
    }
    let Some(tool) = registry.get(&call.name) else {
        return Err(ToolCallError::NoSuchTool(call.name.clone()));
    };

    let raw = if call.input.trim().is_empty() { "{}" } else { call.input.as_str() };
    let arguments: Value = serde_json::from_str(raw).map_err(|err| ToolCallError::InvalidArguments {
        tool: call.name.clone(),
        error: format!("arguments are not valid JSON: {err}"),
    })?;
    if !arguments.is_object() {
        return Err(ToolCallError::Malformed {
            tool: call.name.clone(),
            error: "arguments must be a JSON object".to_string(),
        });
    }
    tool.validate(&arguments)
        .map_err(|error| ToolCallError::InvalidArguments {
            tool: call.name.clone(),
            error,
        })?;

    Ok(ParsedToolCall {
        id: call.id.clone(),
        tool_id: tool.id.clone(),
        server_name: tool.server_name.clone(),
        tool_name: tool.tool_name.clone(),
        arguments,
    })
}

/// Parse `call`, rerouting or repairing it when the strict parse fails.
pub async fn resolve_tool_call(
    registry: &ToolRegistry,
    call: &RawToolCall,
    repairer: Option<&ToolCallRepairer>,
    cancel: &CancellationToken,
) -> Result<ParsedToolCall, ToolCallError> {
    let error = match reroute(registry, call) {
        Ok(parsed) => return Ok(parsed),
        Err(error) => error,
    };

    let Some(repairer) = repairer else {
        return Err(unrepairable(call, &error));
    };
    match repairer.repair(call, &error.to_string(), cancel).await {
        Some(repaired) => reroute(registry, &repaired).map_err(|err| unrepairable(&repaired, &err)),
        None => Err(unrepairable(call, &error)),
    }
}

/// Strict parse plus the rerouting rules that need no model round-trip.
/// Only `Malformed` errors are returned.
fn reroute(registry: &ToolRegistry, call: &RawToolCall) -> Result<ParsedToolCall, ToolCallError> {
    match parse_tool_call(registry, call) {
        Err(ToolCallError::NoSuchTool(name)) => {
            if let Some(corrected) = same_tool_elsewhere(registry, &name) {
                tracing::info!(from = %name, to = %corrected, "Rerouting tool call to matching server");
                let retry = RawToolCall {
                    name: corrected,
                    ..call.clone()
                };
                return match parse_tool_call(registry, &retry) {
                    Err(ToolCallError::InvalidArguments { tool, error }) => {
                        Ok(invalid_arguments_call(call, &tool, &error))
                    }
                    other => other,
                };
            }
            tracing::warn!(tool = %name, "Model called a tool that does not exist");
            Ok(no_such_tool_call(registry, call))
        }
        Err(ToolCallError::InvalidArguments { tool, error }) => {
            tracing::warn!(tool = %tool, "Invalid tool arguments: {error}");
            Ok(invalid_arguments_call(call, &tool, &error))
        }
        other => other,
    }
}

/// Id of a registered tool with the same bare name under another server.
fn same_tool_elsewhere(registry: &ToolRegistry, name: &str) -> Option<String> {
    let bare = split_tool_id(name).map_or(name, |(_, tool)| tool);
    registry
        .find_by_tool_name(bare)
        .find(|tool| tool.server_name != HELPERS_SERVER && tool.id != name)
        .map(|tool| tool.id.clone())
}

fn no_such_tool_call(registry: &ToolRegistry, call: &RawToolCall) -> ParsedToolCall {
    let available: Vec<&str> = registry
        .iter()
        .filter(|tool| tool.server_name != HELPERS_SERVER)
        .map(|tool| tool.id.as_str())
        .collect();
    helper_call(
        call,
        NO_SUCH_TOOL,
        json!({"toolName": call.name, "availableTools": available}),
    )
}

fn invalid_arguments_call(call: &RawToolCall, tool: &str, error: &str) -> ParsedToolCall {
    helper_call(
        call,
        INVALID_TOOL_ARGUMENTS,
        json!({"toolName": tool, "toolArgs": call.input, "error": error}),
    )
}

fn helper_call(call: &RawToolCall, helper: &str, arguments: Value) -> ParsedToolCall {
    ParsedToolCall {
        id: call.id.clone(),
        tool_id: tool_id(HELPERS_SERVER, helper),
        server_name: HELPERS_SERVER.to_string(),
        tool_name: helper.to_string(),
        arguments,
    }
}

fn unrepairable(call: &RawToolCall, error: &ToolCallError) -> ToolCallError {
    match error {
        ToolCallError::Unrepairable { .. } => error.clone(),
        _ => ToolCallError::Unrepairable {
            tool: call.name.clone(),
            error: error.to_string(),
        },
    }
}
