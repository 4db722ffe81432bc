//! Tool specification traits for the agent.
//!
//! - `ToolSpec`: the trait every callable tool implements (built-in or MCP-backed)
//! - `ToolContext`: per-run execution context passed to tools
//! - `ToolResult`: unified result of one execution
//! - `ToolError`: failures a tool body can report

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that can occur during tool execution.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Failed to validate input: {message}")]
    InvalidInput { message: String },

    #[error("Failed to validate input: missing required field '{field}'")]
    MissingField { field: String },

    #[error("Failed to resolve path '{path}': path escapes workspace")]
    PathEscape { path: PathBuf },

    #[error("Failed to execute tool: {message}")]
    ExecutionFailed { message: String },

    #[error("Failed to execute tool: operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Failed to locate tool: {message}")]
    NotAvailable { message: String },

    #[error("Tool execution cancelled")]
    Cancelled,
}

impl ToolError {
    #[must_use]
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: msg.into(),
        }
    }

    #[must_use]
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    #[must_use]
    pub fn execution_failed(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: msg.into(),
        }
    }

    #[must_use]
    pub fn not_available(msg: impl Into<String>) -> Self {
        Self::NotAvailable {
            message: msg.into(),
        }
    }
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The output content (may be JSON or plain text)
    pub content: String,
    /// Whether the execution was successful
    pub success: bool,
}

impl ToolResult {
    #[must_use]
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            success: false,
        }
    }

    /// Create a successful result from JSON.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            content: serde_json::to_string_pretty(value)?,
            success: true,
        })
    }
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Working directory of the task (project root or a worktree)
    pub workspace: PathBuf,
    /// Allow paths outside the workspace
    pub trust_mode: bool,
    /// Cancelled when the run is interrupted
    pub cancel: CancellationToken,
}

impl ToolContext {
    #[must_use]
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            trust_mode: false,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_trust_mode(mut self, trust: bool) -> Self {
        self.trust_mode = trust;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve a path relative to workspace, validating it doesn't escape.
    ///
    /// Paths that do not exist yet (write targets) are checked through their
    /// deepest existing ancestor.
    pub fn resolve_path(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let candidate = if Path::new(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            self.workspace.join(raw)
        };

        if self.trust_mode {
            return Ok(candidate.canonicalize().unwrap_or(candidate));
        }

        let workspace_canonical = self
            .workspace
            .canonicalize()
            .unwrap_or_else(|_| self.workspace.clone());

        if candidate.exists() {
            let canonical = candidate.canonicalize().map_err(|e| {
                ToolError::execution_failed(format!(
                    "Failed to canonicalize {}: {}",
                    candidate.display(),
                    e
                ))
            })?;
            if !canonical.starts_with(&workspace_canonical) {
                return Err(ToolError::PathEscape { path: canonical });
            }
            return Ok(canonical);
        }

        let mut existing_ancestor = candidate.clone();
        let mut suffix_parts: Vec<std::ffi::OsString> = Vec::new();
        while !existing_ancestor.exists() {
            if let Some(file_name) = existing_ancestor.file_name() {
                suffix_parts.push(file_name.to_owned());
            }
            match existing_ancestor.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => {
                    existing_ancestor = parent.to_path_buf();
                }
                _ => break,
            }
        }

        let mut canonical = existing_ancestor
            .canonicalize()
            .unwrap_or(existing_ancestor);
        for part in suffix_parts.into_iter().rev() {
            canonical.push(part);
        }

        if !canonical.starts_with(&workspace_canonical) {
            return Err(ToolError::PathEscape { path: canonical });
        }
        Ok(canonical)
    }

    /// Path relative to the workspace for display, falling back to the full path.
    pub fn display_path(&self, path: &Path) -> String {
        let root = self
            .workspace
            .canonicalize()
            .unwrap_or_else(|_| self.workspace.clone());
        path.strip_prefix(&root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

/// The core trait that all tools must implement.
#[async_trait]
pub trait ToolSpec: Send + Sync {
    /// Name of the tool within its family (the part after the separator).
    fn name(&self) -> &str;

    /// Returns a human-readable description of what this tool does.
    fn description(&self) -> &str;

    /// Returns the JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> Value;

    /// Execute the tool with the given input and context.
    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError>;
}

// === Helper functions for extracting values from JSON input ===

/// Helper to extract required string field from JSON input.
pub fn required_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    input
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::missing_field(field))
}

/// Helper to extract optional string field from JSON input.
pub fn optional_str<'a>(input: &'a Value, field: &str) -> Option<&'a str> {
    input.get(field).and_then(|v| v.as_str())
}

/// Helper to extract optional u64 field with default.
pub fn optional_u64(input: &Value, field: &str, default: u64) -> u64 {
    input
        .get(field)
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(default)
}

/// Helper to extract optional bool field with default.
pub fn optional_bool(input: &Value, field: &str, default: bool) -> bool {
    input
        .get(field)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(default)
}

/// Helper to extract a required array of strings.
pub fn required_str_array(input: &Value, field: &str) -> Result<Vec<String>, ToolError> {
    let items = input
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| ToolError::missing_field(field))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(String::from)
                .ok_or_else(|| ToolError::invalid_input(format!("'{field}' must contain strings")))
        })
        .collect()
}
