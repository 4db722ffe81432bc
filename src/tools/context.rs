//! VCS-integration tools over the task's context files:
//! `add_context_files`, `drop_context_files`, `get_context_files`, `run_prompt`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::core::context::TaskContext;

use super::spec::{
    ToolContext, ToolError, ToolResult, ToolSpec, optional_bool, required_str, required_str_array,
};

pub struct AddContextFilesTool {
    task: Arc<dyn TaskContext>,
}

impl AddContextFilesTool {
    pub fn new(task: Arc<dyn TaskContext>) -> Self {
        Self { task }
    }
}

#[async_trait]
impl ToolSpec for AddContextFilesTool {
    fn name(&self) -> &'static str {
        "add_context_files"
    }

    fn description(&self) -> &'static str {
        "Add files to the coding context so their contents are available to later prompts."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "paths": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Paths relative to the project"
                },
                "read_only": {
                    "type": "boolean",
                    "description": "Add as reference only (default: false)"
                }
            },
            "required": ["paths"]
        })
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let paths = required_str_array(&input, "paths")?;
        let read_only = optional_bool(&input, "read_only", false);

        let mut lines = Vec::with_capacity(paths.len());
        for path in &paths {
            let resolved = context.resolve_path(path)?;
            if !resolved.is_file() {
                lines.push(format!("{path}: not found"));
                continue;
            }
            let relative = context.display_path(&resolved);
            if self.task.add_context_file(&relative, read_only).await {
                lines.push(format!("{relative}: added"));
            } else {
                lines.push(format!("{relative}: already in context"));
            }
        }
        Ok(ToolResult::success(lines.join("\n")))
    }
}

pub struct DropContextFilesTool {
    task: Arc<dyn TaskContext>,
}

impl DropContextFilesTool {
    pub fn new(task: Arc<dyn TaskContext>) -> Self {
        Self { task }
    }
}

#[async_trait]
impl ToolSpec for DropContextFilesTool {
    fn name(&self) -> &'static str {
        "drop_context_files"
    }

    fn description(&self) -> &'static str {
        "Remove files from the coding context."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "paths": {
                    "type": "array",
                    "items": {"type": "string"}
                }
            },
            "required": ["paths"]
        })
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let paths = required_str_array(&input, "paths")?;
        let mut lines = Vec::with_capacity(paths.len());
        for path in &paths {
            let status = if self.task.drop_context_file(path).await {
                "dropped"
            } else {
                "not in context"
            };
            lines.push(format!("{path}: {status}"));
        }
        Ok(ToolResult::success(lines.join("\n")))
    }
}

pub struct GetContextFilesTool {
    task: Arc<dyn TaskContext>,
}

impl GetContextFilesTool {
    pub fn new(task: Arc<dyn TaskContext>) -> Self {
        Self { task }
    }
}

#[async_trait]
impl ToolSpec for GetContextFilesTool {
    fn name(&self) -> &'static str {
        "get_context_files"
    }

    fn description(&self) -> &'static str {
        "List the files currently in the coding context."
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let files = self.task.context_files().await;
        ToolResult::json(&files).map_err(|e| ToolError::execution_failed(e.to_string()))
    }
}

pub struct RunPromptTool {
    task: Arc<dyn TaskContext>,
}

impl RunPromptTool {
    pub fn new(task: Arc<dyn TaskContext>) -> Self {
        Self { task }
    }
}

#[async_trait]
impl ToolSpec for RunPromptTool {
    fn name(&self) -> &'static str {
        "run_prompt"
    }

    fn description(&self) -> &'static str {
        "Send a coding instruction to the task's coding backend, which edits the context files."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "Self-contained instruction for the code change"
                }
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let prompt = required_str(&input, "prompt")?;
        let response = tokio::select! {
            () = context.cancel.cancelled() => return Err(ToolError::Cancelled),
            response = self.task.run_prompt(prompt) => response,
        };
        match response {
            Ok(text) => Ok(ToolResult::success(text)),
            Err(err) => Err(ToolError::execution_failed(format!("{err:#}"))),
        }
    }
}
