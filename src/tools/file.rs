//! File system power tools: `file_read`, `file_write`, `file_edit`
//!
//! Paths are resolved against the task directory and may not escape it
//! unless the profile runs in trust mode.

use std::fs;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};

use super::spec::{
    ToolContext, ToolError, ToolResult, ToolSpec, optional_bool, optional_str, required_str,
};

// === FileReadTool ===

/// Tool for reading UTF-8 files from the workspace.
pub struct FileReadTool;

#[async_trait]
impl ToolSpec for FileReadTool {
    fn name(&self) -> &'static str {
        "file_read"
    }

    fn description(&self) -> &'static str {
        "Read a UTF-8 file from the project. Set with_lines to prefix each line with its number."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file (relative to the project or absolute)"
                },
                "with_lines": {
                    "type": "boolean",
                    "description": "Prefix lines with line numbers (default: false)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let path_str = required_str(&input, "path")?;
        let file_path = context.resolve_path(path_str)?;

        let contents = fs::read_to_string(&file_path).map_err(|e| {
            ToolError::execution_failed(format!("Failed to read {}: {}", file_path.display(), e))
        })?;

        if optional_bool(&input, "with_lines", false) {
            let numbered = contents
                .lines()
                .enumerate()
                .map(|(i, line)| format!("{:>6}|{}", i + 1, line))
                .collect::<Vec<_>>()
                .join("\n");
            return Ok(ToolResult::success(numbered));
        }
        Ok(ToolResult::success(contents))
    }
}

// === FileWriteTool ===

/// Tool for writing UTF-8 files to the workspace.
pub struct FileWriteTool;

#[async_trait]
impl ToolSpec for FileWriteTool {
    fn name(&self) -> &'static str {
        "file_write"
    }

    fn description(&self) -> &'static str {
        "Write content to a file. mode is create_only (fail if the file exists), overwrite or append."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write"
                },
                "mode": {
                    "type": "string",
                    "enum": ["create_only", "overwrite", "append"],
                    "description": "Write mode (default: create_only)"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let path_str = required_str(&input, "path")?;
        let file_content = required_str(&input, "content")?;
        let mode = optional_str(&input, "mode").unwrap_or("create_only");

        let file_path = context.resolve_path(path_str)?;

        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ToolError::execution_failed(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let write_result = match mode {
            "create_only" => {
                if file_path.exists() {
                    return Ok(ToolResult::error(format!(
                        "File {} already exists; use mode 'overwrite' or 'append'",
                        context.display_path(&file_path)
                    )));
                }
                fs::write(&file_path, file_content)
            }
            "overwrite" => fs::write(&file_path, file_content),
            "append" => {
                use std::io::Write;
                fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&file_path)
                    .and_then(|mut f| f.write_all(file_content.as_bytes()))
            }
            other => {
                return Err(ToolError::invalid_input(format!("Unknown write mode '{other}'")));
            }
        };
        write_result.map_err(|e| {
            ToolError::execution_failed(format!("Failed to write {}: {}", file_path.display(), e))
        })?;

        Ok(ToolResult::success(format!(
            "Wrote {} bytes to {}",
            file_content.len(),
            context.display_path(&file_path)
        )))
    }
}

// === FileEditTool ===

/// Tool for search/replace editing of files.
pub struct FileEditTool;

#[async_trait]
impl ToolSpec for FileEditTool {
    fn name(&self) -> &'static str {
        "file_edit"
    }

    fn description(&self) -> &'static str {
        "Replace text in a file. Replaces the first occurrence unless replace_all is set."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file"
                },
                "search": {
                    "type": "string",
                    "description": "Text (or regex when is_regex) to search for"
                },
                "replace": {
                    "type": "string",
                    "description": "Text to replace with"
                },
                "is_regex": {
                    "type": "boolean",
                    "description": "Treat search as a regular expression (default: false)"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default: false)"
                }
            },
            "required": ["path", "search", "replace"]
        })
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let path_str = required_str(&input, "path")?;
        let search = required_str(&input, "search")?;
        let replace = required_str(&input, "replace")?;
        let is_regex = optional_bool(&input, "is_regex", false);
        let replace_all = optional_bool(&input, "replace_all", false);

        let file_path = context.resolve_path(path_str)?;
        let contents = fs::read_to_string(&file_path).map_err(|e| {
            ToolError::execution_failed(format!("Failed to read {}: {}", file_path.display(), e))
        })?;

        let (updated, count) = if is_regex {
            let regex = Regex::new(search)
                .map_err(|e| ToolError::invalid_input(format!("Invalid regex pattern: {e}")))?;
            let count = regex.find_iter(&contents).count();
            let updated = if replace_all {
                regex.replace_all(&contents, replace).into_owned()
            } else {
                regex.replace(&contents, replace).into_owned()
            };
            (updated, if replace_all { count } else { count.min(1) })
        } else {
            let count = contents.matches(search).count();
            let updated = if replace_all {
                contents.replace(search, replace)
            } else {
                contents.replacen(search, replace, 1)
            };
            (updated, if replace_all { count } else { count.min(1) })
        };

        if count == 0 {
            return Err(ToolError::execution_failed(format!(
                "Search string not found in {}",
                context.display_path(&file_path)
            )));
        }

        fs::write(&file_path, &updated).map_err(|e| {
            ToolError::execution_failed(format!("Failed to write {}: {}", file_path.display(), e))
        })?;

        Ok(ToolResult::success(format!(
            "Replaced {} occurrence(s) in {}",
            count,
            context.display_path(&file_path)
        )))
    }
}

// === Unit Tests ===
