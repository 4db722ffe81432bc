//! `bash` power tool: run a shell command in the task directory.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;

use super::spec::{ToolContext, ToolError, ToolResult, ToolSpec, optional_str, optional_u64, required_str};

/// Maximum output size before truncation
const MAX_OUTPUT_SIZE: usize = 30_000;

const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const MAX_TIMEOUT_MS: u64 = 600_000;

/// Truncate output to `MAX_OUTPUT_SIZE`, respecting char boundaries.
fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_OUTPUT_SIZE {
        return output.to_string();
    }
    let mut end = MAX_OUTPUT_SIZE;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}...\n\n[Output truncated at {} characters. {} characters omitted.]",
        &output[..end],
        end,
        output.len() - end
    )
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Tool for executing shell commands.
pub struct BashTool;

#[async_trait]
impl ToolSpec for BashTool {
    fn name(&self) -> &'static str {
        "bash"
    }

    fn description(&self) -> &'static str {
        "Execute a shell command in the project directory. Returns stdout, stderr, and exit code."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory relative to the project (default: .)"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Timeout in milliseconds (default: 120000, max: 600000)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let command = required_str(&input, "command")?;
        let cwd = context.resolve_path(optional_str(&input, "cwd").unwrap_or("."))?;
        let timeout_ms = optional_u64(&input, "timeout_ms", DEFAULT_TIMEOUT_MS).clamp(1000, MAX_TIMEOUT_MS);

        let mut cmd = shell_command(command);
        cmd.current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| ToolError::execution_failed(format!("Failed to spawn shell: {e}")))?;

        tracing::debug!(%command, cwd = %cwd.display(), "Running bash tool");
        let output = tokio::select! {
            () = context.cancel.cancelled() => return Err(ToolError::Cancelled),
            result = tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait_with_output()) => {
                match result {
                    Ok(output) => output.map_err(|e| ToolError::execution_failed(e.to_string()))?,
                    Err(_) => return Err(ToolError::Timeout { seconds: timeout_ms / 1000 }),
                }
            }
        };

        let stdout = truncate_output(&String::from_utf8_lossy(&output.stdout));
        let stderr = truncate_output(&String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code();

        let mut text = if stdout.is_empty() && stderr.is_empty() {
            "(no output)".to_string()
        } else if stderr.is_empty() {
            stdout
        } else {
            format!("{stdout}\n\nSTDERR:\n{stderr}")
        };

        if output.status.success() {
            Ok(ToolResult::success(text))
        } else {
            text.push_str(&format!(
                "\n\nExit code: {}",
                exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string())
            ));
            Ok(ToolResult::error(text))
        }
    }
}
