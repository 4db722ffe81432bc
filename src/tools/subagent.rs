//! Sub-agent delegation.
//!
//! `run_task` hands a self-contained prompt to a nested agent run that uses a
//! configured profile (or the caller's own) with sub-agents disabled, and
//! returns the nested run's final answer as the tool result.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::spec::{ToolContext, ToolError, ToolResult, ToolSpec, optional_str, required_str};

/// Runs nested agent tasks on behalf of the `run_task` tool.
#[async_trait]
pub trait SubagentRunner: Send + Sync {
    /// Ids of profiles that may be used as sub-agents.
    fn profile_ids(&self) -> Vec<String>;

    /// Run `prompt` to completion and return the final assistant text.
    async fn run_task(
        &self,
        profile_id: Option<&str>,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<String>;
}

pub struct RunTaskTool {
    runner: Arc<dyn SubagentRunner>,
}

impl RunTaskTool {
    pub fn new(runner: Arc<dyn SubagentRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ToolSpec for RunTaskTool {
    fn name(&self) -> &'static str {
        "run_task"
    }

    fn description(&self) -> &'static str {
        "Delegate a self-contained task to a sub-agent and return its final answer. \
         The sub-agent does not see this conversation, so include every detail it needs."
    }

    fn input_schema(&self) -> Value {
        let profiles = self.runner.profile_ids();
        let mut profile = json!({
            "type": "string",
            "description": "Sub-agent profile id (default: the current profile)"
        });
        if !profiles.is_empty() {
            profile["enum"] = json!(profiles);
        }
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "The task for the sub-agent"},
                "profile": profile
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let prompt = required_str(&input, "prompt")?;
        let profile = optional_str(&input, "profile");

        tracing::info!(profile = profile.unwrap_or("<current>"), "Starting sub-agent task");
        match self
            .runner
            .run_task(profile, prompt, context.cancel.child_token())
            .await
        {
            Ok(answer) if answer.trim().is_empty() => {
                Ok(ToolResult::success("Sub-agent finished without a text answer."))
            }
            Ok(answer) => Ok(ToolResult::success(answer)),
            Err(_) if context.cancel.is_cancelled() => Err(ToolError::Cancelled),
            Err(err) => Err(ToolError::execution_failed(format!("Sub-agent failed: {err:#}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<(Option<String>, String)>>,
    }

    #[async_trait]
    impl SubagentRunner for RecordingRunner {
        fn profile_ids(&self) -> Vec<String> {
            vec!["reviewer".to_string()]
        }

        async fn run_task(
            &self,
            profile_id: Option<&str>,
            prompt: &str,
            _cancel: CancellationToken,
        ) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((profile_id.map(String::from), prompt.to_string()));
            if prompt == "explode" {
                anyhow::bail!("no such profile");
            }
            Ok(format!("done: {prompt}"))
        }
    }

    #[tokio::test]
    async fn test_run_task_forwards_profile_and_prompt() {
        let runner = Arc::new(RecordingRunner::default());
        let tool = RunTaskTool::new(runner.clone());
        assert_eq!(tool.input_schema()["properties"]["profile"]["enum"], json!(["reviewer"]));

        let result = tool
            .execute(json!({"prompt": "review diff", "profile": "reviewer"}), &ToolContext::new("."))
            .await
            .unwrap();
        assert_eq!(result.content, "done: review diff");
        assert_eq!(
            runner.calls.lock().unwrap()[0],
            (Some("reviewer".to_string()), "review diff".to_string())
        );
    }

    #[tokio::test]
    async fn test_run_task_error_is_reported() {
        let tool = RunTaskTool::new(Arc::new(RecordingRunner::default()));
        let err = tool
            .execute(json!({"prompt": "explode"}), &ToolContext::new("."))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Sub-agent failed: no such profile"));
    }
}
