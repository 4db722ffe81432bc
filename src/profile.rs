//! Agent profiles: model choice, tool permissions and run parameters.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Per-tool approval policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolApprovalState {
    /// Run without asking.
    Always,
    /// Never offered to the model.
    Never,
    /// Ask the user before each call.
    #[default]
    Ask,
}

/// A named bundle of model choice, tool permissions and run parameters.
///
/// Loaded fresh for every run and never mutated while a run is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub model: String,
    /// MCP servers whose tools are offered.
    pub enabled_servers: Vec<String>,
    /// `server---tool` id to approval state. Missing entries mean `Ask`.
    pub tool_approvals: HashMap<String, ToolApprovalState>,
    pub use_power_tools: bool,
    pub use_aider_tools: bool,
    pub use_todo_tools: bool,
    pub use_subagents: bool,
    pub include_context_files: bool,
    pub include_repo_map: bool,
    pub max_iterations: u32,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Minimum spacing between tool calls, in milliseconds.
    pub min_time_between_tool_calls: u64,
    /// Extra text appended to the system prompt.
    pub custom_instructions: Option<String>,
    /// Allow tools to touch paths outside the task directory.
    pub trust_mode: bool,
}

pub const DEFAULT_PROFILE_ID: &str = "default";
pub const DEFAULT_PROVIDER: &str = "anthropic";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            id: DEFAULT_PROFILE_ID.to_string(),
            name: "Default".to_string(),
            provider: DEFAULT_PROVIDER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            enabled_servers: Vec::new(),
            tool_approvals: HashMap::new(),
            use_power_tools: true,
            use_aider_tools: false,
            use_todo_tools: true,
            use_subagents: false,
            include_context_files: false,
            include_repo_map: false,
            max_iterations: 50,
            max_tokens: 8192,
            temperature: 0.0,
            min_time_between_tool_calls: 0,
            custom_instructions: None,
            trust_mode: false,
        }
    }
}

impl AgentProfile {
    /// Approval state for a tool id, `Ask` when unlisted.
    pub fn approval_for(&self, tool_id: &str) -> ToolApprovalState {
        self.tool_approvals
            .get(tool_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_server_enabled(&self, server: &str) -> bool {
        self.enabled_servers.iter().any(|s| s == server)
    }

    /// Copy used for nested sub-agent runs, which may not spawn further sub-agents.
    #[must_use]
    pub fn for_subagent(&self) -> Self {
        Self {
            use_subagents: false,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_defaults_from_partial_toml() {
        let profile: AgentProfile = toml::from_str(
            r#"
            model = "claude-haiku-4-5"
            enabled_servers = ["fs"]
            max_iterations = 5

            [tool_approvals]
            "fs---write" = "never"
            "fs---read" = "always"
            "#,
        )
        .unwrap();

        assert_eq!(profile.model, "claude-haiku-4-5");
        assert_eq!(profile.provider, DEFAULT_PROVIDER);
        assert_eq!(profile.max_iterations, 5);
        assert!(profile.is_server_enabled("fs"));
        assert_eq!(profile.approval_for("fs---write"), ToolApprovalState::Never);
        assert_eq!(profile.approval_for("fs---read"), ToolApprovalState::Always);
        assert_eq!(profile.approval_for("fs---list"), ToolApprovalState::Ask);
    }

    #[test]
    fn test_for_subagent_disables_nesting() {
        let profile = AgentProfile {
            use_subagents: true,
            ..AgentProfile::default()
        };
        assert!(!profile.for_subagent().use_subagents);
    }
}
