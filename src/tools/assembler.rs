//! Builds the tool set offered to the model for one run.
//!
//! MCP tools come first, in connector order, followed by the built-in
//! families the profile enables: power, aider, todo, subagents and finally
//! the always-present helpers the tool-call parser reroutes to.

use std::sync::Arc;

use crate::core::context::TaskContext;
use crate::mcp::McpConnector;
use crate::profile::{AgentProfile, ToolApprovalState};

use super::context::{AddContextFilesTool, DropContextFilesTool, GetContextFilesTool, RunPromptTool};
use super::file::{FileEditTool, FileReadTool, FileWriteTool};
use super::helpers::{HELPERS_SERVER, InvalidToolArgumentsTool, NoSuchToolTool};
use super::mcp_tool::McpToolAdapter;
use super::registry::{RegisteredTool, ToolRegistry, tool_id};
use super::schema::{JsonSchemaConverter, SchemaAdapter, SchemaConverter, schema_adapter_for};
use super::search::{GlobTool, GrepTool, SemanticSearchTool};
use super::shell::BashTool;
use super::spec::ToolSpec;
use super::subagent::{RunTaskTool, SubagentRunner};
use super::todo::{
    ClearItemsTool, GetItemsTool, SetItemsTool, SharedTodoStore, UpdateItemCompletionTool,
};

pub const POWER_SERVER: &str = "power";
pub const AIDER_SERVER: &str = "aider";
pub const TODO_SERVER: &str = "todo";
pub const SUBAGENTS_SERVER: &str = "subagents";

/// Collaborators the built-in families need. A family whose collaborator is
/// missing is left out even when the profile enables it.
#[derive(Clone, Default)]
pub struct BuiltinTools {
    pub task: Option<Arc<dyn TaskContext>>,
    pub todos: Option<SharedTodoStore>,
    pub subagents: Option<Arc<dyn SubagentRunner>>,
}

pub struct ToolAssembler {
    converter: Arc<dyn SchemaConverter>,
    adapter: Box<dyn SchemaAdapter>,
}

impl ToolAssembler {
    pub fn new(converter: Arc<dyn SchemaConverter>, adapter: Box<dyn SchemaAdapter>) -> Self {
        Self { converter, adapter }
    }

    /// `jsonschema`-backed conversion with the provider's schema adapter.
    pub fn for_provider(provider: &str) -> Self {
        Self::new(Arc::new(JsonSchemaConverter), schema_adapter_for(provider))
    }

    pub fn assemble(
        &self,
        profile: &AgentProfile,
        connectors: &[Arc<McpConnector>],
        builtins: &BuiltinTools,
    ) -> ToolRegistry {
        let mut registry = ToolRegistry::new();

        for connector in connectors {
            if !profile.is_server_enabled(connector.name()) {
                continue;
            }
            for tool in connector.tools() {
                let adapter = McpToolAdapter::new(connector.clone(), tool.clone());
                self.add(&mut registry, profile, connector.name(), Arc::new(adapter));
            }
        }

        if profile.use_power_tools {
            let power: [Arc<dyn ToolSpec>; 7] = [
                Arc::new(FileReadTool),
                Arc::new(FileWriteTool),
                Arc::new(FileEditTool),
                Arc::new(GlobTool),
                Arc::new(GrepTool),
                Arc::new(BashTool),
                Arc::new(SemanticSearchTool),
            ];
            for tool in power {
                self.add(&mut registry, profile, POWER_SERVER, tool);
            }
        }

        if profile.use_aider_tools
            && let Some(task) = &builtins.task
        {
            let aider: [Arc<dyn ToolSpec>; 4] = [
                Arc::new(AddContextFilesTool::new(task.clone())),
                Arc::new(DropContextFilesTool::new(task.clone())),
                Arc::new(GetContextFilesTool::new(task.clone())),
                Arc::new(RunPromptTool::new(task.clone())),
            ];
            for tool in aider {
                self.add(&mut registry, profile, AIDER_SERVER, tool);
            }
        }

        if profile.use_todo_tools
            && let Some(store) = &builtins.todos
        {
            let todo: [Arc<dyn ToolSpec>; 4] = [
                Arc::new(SetItemsTool::new(store.clone())),
                Arc::new(GetItemsTool::new(store.clone())),
                Arc::new(UpdateItemCompletionTool::new(store.clone())),
                Arc::new(ClearItemsTool::new(store.clone())),
            ];
            for tool in todo {
                self.add(&mut registry, profile, TODO_SERVER, tool);
            }
        }

        if profile.use_subagents
            && let Some(runner) = &builtins.subagents
        {
            self.add(
                &mut registry,
                profile,
                SUBAGENTS_SERVER,
                Arc::new(RunTaskTool::new(runner.clone())),
            );
        }

        // Helpers ignore the approval map: the parser must always be able to reroute.
        for tool in [
            Arc::new(NoSuchToolTool) as Arc<dyn ToolSpec>,
            Arc::new(InvalidToolArgumentsTool),
        ] {
            self.register(&mut registry, HELPERS_SERVER, tool);
        }

        tracing::debug!(tools = registry.len(), "Assembled tool set");
        registry
    }

    fn add(
        &self,
        registry: &mut ToolRegistry,
        profile: &AgentProfile,
        server: &str,
        tool: Arc<dyn ToolSpec>,
    ) {
        let id = tool_id(server, tool.name());
        if profile.approval_for(&id) == ToolApprovalState::Never {
            tracing::debug!(tool = %id, "Tool disabled by profile");
            return;
        }
        self.register(registry, server, tool);
    }

    fn register(&self, registry: &mut ToolRegistry, server: &str, tool: Arc<dyn ToolSpec>) {
        let id = tool_id(server, tool.name());
        let raw_schema = tool.input_schema();
        let schema = self.converter.convert_or_empty(&id, &raw_schema);
        let parameters = self.adapter.adapt(schema.as_json().clone());
        registry.register(RegisteredTool {
            server_name: server.to_string(),
            tool_name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters,
            schema,
            tool,
            id,
        });
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::mcp::transport::McpTransport;
    use crate::mcp::{McpError, McpServerConfig, McpTool};

    struct NullTransport;

    #[async_trait]
    impl McpTransport for NullTransport {
        async fn request(&self, _method: &str, _params: Value) -> Result<Value, McpError> {
            Ok(json!({"content": []}))
        }

        async fn notify(&self, _method: &str, _params: Value) -> Result<(), McpError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), McpError> {
            Ok(())
        }
    }

    fn connector(server: &str, tools: &[(&str, Value)]) -> Arc<McpConnector> {
        let tools = tools
            .iter()
            .map(|(name, schema)| McpTool {
                name: (*name).to_string(),
                description: None,
                input_schema: schema.clone(),
                server_name: server.to_string(),
            })
            .collect();
        Arc::new(McpConnector::new(
            server,
            McpServerConfig::local("node", Vec::new()),
            tools,
            Arc::new(NullTransport),
            5,
        ))
    }

    fn bare_profile() -> AgentProfile {
        AgentProfile {
            use_power_tools: false,
            use_todo_tools: false,
            ..AgentProfile::default()
        }
    }

    #[test]
    fn test_only_enabled_servers_are_offered() {
        let profile = AgentProfile {
            enabled_servers: vec!["fs".to_string()],
            ..bare_profile()
        };
        let connectors = [
            connector("fs", &[("read", json!({"type": "object"}))]),
            connector("web", &[("fetch", json!({"type": "object"}))]),
        ];
        let registry = ToolAssembler::for_provider("anthropic").assemble(
            &profile,
            &connectors,
            &BuiltinTools::default(),
        );
        assert_eq!(
            registry.ids(),
            vec!["fs---read", "helpers---no_such_tool", "helpers---invalid_tool_arguments"]
        );
    }

    #[test]
    fn test_never_tools_are_excluded() {
        let mut profile = AgentProfile {
            enabled_servers: vec!["fs".to_string()],
            ..AgentProfile::default()
        };
        profile
            .tool_approvals
            .insert("fs---delete".to_string(), ToolApprovalState::Never);
        profile
            .tool_approvals
            .insert("power---bash".to_string(), ToolApprovalState::Never);
        let connectors = [connector(
            "fs",
            &[("read", json!({})), ("delete", json!({}))],
        )];

        let registry = ToolAssembler::for_provider("anthropic").assemble(
            &profile,
            &connectors,
            &BuiltinTools::default(),
        );
        assert!(registry.contains("fs---read"));
        assert!(!registry.contains("fs---delete"));
        assert!(!registry.contains("power---bash"));
        assert!(registry.contains("power---file_read"));
    }

    #[test]
    fn test_bad_schema_falls_back_to_empty_object() {
        let profile = AgentProfile {
            enabled_servers: vec!["fs".to_string()],
            ..bare_profile()
        };
        let connectors = [connector("fs", &[("odd", json!("not a schema"))])];
        let registry = ToolAssembler::for_provider("anthropic").assemble(
            &profile,
            &connectors,
            &BuiltinTools::default(),
        );
        let tool = registry.get("fs---odd").unwrap();
        assert_eq!(tool.parameters, json!({"type": "object", "properties": {}}));
    }

    #[test]
    fn test_gemini_gets_placeholder_property() {
        let profile = AgentProfile {
            enabled_servers: vec!["fs".to_string()],
            ..bare_profile()
        };
        let connectors = [connector("fs", &[("list", json!({"type": "object"}))])];
        let registry = ToolAssembler::for_provider("gemini").assemble(
            &profile,
            &connectors,
            &BuiltinTools::default(),
        );
        let tool = registry.get("fs---list").unwrap();
        assert!(tool.parameters["properties"].get("_placeholder").is_some());
        assert!(tool.schema.as_json()["properties"].get("_placeholder").is_none());
    }

    #[test]
    fn test_families_need_collaborators() {
        let profile = AgentProfile {
            use_aider_tools: true,
            use_todo_tools: true,
            use_subagents: true,
            ..bare_profile()
        };
        let registry =
            ToolAssembler::for_provider("anthropic").assemble(&profile, &[], &BuiltinTools::default());
        assert_eq!(registry.len(), 2);

        let tmp = tempfile::tempdir().unwrap();
        let builtins = BuiltinTools {
            task: Some(Arc::new(crate::core::context::LocalTaskContext::new(tmp.path()))),
            todos: Some(Arc::new(crate::tools::todo::TodoStore::for_task(tmp.path()))),
            subagents: None,
        };
        let registry = ToolAssembler::for_provider("anthropic").assemble(&profile, &[], &builtins);
        assert!(registry.contains("aider---run_prompt"));
        assert!(registry.contains("todo---set_items"));
        assert!(!registry.contains("subagents---run_task"));
    }
}
