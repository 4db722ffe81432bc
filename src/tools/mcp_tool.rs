//! Adapter exposing one MCP server tool through `ToolSpec`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::mcp::{McpConnector, McpError, McpTool, format_tool_result};

use super::spec::{ToolContext, ToolError, ToolResult, ToolSpec};

pub struct McpToolAdapter {
    connector: Arc<McpConnector>,
    tool: McpTool,
}

impl McpToolAdapter {
    pub fn new(connector: Arc<McpConnector>, tool: McpTool) -> Self {
        Self { connector, tool }
    }

    pub fn server_name(&self) -> &str {
        self.connector.name()
    }
}

#[async_trait]
impl ToolSpec for McpToolAdapter {
    fn name(&self) -> &str {
        &self.tool.name
    }

    fn description(&self) -> &str {
        self.tool.description.as_deref().unwrap_or("")
    }

    fn input_schema(&self) -> Value {
        self.tool.input_schema.clone()
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let call = self.connector.call_tool(&self.tool.name, input);
        let result = tokio::select! {
            () = context.cancel.cancelled() => return Err(ToolError::Cancelled),
            result = call => result,
        };
        match result {
            Ok(value) => {
                let text = format_tool_result(&value);
                if value.get("isError").and_then(Value::as_bool) == Some(true) {
                    Ok(ToolResult::error(text))
                } else {
                    Ok(ToolResult::success(text))
                }
            }
            Err(McpError::Timeout { seconds, .. }) => Err(ToolError::Timeout { seconds }),
            Err(McpError::Disconnected) => Err(ToolError::not_available(format!(
                "MCP server '{}' is disconnected",
                self.connector.name()
            ))),
            Err(err) => Err(ToolError::execution_failed(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mcp::McpServerConfig;
    use crate::mcp::transport::McpTransport;

    struct ScriptedTransport;

    #[async_trait]
    impl McpTransport for ScriptedTransport {
        async fn request(&self, _method: &str, params: Value) -> Result<Value, McpError> {
            match params["name"].as_str() {
                Some("fail") => Ok(json!({"isError": true, "content": [{"type": "text", "text": "bad path"}]})),
                Some("gone") => Err(McpError::Disconnected),
                _ => Ok(json!({"content": [{"type": "text", "text": params["arguments"]["q"]}]})),
            }
        }

        async fn notify(&self, _method: &str, _params: Value) -> Result<(), McpError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), McpError> {
            Ok(())
        }
    }

    fn adapter(name: &str) -> McpToolAdapter {
        let tool = McpTool {
            name: name.to_string(),
            description: Some("scripted".to_string()),
            input_schema: json!({"type": "object"}),
            server_name: "docs".to_string(),
        };
        let connector = McpConnector::new(
            "docs",
            McpServerConfig::local("node", Vec::new()),
            vec![tool.clone()],
            Arc::new(ScriptedTransport),
            5,
        );
        McpToolAdapter::new(Arc::new(connector), tool)
    }

    #[tokio::test]
    async fn test_success_and_server_error() {
        let ctx = ToolContext::new(".");
        let ok = adapter("search").execute(json!({"q": "hi"}), &ctx).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.content, "hi");

        let failed = adapter("fail").execute(json!({}), &ctx).await.unwrap();
        assert!(!failed.success);
        assert_eq!(failed.content, "Error: bad path");
    }

    #[tokio::test]
    async fn test_disconnected_maps_to_not_available() {
        let err = adapter("gone")
            .execute(json!({}), &ToolContext::new("."))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotAvailable { .. }));
    }
}
