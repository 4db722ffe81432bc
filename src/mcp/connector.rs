//! A live connection to one MCP server together with its resolved tool list.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;

use super::config::{McpServerConfig, McpTimeouts, McpTransportConfig};
use super::transport::{McpTransport, SseTransport, StdioTransport, StreamableHttpTransport};
use super::{McpError, McpTool, PROTOCOL_VERSION};

#[cfg(unix)]
const INHERITED_ENV: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];
#[cfg(windows)]
const INHERITED_ENV: &[&str] = &[
    "APPDATA",
    "HOMEDRIVE",
    "HOMEPATH",
    "LOCALAPPDATA",
    "PATH",
    "PROCESSOR_ARCHITECTURE",
    "SYSTEMDRIVE",
    "SYSTEMROOT",
    "TEMP",
    "USERNAME",
    "USERPROFILE",
];
#[cfg(not(any(unix, windows)))]
const INHERITED_ENV: &[&str] = &["HOME", "PATH"];

// === McpConnector ===

/// Handle to an initialized MCP server. Owned by the pool through an `Arc`.
pub struct McpConnector {
    name: String,
    config: McpServerConfig,
    tools: Vec<McpTool>,
    transport: Arc<dyn McpTransport>,
    execute_timeout: u64,
    closed: AtomicBool,
}

impl McpConnector {
    pub fn new(
        name: impl Into<String>,
        config: McpServerConfig,
        tools: Vec<McpTool>,
        transport: Arc<dyn McpTransport>,
        execute_timeout: u64,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            tools,
            transport,
            execute_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Server name (config key).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The interpolated config this connector was created from.
    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    pub fn tools(&self) -> &[McpTool] {
        &self.tools
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Invoke `tools/call` and return the raw result object.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value, McpError> {
        if self.is_closed() {
            return Err(McpError::Disconnected);
        }
        with_timeout(
            "tools/call",
            self.execute_timeout,
            self.transport.request(
                "tools/call",
                json!({
                    "name": tool_name,
                    "arguments": arguments
                }),
            ),
        )
        .await
    }

    /// Close the underlying transport. Later calls are no-ops.
    pub async fn close(&self) -> Result<(), McpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(server = %self.name, "Closing MCP connector");
        self.transport.close().await
    }
}

impl std::fmt::Debug for McpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpConnector")
            .field("name", &self.name)
            .field("tools", &self.tools.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// === Factory ===

/// Creates connectors for the pool; swapped out in tests.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    /// Connect to `name` using an already-interpolated config.
    async fn create(
        &self,
        name: &str,
        config: &McpServerConfig,
        project_dir: Option<&str>,
        task_dir: Option<&str>,
    ) -> Result<McpConnector>;
}

/// Connects over the transport the config selects.
#[derive(Debug, Clone, Default)]
pub struct DefaultConnectorFactory {
    timeouts: McpTimeouts,
}

impl DefaultConnectorFactory {
    pub fn new(timeouts: McpTimeouts) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl ConnectorFactory for DefaultConnectorFactory {
    async fn create(
        &self,
        name: &str,
        config: &McpServerConfig,
        project_dir: Option<&str>,
        task_dir: Option<&str>,
    ) -> Result<McpConnector> {
        let connect_timeout = config.effective_connect_timeout(&self.timeouts);

        let transport: Arc<dyn McpTransport> = match &config.transport {
            McpTransportConfig::Local { command, args, env } => {
                let working_dir = task_dir.or(project_dir);
                let cmd = build_local_command(command, args, env, working_dir);
                let transport: Arc<dyn McpTransport> = Arc::new(StdioTransport::spawn(name, cmd)?);
                handshake(transport.as_ref(), connect_timeout)
                    .await
                    .with_context(|| format!("MCP server '{name}' failed to initialize"))?;
                transport
            }
            McpTransportConfig::Remote { url, headers } => {
                connect_remote(name, url, headers, connect_timeout).await?
            }
        };

        let tools = match with_timeout(
            "tools/list",
            self.timeouts.list_tools_timeout,
            list_tools(transport.as_ref(), name),
        )
        .await
        {
            Ok(tools) => tools,
            Err(err) => {
                let _ = transport.close().await;
                return Err(err).with_context(|| format!("Failed to list tools for '{name}'"));
            }
        };

        tracing::info!(server = %name, tools = tools.len(), "MCP server connected");
        Ok(McpConnector::new(
            name,
            config.clone(),
            tools,
            transport,
            config.effective_execute_timeout(&self.timeouts),
        ))
    }
}

/// Streamable HTTP first; SSE when the server does not speak it.
async fn connect_remote(
    name: &str,
    url: &str,
    headers: &HashMap<String, String>,
    connect_timeout: u64,
) -> Result<Arc<dyn McpTransport>> {
    let streamable: Arc<dyn McpTransport> = Arc::new(StreamableHttpTransport::new(url, headers)?);
    match handshake(streamable.as_ref(), connect_timeout).await {
        Ok(()) => return Ok(streamable),
        Err(err) => {
            tracing::debug!(server = %name, "Streamable HTTP failed ({err}); falling back to SSE");
            let _ = streamable.close().await;
        }
    }

    let sse = with_timeout("connect", connect_timeout, SseTransport::connect(url, headers))
        .await
        .with_context(|| format!("Failed to connect to MCP server '{name}' at {url}"))?;
    let sse: Arc<dyn McpTransport> = Arc::new(sse);
    handshake(sse.as_ref(), connect_timeout)
        .await
        .with_context(|| format!("MCP server '{name}' failed to initialize over SSE"))?;
    Ok(sse)
}

/// `initialize` followed by the `notifications/initialized` notification.
pub async fn handshake(transport: &dyn McpTransport, timeout_secs: u64) -> Result<(), McpError> {
    with_timeout(
        "initialize",
        timeout_secs,
        transport.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "desk-agent",
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        ),
    )
    .await?;
    transport
        .notify("notifications/initialized", json!({}))
        .await
}

/// Fetch every page of `tools/list` and tag each tool with its server.
pub async fn list_tools(transport: &dyn McpTransport, server: &str) -> Result<Vec<McpTool>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let params = match &cursor {
            Some(cursor) => json!({ "cursor": cursor }),
            None => json!({}),
        };
        let result = transport.request("tools/list", params).await?;
        let page: Vec<McpTool> =
            serde_json::from_value(result.get("tools").cloned().unwrap_or_else(|| json!([])))?;
        tools.extend(page.into_iter().map(|mut tool| {
            tool.server_name = server.to_string();
            tool
        }));

        cursor = result
            .get("nextCursor")
            .and_then(Value::as_str)
            .map(String::from);
        if cursor.is_none() {
            break;
        }
    }
    Ok(tools)
}

async fn with_timeout<T>(
    method: &str,
    seconds: u64,
    fut: impl Future<Output = Result<T, McpError>>,
) -> Result<T, McpError> {
    tokio::time::timeout(Duration::from_secs(seconds), fut)
        .await
        .map_err(|_| McpError::Timeout {
            method: method.to_string(),
            seconds,
        })?
}

// === Local process setup ===

/// Rewrite a local invocation for the host platform.
///
/// `npx` goes through `cmd.exe /c` on Windows; `docker run` and
/// `docker container run` get `--init` so signals reach the server.
pub fn prepare_invocation(command: &str, args: &[String], windows: bool) -> (String, Vec<String>) {
    let mut command = command.to_string();
    let mut args = args.to_vec();

    if windows && (command == "npx" || command == "npx.cmd") {
        args.insert(0, command);
        args.insert(0, "/c".to_string());
        command = "cmd.exe".to_string();
    }

    let program = Path::new(&command)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    if program == "docker" && !args.iter().any(|a| a == "--init") {
        let run_index = match (args.first().map(String::as_str), args.get(1).map(String::as_str)) {
            (Some("run"), _) => Some(1),
            (Some("container"), Some("run")) => Some(2),
            _ => None,
        };
        if let Some(index) = run_index {
            args.insert(index, "--init".to_string());
        }
    }

    (command, args)
}

/// Config env plus the host variables a server needs to start, config winning.
pub fn merged_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut merged = env.clone();
    for key in INHERITED_ENV {
        if !merged.contains_key(*key)
            && let Ok(value) = std::env::var(key)
        {
            merged.insert((*key).to_string(), value);
        }
    }
    merged
}

fn build_local_command(
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
    working_dir: Option<&str>,
) -> Command {
    let (program, args) = prepare_invocation(command, args, cfg!(windows));
    let mut cmd = Command::new(program);
    cmd.args(args).env_clear().envs(merged_env(env));
    if let Some(dir) = working_dir
        && Path::new(dir).is_dir()
    {
        cmd.current_dir(dir);
    }
    cmd
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_prepare_invocation_npx_on_windows() {
        let (cmd, args) = prepare_invocation("npx", &strings(&["-y", "pkg"]), true);
        assert_eq!(cmd, "cmd.exe");
        assert_eq!(args, strings(&["/c", "npx", "-y", "pkg"]));

        let (cmd, args) = prepare_invocation("npx", &strings(&["-y", "pkg"]), false);
        assert_eq!(cmd, "npx");
        assert_eq!(args, strings(&["-y", "pkg"]));
    }

    #[test]
    fn test_prepare_invocation_docker_run_gets_init() {
        let (_, args) = prepare_invocation("docker", &strings(&["run", "-i", "img"]), false);
        assert_eq!(args, strings(&["run", "--init", "-i", "img"]));

        let (_, args) =
            prepare_invocation("docker", &strings(&["container", "run", "img"]), false);
        assert_eq!(args, strings(&["container", "run", "--init", "img"]));

        let (_, args) = prepare_invocation("docker", &strings(&["run", "--init", "img"]), false);
        assert_eq!(args, strings(&["run", "--init", "img"]));

        let (_, args) = prepare_invocation("docker", &strings(&["ps"]), false);
        assert_eq!(args, strings(&["ps"]));
    }

    #[test]
    fn test_merged_env_keeps_config_values() {
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/custom/bin".to_string());
        env.insert("TOKEN".to_string(), "x".to_string());
        let merged = merged_env(&env);
        assert_eq!(merged.get("PATH"), Some(&"/custom/bin".to_string()));
        assert_eq!(merged.get("TOKEN"), Some(&"x".to_string()));
    }

    struct PagedTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl McpTransport for PagedTransport {
        async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
            assert_eq!(method, "tools/list");
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                assert!(params.get("cursor").is_none());
                Ok(json!({"tools": [{"name": "a"}], "nextCursor": "p2"}))
            } else {
                assert_eq!(params["cursor"], "p2");
                Ok(json!({"tools": [{"name": "b", "description": "B"}]}))
            }
        }

        async fn notify(&self, _method: &str, _params: Value) -> Result<(), McpError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), McpError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor_and_tags_server() {
        let transport = PagedTransport {
            calls: AtomicUsize::new(0),
        };
        let tools = list_tools(&transport, "files").await.unwrap();
        assert_eq!(tools.len(), 2);
        assert!(tools.iter().all(|t| t.server_name == "files"));
        assert_eq!(tools[1].description.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_connector_close_is_idempotent() {
        let connector = McpConnector::new(
            "files",
            McpServerConfig::local("node", Vec::new()),
            Vec::new(),
            Arc::new(PagedTransport {
                calls: AtomicUsize::new(0),
            }),
            5,
        );
        connector.close().await.unwrap();
        connector.close().await.unwrap();
        assert!(connector.is_closed());
        assert!(matches!(
            connector.call_tool("a", json!({})).await,
            Err(McpError::Disconnected)
        ));
    }
}
