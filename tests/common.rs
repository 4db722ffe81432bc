//! Shared fixtures for the integration tests: a scripted model provider,
//! in-memory MCP servers and recording UIs.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use desk_agent::core::{AgentUi, ApprovalResponse, ApprovalUi, LogLevel, ResponseMessage, ToolMessage};
use desk_agent::llm_client::{FinishReason, LlmError, ModelEvent, ModelEventStream, ModelProvider, RawToolCall};
use desk_agent::mcp::transport::McpTransport;
use desk_agent::mcp::{ConnectorFactory, McpConnector, McpError, McpServerConfig, McpTool, ToolsCache};
use desk_agent::mcp::McpManager;
use desk_agent::models::{MessageRequest, Usage};

// === Model provider ===

/// Replays one scripted step per request; finishes with `Stop` once the
/// script runs out.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Result<Vec<ModelEvent>, LlmError>>>,
    pub requests: Mutex<Vec<MessageRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Result<Vec<ModelEvent>, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: MessageRequest, _cancel: CancellationToken) -> Result<ModelEventStream, LlmError> {
        self.requests.lock().unwrap().push(request);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(vec![finish(FinishReason::Stop)]));
        step.map(|events| Box::pin(stream::iter(events)) as ModelEventStream)
    }
}

pub fn finish(reason: FinishReason) -> ModelEvent {
    ModelEvent::Finish {
        reason,
        usage: Usage {
            input_tokens: 100,
            output_tokens: 20,
            ..Usage::default()
        },
    }
}

pub fn tool_call(id: &str, name: &str, args: Value) -> ModelEvent {
    ModelEvent::ToolCall(RawToolCall {
        id: id.to_string(),
        name: name.to_string(),
        input: args.to_string(),
    })
}

pub fn text(content: &str) -> ModelEvent {
    ModelEvent::TextDelta(content.to_string())
}

/// A step that calls one tool.
pub fn tool_step(id: &str, name: &str, args: Value) -> Result<Vec<ModelEvent>, LlmError> {
    Ok(vec![tool_call(id, name, args), finish(FinishReason::ToolCalls)])
}

/// A step that answers with `content` and stops.
pub fn answer_step(content: &str) -> Result<Vec<ModelEvent>, LlmError> {
    Ok(vec![text(content), finish(FinishReason::Stop)])
}

// === MCP ===

/// In-memory MCP server: answers `tools/call` by echoing the arguments.
#[derive(Default)]
pub struct EchoTransport {
    pub calls: Arc<Mutex<Vec<(String, Value)>>>,
    pub closes: Arc<AtomicUsize>,
}

#[async_trait]
impl McpTransport for EchoTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let name = params["name"].as_str().unwrap_or_default().to_string();
        self.calls.lock().unwrap().push((name.clone(), params["arguments"].clone()));
        match (method, name.as_str()) {
            ("tools/call", "fail") => Ok(json!({
                "isError": true,
                "content": [{"type": "text", "text": "boom"}]
            })),
            ("tools/call", _) => Ok(json!({
                "content": [{"type": "text", "text": format!("echo {}", params["arguments"])}]
            })),
            _ => Ok(json!({})),
        }
    }

    async fn notify(&self, _method: &str, _params: Value) -> Result<(), McpError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Builds `EchoTransport` connectors and counts what it was asked to do.
pub struct CountingFactory {
    pub creates: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    pub calls: Arc<Mutex<Vec<(String, Value)>>>,
    /// Interpolated configs handed to `create`, in order.
    pub seen: Mutex<Vec<McpServerConfig>>,
    tools: HashMap<String, Vec<&'static str>>,
    delay: Duration,
}

impl CountingFactory {
    pub fn new(tools: &[(&str, &[&'static str])]) -> Arc<Self> {
        Arc::new(Self {
            creates: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
            seen: Mutex::new(Vec::new()),
            tools: tools
                .iter()
                .map(|(server, names)| ((*server).to_string(), names.to_vec()))
                .collect(),
            delay: Duration::from_millis(30),
        })
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectorFactory for CountingFactory {
    async fn create(
        &self,
        name: &str,
        config: &McpServerConfig,
        _project_dir: Option<&str>,
        _task_dir: Option<&str>,
    ) -> anyhow::Result<McpConnector> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(config.clone());
        tokio::time::sleep(self.delay).await;
        let Some(names) = self.tools.get(name) else {
            anyhow::bail!("server '{name}' refused to start");
        };
        let tools = names
            .iter()
            .map(|tool| McpTool {
                name: (*tool).to_string(),
                description: Some(format!("{tool} from {name}")),
                input_schema: json!({
                    "type": "object",
                    "properties": {"value": {"type": "string"}},
                    "required": ["value"]
                }),
                server_name: name.to_string(),
            })
            .collect();
        Ok(McpConnector::new(
            name,
            config.clone(),
            tools,
            Arc::new(EchoTransport {
                calls: Arc::clone(&self.calls),
                closes: Arc::clone(&self.closes),
            }),
            5,
        ))
    }
}

pub fn manager(factory: Arc<CountingFactory>, dir: &Path) -> Arc<McpManager> {
    Arc::new(McpManager::new(factory, ToolsCache::new(dir.join("tools-cache.json"))))
}

pub fn npx(args: &[&str]) -> McpServerConfig {
    McpServerConfig::local("npx", args.iter().map(|a| (*a).to_string()).collect())
}

// === UI ===

/// Records everything the agent reports.
#[derive(Default)]
pub struct RecordingUi {
    pub responses: Mutex<Vec<ResponseMessage>>,
    pub tools: Mutex<Vec<ToolMessage>>,
    pub logs: Mutex<Vec<(LogLevel, Option<String>)>>,
}

impl RecordingUi {
    pub fn answer_text(&self) -> String {
        self.responses
            .lock()
            .unwrap()
            .iter()
            .map(|message| message.content.as_str())
            .collect()
    }

    pub fn completed_tools(&self) -> Vec<ToolMessage> {
        self.tools
            .lock()
            .unwrap()
            .iter()
            .filter(|message| message.result.is_some())
            .cloned()
            .collect()
    }

    pub fn logs_at(&self, level: LogLevel) -> Vec<String> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .filter_map(|(_, text)| text.clone())
            .collect()
    }
}

impl AgentUi for RecordingUi {
    fn process_response_message(&self, message: ResponseMessage) {
        self.responses.lock().unwrap().push(message);
    }

    fn add_tool_message(&self, message: ToolMessage) {
        self.tools.lock().unwrap().push(message);
    }

    fn add_log_message(&self, level: LogLevel, text: Option<String>) {
        self.logs.lock().unwrap().push((level, text));
    }
}

/// Answers approval questions from a script and records them.
pub struct ScriptedApprovals {
    answers: Mutex<VecDeque<ApprovalResponse>>,
    pub asked: Mutex<Vec<(String, String)>>,
}

impl ScriptedApprovals {
    pub fn new(answers: Vec<ApprovalResponse>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            asked: Mutex::new(Vec::new()),
        })
    }

    pub fn asked_count(&self) -> usize {
        self.asked.lock().unwrap().len()
    }
}

#[async_trait]
impl ApprovalUi for ScriptedApprovals {
    async fn request_approval(&self, tool_id: &str, text: &str, _subject: &str) -> ApprovalResponse {
        self.asked
            .lock()
            .unwrap()
            .push((tool_id.to_string(), text.to_string()));
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ApprovalResponse::deny(None))
    }
}
