//! The agent run loop.
//!
//! One `Agent::run` drives a prompt to completion:
//! - prepare messages and assemble the tool set
//! - stream one model step, forwarding text to the UI as it arrives
//! - resolve the step's tool calls, then gate, throttle and execute them
//! - feed the results back and loop until a terminal condition
//!
//! `Agent` is cheap to clone; every clone shares the MCP pool, the rate
//! limiter and the table of running tasks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::error_hints::hint_for_llm_error;
use crate::llm_client::{FinishReason, LlmError, ModelEvent, ModelProvider, ProviderRegistry, RawToolCall};
use crate::mcp::{McpConnector, McpManager, McpServerConfig};
use crate::models::{ContentBlock, Message, MessageRequest, Usage, UsageReport};
use crate::pricing::{PricingProvider, TablePricing};
use crate::profile::AgentProfile;
use crate::tools::{BuiltinTools, SubagentRunner, ToolAssembler, ToolContext, ToolRegistry, TodoStore};

use super::approval::{ApprovalGate, ApprovalOutcome, ApprovalUi, denial_text};
use super::context::TaskContext;
use super::events::{
    ANSWER_START_MARKER, AgentUi, LogLevel, ResponseMessage, THINKING_START_MARKER, ToolMessage,
};
use super::messages::{prepare_messages, system_prompt};
use super::rate_limit::RateLimiter;
use super::repair::ToolCallRepairer;
use super::tool_parser::{ParsedToolCall, resolve_tool_call};
use super::turn::{ToolCallRecord, TurnContext};

// === Types ===

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The model answered without requesting more tools.
    Completed,
    MaxIterations,
    Cancelled,
    /// The model hit the output token limit.
    Length,
    ContentFilter,
    Error(String),
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub stop_reason: StopReason,
    /// Messages produced by the run, starting with the prompt.
    pub messages: Vec<Message>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub usage: Usage,
    pub total_cost: f64,
}

impl RunOutcome {
    /// Text of the last assistant message.
    pub fn final_text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == "assistant")
            .map(Message::text)
            .unwrap_or_default()
    }
}

/// What one streamed model step produced.
#[derive(Debug, Default)]
struct StepOutput {
    text: String,
    tool_calls: Vec<RawToolCall>,
    usage: Usage,
    finish: Option<FinishReason>,
    error: Option<LlmError>,
    /// The error came from opening the request, not from the stream.
    request_failed: bool,
}

type RunningTasks = HashMap<PathBuf, (String, CancellationToken)>;

// === Agent ===

#[derive(Clone)]
pub struct Agent {
    providers: Arc<ProviderRegistry>,
    mcp: Arc<McpManager>,
    mcp_servers: Arc<HashMap<String, McpServerConfig>>,
    profiles: Arc<HashMap<String, AgentProfile>>,
    pricing: Arc<dyn PricingProvider>,
    ui: Arc<dyn AgentUi>,
    approval_ui: Arc<dyn ApprovalUi>,
    rate_limiter: Arc<RateLimiter>,
    running: Arc<Mutex<RunningTasks>>,
    retry: RetryPolicy,
}

impl Agent {
    pub fn new(
        providers: ProviderRegistry,
        mcp: Arc<McpManager>,
        ui: Arc<dyn AgentUi>,
        approval_ui: Arc<dyn ApprovalUi>,
    ) -> Self {
        Self {
            providers: Arc::new(providers),
            mcp,
            mcp_servers: Arc::new(HashMap::new()),
            profiles: Arc::new(HashMap::new()),
            pricing: Arc::new(TablePricing),
            ui,
            approval_ui,
            rate_limiter: Arc::new(RateLimiter::new()),
            running: Arc::new(Mutex::new(HashMap::new())),
            retry: RetryPolicy::default(),
        }
    }

    /// MCP server configurations connected before each run.
    #[must_use]
    pub fn with_mcp_servers(mut self, servers: HashMap<String, McpServerConfig>) -> Self {
        self.mcp_servers = Arc::new(servers);
        self
    }

    /// Profiles available to the `run_task` sub-agent tool.
    #[must_use]
    pub fn with_profiles(mut self, profiles: HashMap<String, AgentProfile>) -> Self {
        self.profiles = Arc::new(profiles);
        self
    }

    #[must_use]
    pub fn with_pricing(mut self, pricing: Arc<dyn PricingProvider>) -> Self {
        self.pricing = pricing;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn running(&self) -> std::sync::MutexGuard<'_, RunningTasks> {
        self.running.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Cancel the run registered for `task_dir`. Returns false when none is running.
    pub fn interrupt(&self, task_dir: &Path) -> bool {
        match self.running().get(task_dir) {
            Some((_, cancel)) => {
                tracing::info!(task_dir = %task_dir.display(), "Interrupting run");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a run is registered for `task_dir`.
    pub fn is_running(&self, task_dir: &Path) -> bool {
        self.running().contains_key(task_dir)
    }

    /// Run `prompt` to completion for `task`.
    ///
    /// The run can be cancelled through `cancel` or `interrupt(task_dir)`.
    /// A finished marker is emitted to the UI however the run ends.
    pub async fn run(
        &self,
        profile: &AgentProfile,
        prompt: &str,
        task: Arc<dyn TaskContext>,
        cancel: Option<CancellationToken>,
    ) -> RunOutcome {
        let cancel = cancel.unwrap_or_default();
        let task_dir = task.task_dir().to_path_buf();
        let run_id = uuid::Uuid::new_v4().to_string();

        let previous = self
            .running()
            .insert(task_dir.clone(), (run_id.clone(), cancel.clone()));
        if previous.is_some() {
            tracing::warn!(task_dir = %task_dir.display(), "Another run is active for this task directory");
        }

        let outcome = self.run_loop(profile, prompt, task, &cancel, false).await;

        // Cleanup
        {
            let mut running = self.running();
            if running.get(&task_dir).is_some_and(|(id, _)| *id == run_id) {
                running.remove(&task_dir);
            }
        }
        self.ui.add_log_message(LogLevel::Loading, None);
        self.ui.process_response_message(ResponseMessage::finished(run_id, None));
        tracing::info!(
            stop_reason = ?outcome.stop_reason,
            tool_calls = outcome.tool_calls.len(),
            cost = outcome.total_cost,
            "Run finished"
        );
        outcome
    }

    #[allow(clippy::too_many_lines)]
    async fn run_loop(
        &self,
        profile: &AgentProfile,
        prompt: &str,
        task: Arc<dyn TaskContext>,
        cancel: &CancellationToken,
        nested: bool,
    ) -> RunOutcome {
        let mut turn = TurnContext::new(profile.max_iterations);
        let mut history = if nested {
            vec![Message::user(prompt)]
        } else {
            prepare_messages(profile, task.as_ref(), Some(prompt)).await
        };
        let first_new = history.len().saturating_sub(1);

        let finish = |turn: TurnContext, history: Vec<Message>, stop_reason: StopReason| RunOutcome {
            stop_reason,
            messages: history.into_iter().skip(first_new).collect(),
            tool_calls: turn.tool_calls,
            usage: turn.usage,
            total_cost: turn.total_cost,
        };

        let Some(provider) = self.providers.get(&profile.provider) else {
            let err = LlmError::UnknownProvider(profile.provider.clone());
            self.report_llm_error(&err);
            return finish(turn, history, StopReason::Error(err.to_string()));
        };

        let connectors = self.init_mcp(profile, task.as_ref()).await;
        let registry = self.assemble_tools(profile, &connectors, &task, nested);
        tracing::debug!(tools = registry.len(), "Assembled tool set");

        let tools = registry.to_api_tools(true);
        let system = system_prompt(profile, task.as_ref());
        let tool_context = ToolContext::new(task.task_dir())
            .with_trust_mode(profile.trust_mode)
            .with_cancel(cancel.clone());
        let gate = ApprovalGate::new(self.approval_ui.clone());
        let mut retries: u32 = 0;

        let stop_reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if turn.at_max_steps() {
                self.ui.add_log_message(
                    LogLevel::Warning,
                    Some(format!("Reached the maximum of {} iterations.", turn.max_steps)),
                );
                break StopReason::MaxIterations;
            }

            let request = MessageRequest {
                model: profile.model.clone(),
                messages: history.clone(),
                max_tokens: profile.max_tokens,
                system: Some(system.clone()),
                tools: (!tools.is_empty()).then(|| tools.clone()),
                tool_choice: (!tools.is_empty()).then(|| json!({"type": "auto"})),
                metadata: None,
                thinking: None,
                stream: Some(true),
                temperature: Some(profile.temperature),
            };

            let step_id = uuid::Uuid::new_v4().to_string();
            self.ui
                .add_log_message(LogLevel::Loading, Some("Thinking...".to_string()));
            let step = self
                .stream_step(provider.as_ref(), request.clone(), &step_id, cancel)
                .await;
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }

            if let Some(err) = step.error {
                let already_retried = step.request_failed && provider.retries_requests();
                if err.is_retryable() && !already_retried && retries < self.retry.retry_budget() {
                    let delay = err
                        .suggested_retry_delay()
                        .unwrap_or_else(|| self.retry.delay_for_attempt(retries));
                    retries += 1;
                    self.ui.add_log_message(
                        LogLevel::Warning,
                        Some(format!("{err}. Retrying ({retries}/{})...", self.retry.max_retries)),
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        break StopReason::Cancelled;
                    }
                    continue;
                }
                self.report_llm_error(&err);
                break StopReason::Error(err.to_string());
            }

            let reason = step.finish.clone().unwrap_or(FinishReason::Unknown);
            if matches!(reason, FinishReason::Unknown | FinishReason::Other(_))
                && step.tool_calls.is_empty()
                && retries < self.retry.retry_budget()
            {
                retries += 1;
                tracing::warn!(?reason, "Unexpected finish reason, retrying step");
                let cost = self
                    .pricing
                    .cost(&profile.provider, &profile.model, &step.usage, None);
                let report = turn.add_step(&step.usage, cost);
                task.add_cost(cost);
                self.ui
                    .process_response_message(ResponseMessage::finished(step_id, Some(report)));
                if !sleep_or_cancel(self.retry.delay_for_attempt(retries - 1), cancel).await {
                    break StopReason::Cancelled;
                }
                continue;
            }
            retries = 0;
            turn.next_step();

            let cost = self
                .pricing
                .cost(&profile.provider, &profile.model, &step.usage, None);
            let report = turn.add_step(&step.usage, cost);
            task.add_cost(cost);

            let repairer = ToolCallRepairer::new(provider.clone(), request);
            let mut calls = Vec::with_capacity(step.tool_calls.len());
            let mut unrepairable = None;
            for raw in &step.tool_calls {
                match resolve_tool_call(&registry, raw, Some(&repairer), cancel).await {
                    Ok(call) => calls.push(call),
                    Err(err) => {
                        unrepairable = Some(err);
                        break;
                    }
                }
            }

            let mut content = Vec::new();
            if !step.text.is_empty() {
                content.push(ContentBlock::text(step.text.clone()));
            }
            if unrepairable.is_none() {
                content.extend(calls.iter().map(|call| ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.tool_id.clone(),
                    input: call.arguments.clone(),
                }));
            }
            if !content.is_empty() {
                history.push(Message {
                    role: "assistant".to_string(),
                    content,
                });
            }

            let tools_follow = unrepairable.is_none() && !calls.is_empty();
            self.ui.process_response_message(ResponseMessage::finished(
                step_id,
                (!tools_follow).then_some(report),
            ));

            if let Some(err) = unrepairable {
                tracing::error!("{err}");
                self.ui.add_log_message(LogLevel::Error, Some(err.to_string()));
                break StopReason::Error(err.to_string());
            }

            if tools_follow {
                let mut results = Vec::with_capacity(calls.len());
                for (index, call) in calls.iter().enumerate() {
                    let record = self
                        .execute_call(
                            profile,
                            &registry,
                            &gate,
                            call,
                            &tool_context,
                            (index == 0).then_some(report),
                        )
                        .await;
                    results.push(ContentBlock::ToolResult {
                        tool_use_id: record.tool_call_id.clone(),
                        content: record.output().to_string(),
                        is_error: record.is_error(),
                    });
                    turn.record_tool_call(record);
                }
                history.push(Message {
                    role: "user".to_string(),
                    content: results,
                });
                continue;
            }

            match reason {
                FinishReason::Length => {
                    self.ui.add_log_message(
                        LogLevel::Warning,
                        Some("The response was cut off because it reached the max tokens limit.".to_string()),
                    );
                    break StopReason::Length;
                }
                FinishReason::ContentFilter => {
                    self.ui.add_log_message(
                        LogLevel::Warning,
                        Some("The response was stopped by the provider's content filter.".to_string()),
                    );
                    break StopReason::ContentFilter;
                }
                FinishReason::Error => {
                    self.ui.add_log_message(
                        LogLevel::Error,
                        Some("The model stopped with an error.".to_string()),
                    );
                    break StopReason::Error("model finished with an error".to_string());
                }
                _ => break StopReason::Completed,
            }
        };

        finish(turn, history, stop_reason)
    }

    /// Connect the profile's MCP servers for the task's directories. Servers
    /// that fail are logged and left out.
    async fn init_mcp(&self, profile: &AgentProfile, task: &dyn TaskContext) -> Vec<Arc<McpConnector>> {
        if profile.enabled_servers.is_empty() {
            return Vec::new();
        }
        let project_dir = task.project_dir().to_string_lossy().into_owned();
        let task_dir = task.task_dir().to_string_lossy().into_owned();
        let connectors = self
            .mcp
            .init_connectors(
                &self.mcp_servers,
                Some(&project_dir),
                Some(&task_dir),
                false,
                Some(&profile.enabled_servers),
            )
            .await;

        for server in &profile.enabled_servers {
            if !connectors.iter().any(|c| c.name() == server) {
                self.ui.add_log_message(
                    LogLevel::Warning,
                    Some(format!("MCP server '{server}' is not available; its tools are skipped.")),
                );
            }
        }
        connectors
    }

    fn assemble_tools(
        &self,
        profile: &AgentProfile,
        connectors: &[Arc<McpConnector>],
        task: &Arc<dyn TaskContext>,
        nested: bool,
    ) -> ToolRegistry {
        let subagents: Option<Arc<dyn SubagentRunner>> = (!nested).then(|| {
            Arc::new(NestedAgent {
                agent: self.clone(),
                task: task.clone(),
                parent: profile.clone(),
            }) as Arc<dyn SubagentRunner>
        });
        let builtins = BuiltinTools {
            task: Some(task.clone()),
            todos: Some(Arc::new(TodoStore::for_task(task.task_dir()))),
            subagents,
        };
        ToolAssembler::for_provider(&profile.provider).assemble(profile, connectors, &builtins)
    }

    /// Consume one model stream. Text goes to the UI as it arrives; reasoning
    /// is tagged as thinking until the first answer chunk.
    async fn stream_step(
        &self,
        provider: &dyn ModelProvider,
        request: MessageRequest,
        step_id: &str,
        cancel: &CancellationToken,
    ) -> StepOutput {
        let mut output = StepOutput::default();
        let mut stream = match provider.stream(request, cancel.clone()).await {
            Ok(stream) => stream,
            Err(err) => {
                output.error = Some(err);
                output.request_failed = true;
                return output;
            }
        };

        let mut thinking = false;
        let mut answering = false;
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = stream.next() => event,
            };
            let Some(event) = event else {
                break;
            };

            match event {
                ModelEvent::TextDelta(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    let mut chunk = String::new();
                    if thinking && !answering {
                        chunk.push_str("\n\n");
                        chunk.push_str(ANSWER_START_MARKER);
                    }
                    answering = true;
                    chunk.push_str(&text);
                    output.text.push_str(&text);
                    self.ui
                        .process_response_message(ResponseMessage::chunk(step_id, chunk));
                }
                ModelEvent::ReasoningDelta(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    let chunk = if thinking {
                        text
                    } else {
                        thinking = true;
                        format!("{THINKING_START_MARKER}{text}")
                    };
                    self.ui
                        .process_response_message(ResponseMessage::chunk(step_id, chunk));
                }
                ModelEvent::ToolInputStart { name, .. } => {
                    tracing::debug!(tool = %name, "Model started a tool call");
                }
                ModelEvent::ToolCall(call) => output.tool_calls.push(call),
                ModelEvent::ToolResult { id, .. } => {
                    tracing::debug!(tool_call_id = %id, "Ignoring provider-side tool result");
                }
                ModelEvent::StepFinish { usage } => output.usage.add(&usage),
                ModelEvent::Error(err) => {
                    output.error = Some(err);
                    break;
                }
                ModelEvent::Finish { reason, usage } => {
                    output.usage.add(&usage);
                    output.finish = Some(reason);
                    break;
                }
            }
        }
        output
    }

    /// Approval, then rate limit, then the tool body. Failures become error
    /// results; nothing here ends the run.
    async fn execute_call(
        &self,
        profile: &AgentProfile,
        registry: &ToolRegistry,
        gate: &ApprovalGate,
        call: &ParsedToolCall,
        context: &ToolContext,
        usage_report: Option<UsageReport>,
    ) -> ToolCallRecord {
        let mut record = ToolCallRecord::new(&call.id, &call.tool_id, call.arguments.clone());
        let message = ToolMessage {
            tool_call_id: call.id.clone(),
            server_name: call.server_name.clone(),
            tool_name: call.tool_name.clone(),
            args: call.arguments.clone(),
            result: None,
            usage_report: None,
        };
        self.ui.add_tool_message(message.clone());

        let outcome = gate
            .check(
                profile,
                &call.tool_id,
                &call.server_name,
                &call.tool_name,
                &call.arguments,
                &context.cancel,
            )
            .await;
        let start = Instant::now();

        match &outcome {
            ApprovalOutcome::Cancelled => {
                record.set_error("Tool call cancelled.".to_string(), start.elapsed());
            }
            ApprovalOutcome::Denied { reason } => {
                record.set_result(denial_text(reason.as_deref()), start.elapsed());
            }
            ApprovalOutcome::Approved | ApprovalOutcome::AutoApproved => {
                let spacing = Duration::from_millis(profile.min_time_between_tool_calls);
                if self.rate_limiter.wait(spacing, &context.cancel).await {
                    let start = Instant::now();
                    match registry
                        .execute(&call.tool_id, call.arguments.clone(), context)
                        .await
                    {
                        Ok(result) if result.success => record.set_result(result.content, start.elapsed()),
                        Ok(result) => record.set_error(result.content, start.elapsed()),
                        Err(err) => {
                            tracing::warn!(tool = %call.tool_id, "Tool execution failed: {err}");
                            record.set_error(format!("Error: {err}"), start.elapsed());
                        }
                    }
                } else {
                    record.set_error("Tool call cancelled.".to_string(), start.elapsed());
                }
            }
        }
        record.approval = Some(outcome);

        self.ui.add_tool_message(ToolMessage {
            result: Some(record.output().to_string()),
            usage_report,
            ..message
        });
        record
    }

    fn report_llm_error(&self, err: &LlmError) {
        tracing::error!("Model request failed: {err}");
        let text = match hint_for_llm_error(err) {
            Some(hint) => format!("{err}\n{}", hint.render()),
            None => err.to_string(),
        };
        self.ui.add_log_message(LogLevel::Error, Some(text));
    }
}

/// Returns false when cancelled before `delay` elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

// === Sub-agents ===

/// `run_task` backend: nested runs on the parent's task.
struct NestedAgent {
    agent: Agent,
    task: Arc<dyn TaskContext>,
    parent: AgentProfile,
}

#[async_trait]
impl SubagentRunner for NestedAgent {
    fn profile_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agent.profiles.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn run_task(&self, profile_id: Option<&str>, prompt: &str, cancel: CancellationToken) -> Result<String> {
        let profile = match profile_id {
            Some(id) => self
                .agent
                .profiles
                .get(id)
                .cloned()
                .ok_or_else(|| anyhow!("Unknown sub-agent profile '{id}'"))?,
            None => self.parent.clone(),
        }
        .for_subagent();

        tracing::info!(profile = %profile.id, "Starting sub-agent run");
        let outcome = Box::pin(self.agent.run_loop(&profile, prompt, self.task.clone(), &cancel, true)).await;
        match outcome.stop_reason {
            StopReason::Error(err) => Err(anyhow!(err)),
            StopReason::Cancelled => Err(anyhow!("sub-agent run was cancelled")),
            _ => Ok(outcome.final_text()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use futures_util::stream;
    use serde_json::Value;

    use super::*;
    use crate::core::approval::AutoApprove;
    use crate::core::context::LocalTaskContext;
    use crate::core::events::{ChannelUi, Event};
    use crate::llm_client::ModelEventStream;
    use crate::mcp::McpTimeouts;

    struct ScriptedProvider {
        steps: Mutex<VecDeque<Result<Vec<ModelEvent>, LlmError>>>,
        requests: Mutex<Vec<MessageRequest>>,
    }

    impl ScriptedProvider {
        fn new(steps: Vec<Result<Vec<ModelEvent>, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                requests: Mutex::new(Vec::new()),
            })
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

    fn finish(reason: FinishReason) -> ModelEvent {
        ModelEvent::Finish {
            reason,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                ..Usage::default()
            },
        }
    }

    fn tool_call(id: &str, name: &str, input: Value) -> ModelEvent {
        ModelEvent::ToolCall(RawToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input: input.to_string(),
        })
    }

    fn agent(provider: Arc<ScriptedProvider>, dir: &Path) -> (Agent, tokio::sync::mpsc::UnboundedReceiver<Event>) {
        let (ui, rx) = ChannelUi::new();
        let mcp = Arc::new(McpManager::with_defaults(McpTimeouts::default(), dir.join("cache.json")));
        let agent = Agent::new(ProviderRegistry::new().with(provider), mcp, Arc::new(ui), Arc::new(AutoApprove))
            .with_retry_policy(RetryPolicy {
                initial_delay: 0.0,
                ..RetryPolicy::default()
            });
        (agent, rx)
    }

    fn profile() -> AgentProfile {
        AgentProfile {
            provider: "scripted".to_string(),
            ..AgentProfile::default()
        }
    }

    #[tokio::test]
    async fn test_tool_round_trip_then_answer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello from disk").unwrap();
        let provider = ScriptedProvider::new(vec![
            Ok(vec![
                tool_call("t1", "power---file_read", json!({"path": "notes.txt"})),
                finish(FinishReason::ToolCalls),
            ]),
            Ok(vec![ModelEvent::TextDelta("Done".to_string()), finish(FinishReason::Stop)]),
        ]);
        let (agent, _rx) = agent(provider.clone(), dir.path());
        let task = Arc::new(LocalTaskContext::new(dir.path()));

        let outcome = agent.run(&profile(), "read notes", task.clone(), None).await;

        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(outcome.final_text(), "Done");
        assert_eq!(outcome.tool_calls.len(), 1);
        assert!(outcome.tool_calls[0].output().contains("hello from disk"));
        assert_eq!(outcome.usage.input_tokens, 20);

        let requests = provider.requests.lock().unwrap();
        let second = requests[1].messages.last().unwrap();
        assert!(second.has_tool_results());
        assert!(!agent.is_running(dir.path()));
    }

    #[tokio::test]
    async fn test_max_iterations_stops_loop() {
        let dir = tempfile::tempdir().unwrap();
        let looping = || {
            Ok(vec![
                tool_call("t", "todo---get_items", json!({})),
                finish(FinishReason::ToolCalls),
            ])
        };
        let provider = ScriptedProvider::new(vec![looping(), looping(), looping()]);
        let (agent, _rx) = agent(provider, dir.path());
        let profile = AgentProfile {
            max_iterations: 2,
            ..profile()
        };

        let outcome = agent
            .run(&profile, "loop", Arc::new(LocalTaskContext::new(dir.path())), None)
            .await;
        assert_eq!(outcome.stop_reason, StopReason::MaxIterations);
        assert_eq!(outcome.tool_calls.len(), 2);
    }

    #[tokio::test]
    async fn test_retryable_error_retries_step() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            Err(LlmError::ServerError {
                status: 529,
                message: "overloaded".to_string(),
            }),
            Ok(vec![ModelEvent::TextDelta("ok".to_string()), finish(FinishReason::Stop)]),
        ]);
        let (agent, _rx) = agent(provider.clone(), dir.path());
        let outcome = agent
            .run(&profile(), "hi", Arc::new(LocalTaskContext::new(dir.path())), None)
            .await;
        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(provider.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_auth_error_ends_run_with_hint() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![Err(LlmError::AuthenticationError("bad key".to_string()))]);
        let (agent, mut rx) = agent(provider, dir.path());
        let outcome = agent
            .run(&profile(), "hi", Arc::new(LocalTaskContext::new(dir.path())), None)
            .await;
        assert!(matches!(outcome.stop_reason, StopReason::Error(_)));

        let mut hinted = false;
        let mut finished = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::Log { level: LogLevel::Error, text: Some(text) } => {
                    hinted |= text.contains("DESK_AGENT_API_KEY");
                }
                Event::Response(message) => finished |= message.finished,
                _ => {}
            }
        }
        assert!(hinted);
        assert!(finished);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _rx) = agent(ScriptedProvider::new(Vec::new()), dir.path());
        let profile = AgentProfile {
            provider: "nope".to_string(),
            ..AgentProfile::default()
        };
        let outcome = agent
            .run(&profile, "hi", Arc::new(LocalTaskContext::new(dir.path())), None)
            .await;
        assert_eq!(
            outcome.stop_reason,
            StopReason::Error("Unknown model provider 'nope'".to_string())
        );
        assert_eq!(outcome.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _rx) = agent(ScriptedProvider::new(Vec::new()), dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = agent
            .run(&profile(), "hi", Arc::new(LocalTaskContext::new(dir.path())), Some(cancel))
            .await;
        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn test_reasoning_then_answer_emits_marker() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![Ok(vec![
            ModelEvent::ReasoningDelta("let me see".to_string()),
            ModelEvent::TextDelta("Answer".to_string()),
            finish(FinishReason::Stop),
        ])]);
        let (agent, mut rx) = agent(provider, dir.path());
        let outcome = agent
            .run(&profile(), "q", Arc::new(LocalTaskContext::new(dir.path())), None)
            .await;
        assert_eq!(outcome.final_text(), "Answer");

        let chunks: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|event| match event {
                Event::Response(message) if !message.finished => Some(message.content),
                _ => None,
            })
            .collect();
        assert!(chunks[0].starts_with(THINKING_START_MARKER));
        assert!(chunks[1].contains(ANSWER_START_MARKER));
        assert!(chunks[1].ends_with("Answer"));
    }
}
