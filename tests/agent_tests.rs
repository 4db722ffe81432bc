//! End-to-end runs of the agent loop against a scripted model and an
//! in-memory MCP server.

mod common;

#[cfg(test)]
mod agent_tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use desk_agent::config::RetryPolicy;
    use desk_agent::core::{
        Agent, ApprovalOutcome, ApprovalResponse, ApprovalUi, AutoApprove, LocalTaskContext, LogLevel, StopReason,
        TaskContext,
    };
    use desk_agent::llm_client::{FinishReason, LlmError, ModelEventStream, ModelProvider, ProviderRegistry};
    use desk_agent::models::{ContentBlock, MessageRequest};
    use desk_agent::profile::{AgentProfile, ToolApprovalState};
    use futures_util::stream;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use crate::common::{
        CountingFactory, RecordingUi, ScriptedApprovals, ScriptedProvider, answer_step, finish, manager, npx, text,
        tool_step,
    };

    struct Harness {
        agent: Agent,
        ui: Arc<RecordingUi>,
        factory: Arc<CountingFactory>,
        task: Arc<LocalTaskContext>,
        _dir: tempfile::TempDir,
    }

    fn harness(provider: Arc<dyn ModelProvider>, approvals: Arc<dyn ApprovalUi>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let factory = CountingFactory::new(&[("fs", &["read", "write", "fail"])]);
        let ui = Arc::new(RecordingUi::default());
        let agent = Agent::new(
            ProviderRegistry::new().with(provider),
            manager(factory.clone(), dir.path()),
            ui.clone(),
            approvals,
        )
        .with_mcp_servers(HashMap::from([("fs".to_string(), npx(&["server-fs", "${projectDir}"]))]))
        .with_retry_policy(RetryPolicy {
            initial_delay: 0.0,
            ..RetryPolicy::default()
        });
        let task = Arc::new(LocalTaskContext::new(dir.path()));
        Harness {
            agent,
            ui,
            factory,
            task,
            _dir: dir,
        }
    }

    fn profile(approvals: &[(&str, ToolApprovalState)]) -> AgentProfile {
        AgentProfile {
            provider: "scripted".to_string(),
            enabled_servers: vec!["fs".to_string()],
            tool_approvals: approvals
                .iter()
                .map(|(id, state)| ((*id).to_string(), *state))
                .collect(),
            ..AgentProfile::default()
        }
    }

    fn offered_tools(request: &MessageRequest) -> Vec<String> {
        request
            .tools
            .as_ref()
            .map(|tools| tools.iter().map(|tool| tool.name.clone()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_mcp_tool_round_trip() {
        let provider = ScriptedProvider::new(vec![
            tool_step("c1", "fs---read", json!({"value": "notes.md"})),
            answer_step("All read."),
        ]);
        let h = harness(provider.clone(), Arc::new(AutoApprove));
        let profile = profile(&[("fs---read", ToolApprovalState::Always)]);

        let outcome = h.agent.run(&profile, "read the notes", h.task.clone(), None).await;

        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(outcome.final_text(), "All read.");
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].approval, Some(ApprovalOutcome::AutoApproved));
        assert!(outcome.tool_calls[0].output().contains("notes.md"));

        let calls = h.factory.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "read");

        let requests = provider.requests.lock().unwrap();
        let offered = offered_tools(&requests[0]);
        assert_eq!(&offered[..3], &["fs---read", "fs---write", "fs---fail"]);
        assert!(offered.contains(&"helpers---no_such_tool".to_string()));

        let completed = h.ui.completed_tools();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].server_name, "fs");
        assert_eq!(completed[0].tool_name, "read");
        assert!(completed[0].usage_report.is_some());
        assert!(h.ui.responses.lock().unwrap().last().unwrap().finished);
        assert!(h.task.total_cost() > 0.0);
    }

    #[tokio::test]
    async fn test_never_tool_is_hidden_and_rerouted() {
        let provider = ScriptedProvider::new(vec![
            tool_step("c1", "fs---write", json!({"value": "x"})),
            answer_step("ok"),
        ]);
        let approvals = ScriptedApprovals::new(Vec::new());
        let h = harness(provider.clone(), approvals.clone());
        let profile = profile(&[("fs---write", ToolApprovalState::Never)]);

        let outcome = h.agent.run(&profile, "write", h.task.clone(), None).await;

        let requests = provider.requests.lock().unwrap();
        assert!(!offered_tools(&requests[0]).contains(&"fs---write".to_string()));

        let record = &outcome.tool_calls[0];
        assert_eq!(record.tool_name, "helpers---no_such_tool");
        assert!(record.is_error());
        assert!(record.output().starts_with("Tool 'fs---write' does not exist."));
        assert_eq!(approvals.asked_count(), 0);
        assert!(h.factory.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_denied_call_reports_reason_to_model() {
        let provider = ScriptedProvider::new(vec![
            tool_step("c1", "fs---read", json!({"value": "secret"})),
            answer_step("understood"),
        ]);
        let approvals = ScriptedApprovals::new(vec![ApprovalResponse::deny(Some("not now"))]);
        let h = harness(provider.clone(), approvals.clone());

        let outcome = h.agent.run(&profile(&[]), "read", h.task.clone(), None).await;

        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(
            outcome.tool_calls[0].output(),
            "Tool execution denied by user. Reason: not now"
        );
        assert!(!outcome.tool_calls[0].is_error());
        assert!(h.factory.calls.lock().unwrap().is_empty());

        let asked = approvals.asked.lock().unwrap();
        assert_eq!(asked[0].0, "fs---read");
        assert_eq!(asked[0].1, "Approve running tool 'read' from server 'fs'?");

        let requests = provider.requests.lock().unwrap();
        let results = requests[1].messages.last().unwrap();
        assert!(results.content.iter().any(|block| matches!(
            block,
            ContentBlock::ToolResult { tool_use_id, content, .. }
                if tool_use_id == "c1" && content.contains("not now")
        )));
    }

    #[tokio::test]
    async fn test_approve_always_is_remembered_for_the_run() {
        let provider = ScriptedProvider::new(vec![
            tool_step("c1", "fs---read", json!({"value": "a"})),
            tool_step("c2", "fs---read", json!({"value": "b"})),
            answer_step("done"),
        ]);
        let approvals = ScriptedApprovals::new(vec![ApprovalResponse {
            approved: true,
            user_input: Some("Always".to_string()),
        }]);
        let h = harness(provider, approvals.clone());

        let outcome = h.agent.run(&profile(&[]), "read twice", h.task.clone(), None).await;

        assert_eq!(approvals.asked_count(), 1);
        assert_eq!(outcome.tool_calls[0].approval, Some(ApprovalOutcome::Approved));
        assert_eq!(outcome.tool_calls[1].approval, Some(ApprovalOutcome::AutoApproved));
        assert_eq!(h.factory.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_arguments_go_to_helper_without_approval() {
        let provider = ScriptedProvider::new(vec![
            tool_step("c1", "fs---read", json!({"path": "a"})),
            answer_step("retrying later"),
        ]);
        let approvals = ScriptedApprovals::new(Vec::new());
        let h = harness(provider, approvals.clone());

        let outcome = h.agent.run(&profile(&[]), "read", h.task.clone(), None).await;

        let record = &outcome.tool_calls[0];
        assert_eq!(record.tool_name, "helpers---invalid_tool_arguments");
        assert!(record.output().contains("Invalid arguments for tool 'fs---read'"));
        assert!(record.output().contains("{\"path\":\"a\"}"));
        assert_eq!(approvals.asked_count(), 0);
        assert!(h.factory.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unrepairable_call_ends_run_with_error() {
        let provider = ScriptedProvider::new(vec![
            tool_step("c1", "fs---read", json!(["notes.md"])),
            // The repair round-trip answers without a tool call.
            answer_step("I am not sure what to call"),
        ]);
        let approvals = ScriptedApprovals::new(Vec::new());
        let h = harness(provider.clone(), approvals.clone());

        let outcome = h.agent.run(&profile(&[]), "read", h.task.clone(), None).await;

        let StopReason::Error(message) = &outcome.stop_reason else {
            panic!("expected an error stop, got {:?}", outcome.stop_reason);
        };
        assert!(message.contains("could not be repaired"));
        assert!(message.contains("fs---read"));
        assert_eq!(provider.request_count(), 2);
        assert!(outcome.tool_calls.is_empty());
        assert_eq!(approvals.asked_count(), 0);
        assert!(h.factory.calls.lock().unwrap().is_empty());
        assert!(!h.ui.logs_at(LogLevel::Error).is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_finish_reason_retries_and_keeps_usage() {
        let provider = ScriptedProvider::new(vec![
            Ok(vec![text("half an ans"), finish(FinishReason::Other("pause_turn".to_string()))]),
            answer_step("A full answer."),
        ]);
        let h = harness(provider.clone(), Arc::new(AutoApprove));

        let outcome = h.agent.run(&profile(&[]), "question", h.task.clone(), None).await;

        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(outcome.final_text(), "A full answer.");
        assert_eq!(provider.request_count(), 2);
        assert_eq!(outcome.usage.input_tokens, 200);
        assert_eq!(outcome.usage.output_tokens, 40);

        let responses = h.ui.responses.lock().unwrap();
        let reported: Vec<&str> = responses
            .iter()
            .filter(|message| message.finished && message.usage_report.is_some())
            .map(|message| message.id.as_str())
            .collect();
        assert_eq!(reported.len(), 2);
        assert_ne!(reported[0], reported[1]);
        let first_step = responses.iter().find(|message| !message.finished).unwrap();
        assert_eq!(first_step.id, reported[0]);
    }

    #[tokio::test]
    async fn test_server_error_result_is_flagged() {
        let provider = ScriptedProvider::new(vec![
            tool_step("c1", "fs---fail", json!({"value": "x"})),
            answer_step("it failed"),
        ]);
        let h = harness(provider.clone(), Arc::new(AutoApprove));

        let outcome = h
            .agent
            .run(&profile(&[("fs---fail", ToolApprovalState::Always)]), "try", h.task.clone(), None)
            .await;

        assert!(outcome.tool_calls[0].is_error());
        assert_eq!(outcome.tool_calls[0].output(), "Error: boom");
        let requests = provider.requests.lock().unwrap();
        assert!(requests[1].messages.last().unwrap().content.iter().any(|block| matches!(
            block,
            ContentBlock::ToolResult { is_error: true, .. }
        )));
    }

    #[tokio::test]
    async fn test_tool_calls_are_spaced_by_profile_interval() {
        let provider = ScriptedProvider::new(vec![
            tool_step("c1", "fs---read", json!({"value": "a"})),
            tool_step("c2", "fs---read", json!({"value": "b"})),
            answer_step("done"),
        ]);
        let h = harness(provider, Arc::new(AutoApprove));
        let profile = AgentProfile {
            min_time_between_tool_calls: 150,
            ..profile(&[("fs---read", ToolApprovalState::Always)])
        };

        let start = Instant::now();
        let outcome = h.agent.run(&profile, "read twice", h.task.clone(), None).await;

        assert_eq!(outcome.tool_calls.len(), 2);
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_unavailable_server_is_reported() {
        let provider = ScriptedProvider::new(vec![answer_step("fine")]);
        let h = harness(provider, Arc::new(AutoApprove));
        let profile = AgentProfile {
            enabled_servers: vec!["fs".to_string(), "ghost".to_string()],
            ..profile(&[])
        };

        let outcome = h.agent.run(&profile, "hello", h.task.clone(), None).await;

        assert_eq!(outcome.stop_reason, StopReason::Completed);
        let warnings = h.ui.logs_at(LogLevel::Warning);
        assert!(warnings.iter().any(|text| text.contains("'ghost' is not available")));
        assert!(!warnings.iter().any(|text| text.contains("'fs'")));
    }

    #[tokio::test]
    async fn test_subagent_runs_nested_and_returns_answer() {
        let provider = ScriptedProvider::new(vec![
            tool_step(
                "c1",
                "subagents---run_task",
                json!({"prompt": "review src/lib.rs", "profile": "reviewer"}),
            ),
            answer_step("LGTM"),
            answer_step("The reviewer approved."),
        ]);
        let h = harness(provider.clone(), Arc::new(AutoApprove));
        let reviewer = AgentProfile {
            id: "reviewer".to_string(),
            provider: "scripted".to_string(),
            ..AgentProfile::default()
        };
        let agent = h
            .agent
            .clone()
            .with_profiles(HashMap::from([("reviewer".to_string(), reviewer)]));
        let profile = AgentProfile {
            use_subagents: true,
            ..profile(&[("subagents---run_task", ToolApprovalState::Always)])
        };

        let outcome = agent.run(&profile, "get a review", h.task.clone(), None).await;

        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(outcome.tool_calls[0].output(), "LGTM");
        assert_eq!(outcome.final_text(), "The reviewer approved.");

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        // The nested run starts from its own prompt and cannot delegate again.
        assert_eq!(requests[1].messages.len(), 1);
        assert!(!offered_tools(&requests[1]).iter().any(|name| name.starts_with("subagents---")));
    }

    /// Streams nothing until cancelled.
    struct HangingProvider;

    #[async_trait]
    impl ModelProvider for HangingProvider {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn stream(&self, _request: MessageRequest, _cancel: CancellationToken) -> Result<ModelEventStream, LlmError> {
            Ok(Box::pin(stream::pending()))
        }
    }

    async fn wait_until_running(agent: &Agent, dir: &Path) {
        for _ in 0..200 {
            if agent.is_running(dir) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run never started");
    }

    #[tokio::test]
    async fn test_interrupt_by_task_dir_cancels_run() {
        let h = harness(Arc::new(HangingProvider), Arc::new(AutoApprove));
        let task_dir = h.task.task_dir().to_path_buf();

        let agent = h.agent.clone();
        let task = h.task.clone();
        let run = tokio::spawn(async move { agent.run(&profile(&[]), "wait", task, None).await });

        wait_until_running(&h.agent, &task_dir).await;
        assert!(h.agent.interrupt(&task_dir));

        let outcome = run.await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert!(!h.agent.is_running(&task_dir));
        assert!(!h.agent.interrupt(&task_dir));
        assert!(h.ui.responses.lock().unwrap().last().unwrap().finished);
    }
}
