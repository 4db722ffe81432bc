//! Per-call approval gate.
//!
//! `Always` tools run straight away. `Never` tools are filtered out when the
//! tool set is assembled; one that still reaches the gate is denied. Every
//! other tool asks the user through an `ApprovalUi`, with no timeout.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::profile::{AgentProfile, ToolApprovalState};
use crate::tools::helpers::HELPERS_SERVER;

/// Answer typed by the user to approve a tool for the rest of the run.
pub const APPROVE_ALWAYS: &str = "always";

/// A user's decision on one question.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalResponse {
    pub approved: bool,
    /// Free text supplied with the answer, e.g. a reason for denying.
    pub user_input: Option<String>,
}

impl ApprovalResponse {
    pub fn approve() -> Self {
        Self {
            approved: true,
            user_input: None,
        }
    }

    pub fn deny(reason: Option<&str>) -> Self {
        Self {
            approved: false,
            user_input: reason.map(str::to_string),
        }
    }
}

/// Where approval questions are routed. May block indefinitely.
#[async_trait]
pub trait ApprovalUi: Send + Sync {
    async fn request_approval(&self, tool_id: &str, text: &str, subject: &str) -> ApprovalResponse;
}

/// Approves every question. Used for unattended runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalUi for AutoApprove {
    async fn request_approval(&self, _tool_id: &str, _text: &str, _subject: &str) -> ApprovalResponse {
        ApprovalResponse::approve()
    }
}

/// How a tool call got past (or was stopped at) the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Policy or an earlier "always" answer allowed it without asking.
    AutoApproved,
    Approved,
    Denied { reason: Option<String> },
    /// The run was cancelled while waiting for an answer.
    Cancelled,
}

impl ApprovalOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::AutoApproved | Self::Approved)
    }
}

/// Synthetic tool result used in place of a denied call's output.
pub fn denial_text(reason: Option<&str>) -> String {
    match reason.map(str::trim).filter(|r| !r.is_empty()) {
        Some(reason) => format!("Tool execution denied by user. Reason: {reason}"),
        None => "Tool execution denied by user.".to_string(),
    }
}

/// Gate for one run. Remembers "always" answers until the run ends.
pub struct ApprovalGate {
    ui: Arc<dyn ApprovalUi>,
    session_approved: Mutex<HashSet<String>>,
}

impl ApprovalGate {
    pub fn new(ui: Arc<dyn ApprovalUi>) -> Self {
        Self {
            ui,
            session_approved: Mutex::new(HashSet::new()),
        }
    }

    fn approved(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.session_approved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub async fn check(
        &self,
        profile: &AgentProfile,
        tool_id: &str,
        server_name: &str,
        tool_name: &str,
        arguments: &Value,
        cancel: &CancellationToken,
    ) -> ApprovalOutcome {
        // Helper tools only report errors back to the model.
        if server_name == HELPERS_SERVER {
            return ApprovalOutcome::AutoApproved;
        }

        match profile.approval_for(tool_id) {
            ToolApprovalState::Always => return ApprovalOutcome::AutoApproved,
            ToolApprovalState::Never => {
                tracing::warn!(tool = %tool_id, "Tool marked Never reached the approval gate");
                return ApprovalOutcome::Denied { reason: None };
            }
            ToolApprovalState::Ask => {}
        }

        if self.approved().contains(tool_id) {
            return ApprovalOutcome::AutoApproved;
        }

        let text = format!("Approve running tool '{tool_name}' from server '{server_name}'?");
        let subject = serde_json::to_string_pretty(arguments).unwrap_or_else(|_| arguments.to_string());

        let response = tokio::select! {
            () = cancel.cancelled() => return ApprovalOutcome::Cancelled,
            response = self.ui.request_approval(tool_id, &text, &subject) => response,
        };

        if !response.approved {
            tracing::info!(tool = %tool_id, "Tool call denied by user");
            return ApprovalOutcome::Denied {
                reason: response.user_input,
            };
        }

        if response
            .user_input
            .as_deref()
            .is_some_and(|input| input.trim().eq_ignore_ascii_case(APPROVE_ALWAYS))
        {
            self.approved().insert(tool_id.to_string());
        }
        ApprovalOutcome::Approved
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    struct ScriptedUi {
        response: ApprovalResponse,
        asked: AtomicUsize,
    }

    impl ScriptedUi {
        fn new(response: ApprovalResponse) -> Arc<Self> {
            Arc::new(Self {
                response,
                asked: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ApprovalUi for ScriptedUi {
        async fn request_approval(&self, _tool_id: &str, text: &str, _subject: &str) -> ApprovalResponse {
            assert!(text.contains("from server"));
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.response.clone()
        }
    }

    struct PendingUi;

    #[async_trait]
    impl ApprovalUi for PendingUi {
        async fn request_approval(&self, _tool_id: &str, _text: &str, _subject: &str) -> ApprovalResponse {
            std::future::pending().await
        }
    }

    fn profile_with(tool_id: &str, state: ToolApprovalState) -> AgentProfile {
        let mut profile = AgentProfile::default();
        profile.tool_approvals.insert(tool_id.to_string(), state);
        profile
    }

    #[tokio::test]
    async fn test_always_skips_prompt() {
        let ui = ScriptedUi::new(ApprovalResponse::deny(None));
        let gate = ApprovalGate::new(ui.clone());
        let profile = profile_with("fs---read", ToolApprovalState::Always);
        let outcome = gate
            .check(&profile, "fs---read", "fs", "read", &json!({}), &CancellationToken::new())
            .await;
        assert_eq!(outcome, ApprovalOutcome::AutoApproved);
        assert_eq!(ui.asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_never_is_denied() {
        let gate = ApprovalGate::new(Arc::new(AutoApprove));
        let profile = profile_with("fs---rm", ToolApprovalState::Never);
        let outcome = gate
            .check(&profile, "fs---rm", "fs", "rm", &json!({}), &CancellationToken::new())
            .await;
        assert!(!outcome.is_approved());
    }

    #[tokio::test]
    async fn test_denial_carries_reason() {
        let ui = ScriptedUi::new(ApprovalResponse::deny(Some("not now")));
        let gate = ApprovalGate::new(ui);
        let outcome = gate
            .check(&AgentProfile::default(), "fs---write", "fs", "write", &json!({"path": "a"}), &CancellationToken::new())
            .await;
        let ApprovalOutcome::Denied { reason } = outcome else {
            panic!("expected denial");
        };
        let text = denial_text(reason.as_deref());
        assert!(text.contains("denied by user"));
        assert!(text.contains("not now"));
    }

    #[tokio::test]
    async fn test_always_answer_is_remembered() {
        let ui = ScriptedUi::new(ApprovalResponse {
            approved: true,
            user_input: Some("Always".to_string()),
        });
        let gate = ApprovalGate::new(ui.clone());
        let profile = AgentProfile::default();
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let outcome = gate
                .check(&profile, "git---commit", "git", "commit", &json!({}), &cancel)
                .await;
            assert!(outcome.is_approved());
        }
        assert_eq!(ui.asked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_helpers_never_prompt() {
        let ui = ScriptedUi::new(ApprovalResponse::deny(None));
        let gate = ApprovalGate::new(ui.clone());
        let outcome = gate
            .check(&AgentProfile::default(), "helpers---no_such_tool", "helpers", "no_such_tool", &json!({}), &CancellationToken::new())
            .await;
        assert_eq!(outcome, ApprovalOutcome::AutoApproved);
        assert_eq!(ui.asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let gate = ApprovalGate::new(Arc::new(PendingUi));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let outcome = gate
            .check(&AgentProfile::default(), "a---b", "a", "b", &json!({}), &cancel)
            .await;
        assert_eq!(outcome, ApprovalOutcome::Cancelled);
    }

    #[test]
    fn test_denial_text_without_reason() {
        assert_eq!(denial_text(None), "Tool execution denied by user.");
        assert_eq!(denial_text(Some("  ")), "Tool execution denied by user.");
    }
}
