//! One LLM round-trip to fix a tool call that could not be parsed.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::llm_client::{ModelEvent, ModelProvider, RawToolCall};
use crate::models::{Message, MessageRequest};

/// Replays a failed call and its error to the model and asks for it again.
pub struct ToolCallRepairer {
    provider: Arc<dyn ModelProvider>,
    /// The request of the step that produced the call.
    request: MessageRequest,
}

impl ToolCallRepairer {
    pub fn new(provider: Arc<dyn ModelProvider>, request: MessageRequest) -> Self {
        Self { provider, request }
    }

    /// The reissued call, keeping the original call id, or `None` when the
    /// model did not produce one.
    pub async fn repair(
        &self,
        call: &RawToolCall,
        error: &str,
        cancel: &CancellationToken,
    ) -> Option<RawToolCall> {
        tracing::info!(tool = %call.name, "Attempting tool call repair: {error}");

        let mut request = self.request.clone();
        request.messages.push(Message::user(format!(
            "Your previous tool call could not be executed.\n\
             Tool: {}\nArguments: {}\nError: {error}\n\n\
             Reissue the tool call with a valid tool name and arguments.",
            call.name, call.input
        )));
        request.tool_choice = Some(serde_json::json!({"type": "any"}));

        let mut stream = match self.provider.stream(request, cancel.child_token()).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!("Tool call repair request failed: {err}");
                return None;
            }
        };

        while let Some(event) = stream.next().await {
            match event {
                ModelEvent::ToolCall(repaired) => {
                    tracing::debug!(tool = %repaired.name, "Model reissued tool call");
                    return Some(RawToolCall {
                        id: call.id.clone(),
                        ..repaired
                    });
                }
                ModelEvent::Error(err) => {
                    tracing::warn!("Tool call repair stream failed: {err}");
                    return None;
                }
                ModelEvent::Finish { .. } => break,
                _ => {}
            }
        }
        None
    }
}
