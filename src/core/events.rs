//! Messages the agent emits to the UI.
//!
//! The agent never renders anything itself. It reports streamed answer text,
//! tool lifecycle and log lines through an `AgentUi`; `ChannelUi` turns those
//! calls into `Event`s on a channel for front ends that prefer to poll.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::models::UsageReport;

/// Prefix of the first reasoning chunk of a step.
pub const THINKING_START_MARKER: &str = "---\n► **THINKING**\n";
/// Prefix of the first answer chunk after reasoning.
pub const ANSWER_START_MARKER: &str = "---\n► **ANSWER**\n";

/// A partial or final piece of the assistant's answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    /// Stable for all chunks of one model step.
    pub id: String,
    pub action: &'static str,
    pub content: String,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_report: Option<UsageReport>,
}

impl ResponseMessage {
    pub fn chunk(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: "response",
            content: content.into(),
            finished: false,
            usage_report: None,
        }
    }

    pub fn finished(id: impl Into<String>, usage_report: Option<UsageReport>) -> Self {
        Self {
            finished: true,
            usage_report,
            ..Self::chunk(id, "")
        }
    }
}

/// Tool call lifecycle. Sent once without a result when the call starts and
/// again with the result when it completes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMessage {
    pub tool_call_id: String,
    pub server_name: String,
    pub tool_name: String,
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_report: Option<UsageReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    /// Progress indicator; `None` text clears it.
    Loading,
}

/// Sink for everything the agent reports while running.
pub trait AgentUi: Send + Sync {
    fn process_response_message(&self, message: ResponseMessage);

    fn add_tool_message(&self, message: ToolMessage);

    fn add_log_message(&self, level: LogLevel, text: Option<String>);
}

/// Events emitted by the agent to update the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Response(ResponseMessage),
    Tool(ToolMessage),
    Log { level: LogLevel, text: Option<String> },
}

impl Event {
    pub fn error(message: impl Into<String>) -> Self {
        Event::Log {
            level: LogLevel::Error,
            text: Some(message.into()),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Event::Log {
            level: LogLevel::Info,
            text: Some(message.into()),
        }
    }
}

/// Forwards every UI call as an `Event`. Events sent after the receiver is
/// dropped are discarded.
#[derive(Debug, Clone)]
pub struct ChannelUi {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelUi {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl AgentUi for ChannelUi {
    fn process_response_message(&self, message: ResponseMessage) {
        self.send(Event::Response(message));
    }

    fn add_tool_message(&self, message: ToolMessage) {
        self.send(Event::Tool(message));
    }

    fn add_log_message(&self, level: LogLevel, text: Option<String>) {
        self.send(Event::Log { level, text });
    }
}
