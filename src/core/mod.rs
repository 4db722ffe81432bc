//! The agent itself, separated from any front end:
//!
//! - `engine`: `Agent` and the run loop
//! - `events`: what the agent reports to the UI
//! - `approval`: the per-run approval gate
//! - `rate_limit`: spacing between tool calls
//! - `tool_parser` / `repair`: turning model tool calls into executable ones
//! - `messages`: history and system prompt for a step
//! - `context`: task state the agent reads
//! - `turn`: per-run bookkeeping

pub mod approval;
pub mod context;
pub mod engine;
pub mod events;
pub mod messages;
pub mod rate_limit;
pub mod repair;
pub mod tool_parser;
pub mod turn;

pub use approval::{
    APPROVE_ALWAYS, ApprovalGate, ApprovalOutcome, ApprovalResponse, ApprovalUi, AutoApprove, denial_text,
};
pub use context::{ContextFile, LocalTaskContext, TaskContext};
pub use engine::{Agent, RunOutcome, StopReason};
pub use events::{AgentUi, ChannelUi, Event, LogLevel, ResponseMessage, ToolMessage};
pub use rate_limit::RateLimiter;
pub use tool_parser::{ParsedToolCall, ToolCallError};
pub use turn::ToolCallRecord;
