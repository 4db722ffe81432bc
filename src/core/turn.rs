//! Per-run bookkeeping.
//!
//! A run is one prompt and every model step it takes until a terminal
//! condition; each step may produce a batch of tool calls.

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::models::{Usage, UsageReport};

use super::approval::ApprovalOutcome;

/// One tool call from creation to completion.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_call_id: String,
    /// Composite `server---tool` id that was executed.
    pub tool_name: String,
    pub arguments: Value,
    pub result: Option<String>,
    pub error: Option<String>,
    pub approval: Option<ApprovalOutcome>,
    pub duration: Option<Duration>,
}

impl ToolCallRecord {
    pub fn new(tool_call_id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            arguments,
            result: None,
            error: None,
            approval: None,
            duration: None,
        }
    }

    pub fn set_result(&mut self, result: String, duration: Duration) {
        self.result = Some(result);
        self.duration = Some(duration);
    }

    pub fn set_error(&mut self, error: String, duration: Duration) {
        self.error = Some(error);
        self.duration = Some(duration);
    }

    /// Text fed back to the model.
    pub fn output(&self) -> &str {
        self.error
            .as_deref()
            .or(self.result.as_deref())
            .unwrap_or_default()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// State accumulated over one run.
#[derive(Debug)]
pub struct TurnContext {
    pub id: String,
    pub started_at: Instant,
    /// Model steps taken so far.
    pub step: u32,
    pub max_steps: u32,
    pub tool_calls: Vec<ToolCallRecord>,
    pub usage: Usage,
    pub total_cost: f64,
}

impl TurnContext {
    pub fn new(max_steps: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: Instant::now(),
            step: 0,
            max_steps,
            tool_calls: Vec::new(),
            usage: Usage::default(),
            total_cost: 0.0,
        }
    }

    pub fn next_step(&mut self) {
        self.step += 1;
    }

    pub fn at_max_steps(&self) -> bool {
        self.step >= self.max_steps
    }

    pub fn record_tool_call(&mut self, call: ToolCallRecord) {
        self.tool_calls.push(call);
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Fold one step's usage and cost in and return the report for it.
    pub fn add_step(&mut self, usage: &Usage, cost: f64) -> UsageReport {
        self.usage.add(usage);
        self.total_cost += cost;
        UsageReport {
            sent_tokens: usage.input_tokens,
            received_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_input_tokens,
            cache_write_tokens: usage.cache_creation_input_tokens,
            message_cost: cost,
            total_cost: self.total_cost,
        }
    }
}
