//! Error hint system for providing actionable error messages with recovery hints.
//!
//! Run-ending errors are surfaced to the user as log messages; this module
//! picks the suggestion that goes with them.

use crate::llm_client::LlmError;

/// Classification of error types for targeted hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// API rate limit exceeded
    RateLimit,
    /// Invalid or missing API key
    InvalidApiKey,
    /// Network connectivity issues
    NetworkError,
    /// Context too long for the model
    ContextTooLong,
    /// Tool execution failed
    ToolExecutionError,
    /// Path outside the task directory
    PermissionDenied,
}

/// A hint containing an error type, message, and suggested fix.
#[derive(Debug, Clone)]
pub struct ErrorHint {
    pub error_type: ErrorType,
    /// A user-friendly error message
    pub message: String,
    /// A suggested fix or recovery action
    pub suggestion: String,
}

impl ErrorHint {
    #[must_use]
    pub fn new(error_type: ErrorType, message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// One-line rendering used in log messages.
    #[must_use]
    pub fn render(&self) -> String {
        format!("{}. {}", self.message, self.suggestion)
    }
}

/// Hint for a classified provider error.
#[must_use]
pub fn hint_for_llm_error(err: &LlmError) -> Option<ErrorHint> {
    match err {
        LlmError::AuthenticationError(_) => Some(ErrorHint::new(
            ErrorType::InvalidApiKey,
            "Invalid API key",
            "Set DESK_AGENT_API_KEY or api_key in ~/.desk-agent/config.toml",
        )),
        LlmError::RateLimited { .. } => Some(ErrorHint::new(
            ErrorType::RateLimit,
            "Rate limit hit",
            "Wait a moment and retry, or lower the retry budget in the [retry] table",
        )),
        LlmError::ContextLengthError(_) => Some(ErrorHint::new(
            ErrorType::ContextTooLong,
            "Context full",
            "Drop context files or disable include_context_files in the profile",
        )),
        LlmError::NetworkError(_) | LlmError::Timeout(_) => Some(ErrorHint::new(
            ErrorType::NetworkError,
            "Network error",
            "Check your connection and base_url, then try again",
        )),
        LlmError::UnknownProvider(_) => Some(ErrorHint::new(
            ErrorType::InvalidApiKey,
            "Unknown provider",
            "Check the provider field of the agent profile",
        )),
        other => get_error_hint(&other.to_string()),
    }
}

/// Analyze an error message and return an appropriate hint with recovery suggestion.
#[must_use]
pub fn get_error_hint(error: &str) -> Option<ErrorHint> {
    let error_lower = error.to_lowercase();

    if error_lower.contains("429")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("overloaded")
    {
        return Some(ErrorHint::new(
            ErrorType::RateLimit,
            "Rate limit hit",
            "Wait a moment and retry",
        ));
    }

    if error_lower.contains("401")
        || error_lower.contains("unauthorized")
        || error_lower.contains("invalid api key")
        || error_lower.contains("authentication failed")
        || error_lower.contains("api key missing")
    {
        return Some(ErrorHint::new(
            ErrorType::InvalidApiKey,
            "Invalid API key",
            "Set DESK_AGENT_API_KEY or api_key in ~/.desk-agent/config.toml",
        ));
    }

    // Checked before network since "resolve" can overlap
    if error_lower.contains("path escapes workspace") || error_lower.contains("outside workspace") {
        return Some(ErrorHint::new(
            ErrorType::PermissionDenied,
            "Path outside the task directory",
            "Enable trust_mode in the profile to allow it",
        ));
    }

    if error_lower.contains("network")
        || error_lower.contains("connection")
        || error_lower.contains("timed out")
        || error_lower.contains("dns")
        || error_lower.contains("unreachable")
        || error_lower.contains("refused")
    {
        return Some(ErrorHint::new(
            ErrorType::NetworkError,
            "Network error",
            "Check your connection and try again",
        ));
    }

    if error_lower.contains("context")
        && (error_lower.contains("too long")
            || error_lower.contains("token limit")
            || error_lower.contains("exceeds"))
    {
        return Some(ErrorHint::new(
            ErrorType::ContextTooLong,
            "Context full",
            "Drop context files or disable include_context_files in the profile",
        ));
    }

    if error_lower.contains("mcp") {
        return Some(ErrorHint::new(
            ErrorType::ToolExecutionError,
            "MCP server failed",
            "Run `desk-agent mcp list` to check the server configuration",
        ));
    }

    if error_lower.contains("failed to execute tool") || error_lower.contains("tool error") {
        return Some(ErrorHint::new(
            ErrorType::ToolExecutionError,
            "Tool execution failed",
            "Check the error details and try again with different input",
        ));
    }

    None
}
