//! Model provider interface and error classification.
//!
//! - `ModelProvider`: streams one model step as `ModelEvent`s
//! - `LlmError`: classified provider errors with retryability information
//! - `ProviderRegistry`: provider id to provider lookup

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::{MessageRequest, Usage};

// === Events ===

/// Why the model stopped producing output for a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    Other(String),
    Unknown,
}

impl FinishReason {
    /// Map an Anthropic-style `stop_reason`.
    pub fn from_stop_reason(reason: Option<&str>) -> Self {
        match reason {
            Some("end_turn" | "stop_sequence" | "stop") => Self::Stop,
            Some("max_tokens" | "length") => Self::Length,
            Some("tool_use" | "tool_calls") => Self::ToolCalls,
            Some("refusal" | "content_filter") => Self::ContentFilter,
            Some("error") => Self::Error,
            Some(other) => Self::Other(other.to_string()),
            None => Self::Unknown,
        }
    }
}

/// A tool call as the model emitted it; `input` is raw JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawToolCall {
    pub id: String,
    pub name: String,
    pub input: String,
}

/// One event of a streamed model step.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    TextDelta(String),
    ReasoningDelta(String),
    ToolInputStart { id: String, name: String },
    ToolCall(RawToolCall),
    /// Results are produced locally; providers that echo them are ignored.
    ToolResult { id: String, content: String },
    /// Usage for an intermediate step of a multi-step stream.
    StepFinish { usage: Usage },
    Error(LlmError),
    Finish { reason: FinishReason, usage: Usage },
}

pub type ModelEventStream = Pin<Box<dyn Stream<Item = ModelEvent> + Send + 'static>>;

// === Provider ===

/// A streaming model backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider id, e.g. "anthropic".
    fn id(&self) -> &str;

    /// Start one model step. The stream ends after `Finish` or `Error`.
    async fn stream(
        &self,
        request: MessageRequest,
        cancel: CancellationToken,
    ) -> Result<ModelEventStream, LlmError>;

    /// Whether `stream` has already retried a request before returning an
    /// error for it. The agent then does not retry that step again.
    fn retries_requests(&self) -> bool {
        false
    }
}

/// Providers by id.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    #[must_use]
    pub fn with(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

// === LlmError - Classified Error Types ===

/// Classified LLM errors with retryability information.
///
/// Rate limits and transient server errors are retryable; auth failures and
/// invalid requests fail immediately.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// HTTP 429, with the server's Retry-After when present
    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// HTTP 401, 403
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Invalid request ({status}): {message}")]
    InvalidRequest { status: u16, message: String },

    #[error("Model error: {0}")]
    ModelError(String),

    #[error("Content policy violation: {0}")]
    ContentPolicyError(String),

    #[error("Response parsing error: {0}")]
    ParseError(String),

    #[error("Context length exceeded: {0}")]
    ContextLengthError(String),

    /// The provider id in the profile is not registered.
    #[error("Unknown model provider '{0}'")]
    UnknownProvider(String),

    #[error("LLM error: {0}")]
    Other(String),
}

impl LlmError {
    /// Whether the error is potentially transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::ServerError { .. }
                | LlmError::NetworkError(_)
                | LlmError::Timeout(_)
        )
    }

    /// Credential problems get a distinct hint in the UI.
    pub fn is_authentication(&self) -> bool {
        matches!(self, LlmError::AuthenticationError(_))
    }

    /// Returns the server-suggested retry delay if available.
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify an HTTP error by status code and response body keywords.
    pub fn from_http_response(status: u16, body: &str) -> Self {
        match status {
            429 => LlmError::RateLimited {
                message: body.to_string(),
                retry_after: None,
            },
            401 | 403 => LlmError::AuthenticationError(body.to_string()),
            400 => {
                let body_lower = body.to_lowercase();
                if body_lower.contains("context_length")
                    || body_lower.contains("too long")
                    || body_lower.contains("maximum context")
                {
                    LlmError::ContextLengthError(body.to_string())
                } else if body_lower.contains("content_policy")
                    || body_lower.contains("safety")
                    || body_lower.contains("harmful")
                {
                    LlmError::ContentPolicyError(body.to_string())
                } else if body_lower.contains("model") && body_lower.contains("not found") {
                    LlmError::ModelError(body.to_string())
                } else {
                    LlmError::InvalidRequest {
                        status,
                        message: body.to_string(),
                    }
                }
            }
            404 => {
                if body.to_lowercase().contains("model") {
                    LlmError::ModelError(body.to_string())
                } else {
                    LlmError::InvalidRequest {
                        status,
                        message: body.to_string(),
                    }
                }
            }
            // 529 is Anthropic's "overloaded"
            500..=599 => LlmError::ServerError {
                status,
                message: body.to_string(),
            },
            _ => LlmError::Other(format!("HTTP {status}: {body}")),
        }
    }

    /// Classify with an optional Retry-After header value.
    pub fn from_http_response_with_retry_after(
        status: u16,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        let mut error = Self::from_http_response(status, body);
        if let LlmError::RateLimited {
            retry_after: ref mut ra,
            ..
        } = error
        {
            *ra = retry_after;
        }
        error
    }

    /// Map an error event from the stream (`{"type": "overloaded_error", ...}`).
    pub fn from_stream_error(error_type: &str, message: &str) -> Self {
        match error_type {
            "overloaded_error" | "api_error" => LlmError::ServerError {
                status: 529,
                message: message.to_string(),
            },
            "rate_limit_error" => LlmError::RateLimited {
                message: message.to_string(),
                retry_after: None,
            },
            "authentication_error" | "permission_error" => {
                LlmError::AuthenticationError(message.to_string())
            }
            "invalid_request_error" => LlmError::InvalidRequest {
                status: 400,
                message: message.to_string(),
            },
            _ => LlmError::Other(format!("{error_type}: {message}")),
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(Duration::from_secs(0))
        } else if err.is_connect() {
            LlmError::NetworkError(format!("Connection failed: {err}"))
        } else if err.is_request() || err.is_body() {
            LlmError::NetworkError(format!("Request failed: {err}"))
        } else {
            LlmError::Other(err.to_string())
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::from_reqwest(&err)
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::ParseError(err.to_string())
    }
}

// === Retry-After ===

/// Parse a Retry-After header given in seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let seconds = value.trim().parse::<f64>().ok()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

pub fn extract_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_retry_after)
}
