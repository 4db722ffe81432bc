//! HTTP client for Anthropic-compatible model APIs.
//!
//! Centralizes retry behavior, the base URL, and the translation of the
//! messages SSE stream into `ModelEvent`s.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RetryPolicy};
use crate::llm_client::{
    FinishReason, LlmError, ModelEvent, ModelEventStream, ModelProvider, RawToolCall,
    extract_retry_after,
};
use crate::logging;
use crate::models::{ContentBlockStart, Delta, MessageRequest, StreamEvent, Usage};
use crate::sse::SseParser;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client for Anthropic-compatible API requests.
#[derive(Clone)]
#[must_use]
pub struct AnthropicClient {
    http_client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

// === AnthropicClient ===

impl AnthropicClient {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_base_url(
            &config.anthropic_api_key()?,
            &config.anthropic_base_url(),
            config.retry_policy(),
        )
    }

    pub fn with_base_url(api_key: &str, base_url: &str, retry: RetryPolicy) -> Result<Self> {
        logging::info(format!("Model API base URL: {base_url}"));
        logging::info(format!(
            "Retry policy: enabled={}, max_retries={}, initial_delay={}s, max_delay={}s",
            retry.enabled, retry.max_retries, retry.initial_delay, retry.max_delay
        ));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-api-key", HeaderValue::from_str(api_key)?);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        })
    }
}

#[async_trait]
impl ModelProvider for AnthropicClient {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn retries_requests(&self) -> bool {
        self.retry.retry_budget() > 0
    }

    async fn stream(
        &self,
        request: MessageRequest,
        cancel: CancellationToken,
    ) -> Result<ModelEventStream, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let mut request = request;
        request.stream = Some(true);

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(LlmError::Other("request cancelled".to_string())),
            response = send_with_retry(&self.retry, || self.http_client.post(&url).json(&request)) => response?,
        };

        Ok(Box::pin(translate_events(
            parse_sse_stream(response.bytes_stream()),
            cancel,
        )))
    }
}

// === Retry + Streaming Helpers ===

async fn send_with_retry<F>(policy: &RetryPolicy, mut build: F) -> Result<reqwest::Response, LlmError>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut attempt: u32 = 0;

    loop {
        let error = match build().send().await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => {
                let status = response.status().as_u16();
                let retry_after = extract_retry_after(response.headers());
                let text = response
                    .text()
                    .await
                    .unwrap_or_else(|e| format!("(failed to read body: {e})"));
                LlmError::from_http_response_with_retry_after(status, &text, retry_after)
            }
            Err(err) => LlmError::from(err),
        };

        if !error.is_retryable() || attempt >= policy.retry_budget() {
            return Err(error);
        }
        logging::warn(format!(
            "{error} (attempt {} of {})",
            attempt + 1,
            policy.max_retries + 1
        ));

        let delay = error
            .suggested_retry_delay()
            .unwrap_or_else(|| policy.delay_for_attempt(attempt));
        attempt += 1;
        logging::info(format!("Retrying after {:.2}s", delay.as_secs_f64()));
        tokio::time::sleep(delay).await;
    }
}

/// Parse an SSE byte stream into wire-level stream events.
fn parse_sse_stream(
    stream: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Send + Unpin + 'static,
) -> impl Stream<Item = Result<StreamEvent, LlmError>> + Send + 'static {
    async_stream::stream! {
        let mut parser = SseParser::default();
        let mut stream = stream;

        while let Some(chunk_result) = stream.next().await {
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(LlmError::from(err));
                    return;
                }
            };
            for event in parser.feed(&chunk) {
                if event.data == "[DONE]" {
                    return;
                }
                match serde_json::from_str::<StreamEvent>(&event.data) {
                    Ok(event) => yield Ok(event),
                    Err(err) => {
                        tracing::warn!("Failed to parse SSE event: {err}");
                        tracing::debug!("Raw SSE data: {}", event.data);
                    }
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct PendingToolUse {
    id: String,
    name: String,
    input: String,
}

/// Translate wire events into `ModelEvent`s, checking `cancel` on every chunk.
fn translate_events(
    events: impl Stream<Item = Result<StreamEvent, LlmError>> + Send + 'static,
    cancel: CancellationToken,
) -> impl Stream<Item = ModelEvent> + Send + 'static {
    async_stream::stream! {
        let mut events = Box::pin(events);
        let mut tool_uses: HashMap<u32, PendingToolUse> = HashMap::new();
        let mut usage = Usage::default();
        let mut stop_reason: Option<String> = None;

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return,
                next = events.next() => next,
            };
            let Some(event) = next else {
                break;
            };
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    yield ModelEvent::Error(err);
                    return;
                }
            };

            match event {
                StreamEvent::MessageStart { message } => {
                    usage = message.usage;
                }
                StreamEvent::ContentBlockStart { index, content_block } => match content_block {
                    ContentBlockStart::Text { text } if !text.is_empty() => {
                        yield ModelEvent::TextDelta(text);
                    }
                    ContentBlockStart::Thinking { thinking } if !thinking.is_empty() => {
                        yield ModelEvent::ReasoningDelta(thinking);
                    }
                    ContentBlockStart::ToolUse { id, name, .. } => {
                        yield ModelEvent::ToolInputStart {
                            id: id.clone(),
                            name: name.clone(),
                        };
                        tool_uses.insert(index, PendingToolUse { id, name, input: String::new() });
                    }
                    _ => {}
                },
                StreamEvent::ContentBlockDelta { index, delta } => match delta {
                    Delta::TextDelta { text } => yield ModelEvent::TextDelta(text),
                    Delta::ThinkingDelta { thinking } => yield ModelEvent::ReasoningDelta(thinking),
                    Delta::InputJsonDelta { partial_json } => {
                        if let Some(pending) = tool_uses.get_mut(&index) {
                            pending.input.push_str(&partial_json);
                        }
                    }
                    Delta::SignatureDelta { .. } => {}
                },
                StreamEvent::ContentBlockStop { index } => {
                    if let Some(pending) = tool_uses.remove(&index) {
                        let input = if pending.input.trim().is_empty() {
                            "{}".to_string()
                        } else {
                            pending.input
                        };
                        yield ModelEvent::ToolCall(RawToolCall {
                            id: pending.id,
                            name: pending.name,
                            input,
                        });
                    }
                }
                StreamEvent::MessageDelta { delta, usage: delta_usage } => {
                    if delta.stop_reason.is_some() {
                        stop_reason = delta.stop_reason;
                    }
                    if let Some(delta_usage) = delta_usage {
                        usage.output_tokens = delta_usage.output_tokens;
                    }
                }
                StreamEvent::MessageStop => break,
                StreamEvent::Ping => {}
                StreamEvent::Error { error } => {
                    yield ModelEvent::Error(LlmError::from_stream_error(&error.error_type, &error.message));
                    return;
                }
            }
        }

        yield ModelEvent::Finish {
            reason: FinishReason::from_stop_reason(stop_reason.as_deref()),
            usage,
        };
    }
}
