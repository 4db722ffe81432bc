//! Minimum spacing between tool invocations.
//!
//! One limiter is shared by every run of an `Agent`, so the spacing holds
//! across all tools and servers, not per tool.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct RateLimiter {
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `min_interval` has passed since the previous call, then mark
    /// this call. Returns false when cancelled while waiting.
    pub async fn wait(&self, min_interval: Duration, cancel: &CancellationToken) -> bool {
        if min_interval.is_zero() {
            self.mark();
            return true;
        }

        loop {
            let remaining = {
                let mut last = self.last();
                let now = Instant::now();
                match *last {
                    Some(at) if now.duration_since(at) < min_interval => {
                        min_interval - now.duration_since(at)
                    }
                    _ => {
                        *last = Some(now);
                        return true;
                    }
                }
            };

            tracing::debug!(delay_ms = remaining.as_millis() as u64, "Delaying tool call");
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(remaining) => {}
            }
        }
    }

    fn mark(&self) {
        *self.last() = Some(Instant::now());
    }

    fn last(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_call
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
