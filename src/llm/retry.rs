//! Retry wrapper around any [`LlmClient`].
//!
//! Only transient failures are retried (see [`LlmError::is_retryable`]);
//! authentication and not-found errors surface on the first attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, warn};

use super::{LlmClient, LlmResponse, Message, ToolDefinition};
use crate::backoff::Backoff;
use crate::error::LlmError;

pub struct RetryingClient {
    inner: Arc<dyn LlmClient>,
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryingClient {
    /// `max_attempts` counts the first call; values below 1 are treated as 1.
    pub fn new(
        inner: Arc<dyn LlmClient>,
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }
}

#[async_trait]
impl LlmClient for RetryingClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<LlmResponse, LlmError> {
        let mut backoff = Backoff::new(self.initial_delay, self.max_delay, 2);

        loop {
            let attempt = backoff.attempt + 1;
            let err = match self.inner.complete(messages, tools).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if !err.is_retryable() {
                error!("LLM call failed ({}): {err}", self.inner.description());
                return Err(err);
            }

            if attempt >= self.max_attempts {
                error!(
                    "LLM call failed after {attempt} attempts ({}): {err}",
                    self.inner.description()
                );
                return Err(LlmError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = backoff.next_delay();
            warn!(
                "LLM call failed ({}), attempt {attempt}/{}, retrying in {}ms: {err}",
                self.inner.description(),
                self.max_attempts,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn description(&self) -> String {
        self.inner.description()
    }
}
