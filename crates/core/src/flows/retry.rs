use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::EngineConfig;
use crate::errors::ExternalCallError;

/// Retry schedule for transient outbound failures, bounded by the turn deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Runs `operation`, retrying retryable errors with linear backoff while the deadline allows.
    pub async fn run<T, F, Fut>(
        &self,
        deadline: Instant,
        label: &str,
        mut operation: F,
    ) -> Result<T, ExternalCallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExternalCallError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let wait = self.backoff * attempt;
                    if Instant::now() + wait >= deadline {
                        return Err(error);
                    }
                    debug!(
                        event_name = "engine.call.retry",
                        call = label,
                        attempt,
                        error = %error,
                        "retrying outbound call"
                    );
                    sleep(wait).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
