//! Bounded retries for calls to external collaborators.

use anyhow::{Result, anyhow};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How many times to try an external call and how long each attempt may take.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub timeout: Duration,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, timeout: Duration, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            timeout,
            backoff,
        }
    }

    /// A single attempt bounded by `timeout`.
    pub fn once(timeout: Duration) -> Self {
        Self::new(1, timeout, Duration::ZERO)
    }

    /// Runs `op` until it succeeds or the attempts are exhausted.
    ///
    /// Every attempt is bounded by the policy timeout; the backoff grows
    /// linearly with the attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = anyhow!("{label} was never attempted");
        for attempt in 1..=self.attempts {
            match tokio::time::timeout(self.timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = anyhow!("{label} timed out after {:?}", self.timeout),
            }
            if attempt < self.attempts {
                warn!(%label, attempt, error = %last_error, "External call failed, retrying");
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }
        Err(last_error.context(format!("{label} failed after {} attempt(s)", self.attempts)))
    }
}
