//! Reliability manager — bounded immediate retry around network operations.
//!
//! Every network-issuing operation (send-settings, send-summary, send-data,
//! send-result) runs under a [`RetryPolicy`]. Transport failures retry
//! immediately, with no backoff, until the attempt budget is spent; the
//! budget is per operation call, not shared across the run. Exhaustion
//! returns the last error as a definitive failure — the caller surfaces it
//! and aborts the current target, never retries again.

use std::future::Future;

use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts allowed, counting the first. The definitive failure
    /// is returned on the max_attempts-th failed attempt.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run `operation` until it succeeds or the attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(op = name, attempt, "operation recovered");
                    }
                    return Ok(value);
                }
                Err(error) if attempt < self.max_attempts => {
                    tracing::warn!(op = name, attempt, error = %error, "retrying");
                }
                Err(error) => {
                    return Err(error)
                        .with_context(|| format!("{name} failed after {attempt} attempts"));
                }
            }
        }
    }
}
