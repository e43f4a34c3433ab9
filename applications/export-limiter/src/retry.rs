//! Bounded retry for field-bus operations.
//!
//! Each attempt runs under its own timeout; attempts are separated by a fixed
//! backoff. The helper hands back the last error once attempts are spent and
//! never substitutes a cached value.

use crate::error::LinkError;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

pub type AttemptFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LinkError>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(10),
            backoff: Duration::from_millis(500),
        }
    }
}

/// Run `attempt` against `state` until it succeeds, fails with a
/// non-retryable error, or `policy.max_attempts` is reached.
pub async fn retry<S, T, F>(
    policy: &RetryPolicy,
    op: &str,
    state: &mut S,
    mut attempt: F,
) -> Result<T, LinkError>
where
    S: Send,
    F: for<'a> FnMut(&'a mut S) -> AttemptFuture<'a, T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut n = 1;

    loop {
        let result = match tokio::time::timeout(policy.timeout, attempt(state)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(policy.timeout)),
        };

        let err = match result {
            Ok(value) => {
                if n > 1 {
                    debug!(op, attempt = n, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            warn!(op, attempt = n, error = %err, "not retrying");
            return Err(err);
        }
        if n >= max_attempts {
            warn!(op, attempts = n, error = %err, "giving up");
            return Err(err);
        }

        debug!(op, attempt = n, max_attempts, error = %err, "attempt failed; backing off");
        tokio::time::sleep(policy.backoff).await;
        n += 1;
    }
}
