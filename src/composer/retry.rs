//! Step retry with exponential backoff

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::time::sleep;
use tracing::debug;

use crate::context::CallContext;

/// Backoff delay grows up to this multiple of the initial delay
const MAX_DELAY_FACTOR: u32 = 60;

/// Retry policy for one step
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
        }
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.initial_delay * MAX_DELAY_FACTOR)
            .with_factor(2.0)
            .with_max_times(self.max_retries as usize)
            .build()
    }
}

/// Run `f` until it succeeds or the policy is exhausted.
///
/// Returns the final outcome and the number of retries performed. Backoff
/// sleeps end early when `ctx` is interrupted, returning the last error.
pub(crate) async fn with_retry<F, Fut, T, E>(
    ctx: &CallContext,
    policy: RetryPolicy,
    name: &str,
    mut f: F,
) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut backoff = policy.backoff();
    let mut retries = 0u32;

    loop {
        match f().await {
            Ok(result) => return (Ok(result), retries),
            Err(e) => {
                let Some(delay) = backoff.next() else {
                    if retries > 0 {
                        debug!(operation = name, attempts = retries + 1, "Max retry attempts reached");
                    }
                    return (Err(e), retries);
                };

                debug!(
                    operation = name,
                    attempt = retries + 1,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Retrying after backoff"
                );
                if ctx.run(sleep(delay)).await.is_err() {
                    return (Err(e), retries);
                }
                retries += 1;
            }
        }
    }
}
