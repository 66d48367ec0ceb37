//! Exponential backoff around a single height's fetch-derive-commit cycle.

use crate::runtime::config::SyncConfig;
use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: usize,
    pub cancellation: Option<CancellationToken>,
}

impl RetryPolicy {
    pub(crate) fn from_config(config: &SyncConfig) -> Self {
        Self {
            initial_delay: config.fetch_initial_backoff(),
            max_delay: config.fetch_max_backoff(),
            max_attempts: config.fetch_attempts(),
            cancellation: None,
        }
    }

    pub(crate) fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

pub(crate) enum RetryDisposition {
    Retry,
    Abort,
}

/// Runs `operation` until it succeeds, `classify_error` aborts, or the attempt
/// budget is spent. `on_retry` sees each failure along with whether another
/// attempt follows.
pub(crate) async fn retry_with_backoff<T, F, Fut, L, C>(
    policy: &RetryPolicy,
    mut operation: F,
    mut on_retry: L,
    mut classify_error: C,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
    L: FnMut(usize, Duration, &anyhow::Error, bool),
    C: FnMut(&anyhow::Error) -> RetryDisposition,
{
    let mut attempt = 0;
    let mut backoff = policy.initial_delay;

    loop {
        attempt += 1;

        if let Some(token) = &policy.cancellation {
            if token.is_cancelled() {
                return Err(anyhow!("retry cancelled"));
            }
        }

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if let RetryDisposition::Abort = classify_error(&err) {
            return Err(err);
        }

        let exhausted = attempt >= policy.max_attempts;
        on_retry(attempt, backoff, &err, !exhausted);
        if exhausted {
            return Err(err);
        }

        sleep_with_cancellation(backoff, policy.cancellation.as_ref()).await?;
        backoff = next_backoff(backoff, policy.max_delay);
    }
}

async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: Option<&CancellationToken>,
) -> Result<()> {
    if delay.is_zero() {
        yield_now().await;
        return Ok(());
    }

    match cancellation {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(anyhow!("retry cancelled")),
            _ = sleep(delay) => Ok(()),
        },
        None => {
            sleep(delay).await;
            Ok(())
        }
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }
    current.saturating_mul(2).min(max_backoff)
}
