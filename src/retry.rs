use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};

/// Exponential backoff applied to retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_times: usize,
    pub base: Duration,
    pub factor: f32,
    pub cap: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_times: 3,
            base: Duration::from_millis(500),
            factor: 2.0,
            cap: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_times: 0,
            ..Self::default()
        }
    }

    /// Short delays for tests and local networks.
    pub fn fast(max_times: usize) -> Self {
        Self {
            max_times,
            base: Duration::from_millis(5),
            factor: 2.0,
            cap: Duration::from_millis(50),
            jitter: false,
        }
    }
}

pub fn new_backoff(policy: &RetryPolicy) -> ExponentialBuilder {
    let backoff = ExponentialBuilder::new()
        .with_min_delay(policy.base)
        .with_factor(policy.factor)
        .with_max_delay(policy.cap)
        .with_max_times(policy.max_times);
    if policy.jitter {
        backoff.with_jitter()
    } else {
        backoff
    }
}

pub fn notify(action: &str) -> impl FnMut(&Error, Duration) {
    move |e, d| {
        warn!("Retrying {} due to {} after {:?}", action, e, d);
    }
}

pub fn retryable(cancel_token: CancellationToken) -> impl FnMut(&Error) -> bool {
    move |e| e.is_retryable() && !cancel_token.is_cancelled()
}

pub async fn retry<T, F, Fut>(
    operation: F,
    action: &str,
    backoff: ExponentialBuilder,
    cancel_token: CancellationToken,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
    F: FnMut() -> Fut,
{
    operation
        .retry(backoff)
        .notify(notify(action))
        .when(retryable(cancel_token))
        .await
}
