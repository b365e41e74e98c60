//! Automatic error recovery strategies.
//
// The batch runner uses these to put the SMU back into a known state after a
// rejected command or a timed-out sweep before moving on to the next pixel.

use crate::error::DaqError;
use crate::instrument::InstrumentSession;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of retry attempts.
    pub max_attempts: u32,
    /// The delay between retry attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

/// Something that can be brought back to a known state.
#[async_trait]
pub trait Recoverable<E> {
    async fn recover(&mut self) -> Result<(), E>;
}

#[async_trait]
impl Recoverable<DaqError> for InstrumentSession {
    async fn recover(&mut self) -> Result<(), DaqError> {
        self.reset().await
    }
}

/// Retry `recover()` according to `policy`; returns the last error when every
/// attempt fails.
pub async fn recover_with_retry<T>(
    recoverable: &mut T,
    policy: &RetryPolicy,
) -> Result<(), DaqError>
where
    T: Recoverable<DaqError> + Send,
{
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        match recoverable.recover().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Recovery attempt failed"
                );
                last_error = Some(e);
            }
        }
        if attempt < policy.max_attempts {
            sleep(policy.backoff_delay).await;
        }
    }
    Err(last_error.unwrap_or_else(|| {
        DaqError::Instrument(format!(
            "Failed to recover after {} attempts.",
            policy.max_attempts
        ))
    }))
}
