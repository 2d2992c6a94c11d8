use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RouterError};

/// Cadence and deadline for a bounded wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSchedule {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Repeatedly fetch fresh state until `done` accepts it.
///
/// The first fetch happens immediately. Fails with [`RouterError::Timeout`] once the deadline
/// passes without `done` accepting a value, and with [`RouterError::Cancelled`] when `cancel`
/// fires between polls. Fetch errors are returned as-is.
pub async fn until<T, F, Fut, C>(
    operation: &str,
    schedule: PollSchedule,
    cancel: &CancellationToken,
    mut fetch: F,
    mut done: C,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    C: FnMut(&T) -> bool,
{
    let deadline = Instant::now() + schedule.timeout;

    loop {
        let value = fetch().await?;
        if done(&value) {
            return Ok(value);
        }

        if Instant::now() >= deadline {
            return Err(RouterError::timeout(operation, schedule.timeout));
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RouterError::Cancelled(operation.to_string()));
            }
            _ = tokio::time::sleep(schedule.interval) => {}
        }
    }
}
