use tokio::time::sleep;
use tokio::time::timeout;
use tracing::warn;

use crate::backoff::ExponentialBackoff;
use crate::BackoffPolicy;
use crate::Error;
use crate::Result;
use crate::SystemError;

/// Runs `task` until it succeeds, fails with a non-transient error, or the
/// policy is exhausted. Each attempt is bounded by `policy.timeout_ms`.
///
/// Non-transient errors (e.g. a rejected compare-and-swap) are returned
/// immediately so callers can react instead of repeating the same write.
pub(crate) async fn task_with_timeout_and_exponential_backoff<F, T, P>(
    task: F,
    policy: BackoffPolicy,
) -> Result<P>
where
    F: Fn() -> T,                               // The type of the async function
    T: std::future::Future<Output = Result<P>>, // The future returned by the async function
{
    let mut backoff = ExponentialBackoff::new(&policy);
    let mut attempts = 0;

    loop {
        let e = match timeout(policy.timeout(), task()).await {
            Ok(Ok(r)) => {
                return Ok(r); // Exit on success
            }
            Ok(Err(error)) if !error.is_transient() => {
                return Err(error);
            }
            Ok(Err(error)) => {
                warn!("failed with error: {:?}", &error);
                error
            }
            Err(elapsed) => {
                warn!("task_with_timeout_and_exponential_backoff timeout: {:?}", &elapsed);
                Error::System(SystemError::RetryTimeout)
            }
        };

        attempts += 1;
        if policy.is_exhausted(attempts) {
            warn!("Task failed after {} retries, last error: {:?}", attempts, e);
            return Err(Error::System(SystemError::RetryTaskFailed { attempts }));
        }
        sleep(backoff.next_delay()).await;
    }
}
