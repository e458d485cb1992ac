//! Timeout-bounded polling
//!
//! Every wait in the engine (node readiness, drain completion, pod deletion)
//! goes through [`wait_with_timeout`]. A `None` timeout waits forever; upgrade
//! step timeouts are unbounded unless the operator sets one.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::{Error, Result};

/// Result of one poll: `Ok(Some(v))` done, `Ok(None)` keep polling, `Err` fatal
pub type PollResult<T> = Result<Option<T>>;

/// Poll `check_fn` every `interval` until it yields a value
///
/// Returns `Error::Timeout` naming `description` once `timeout` has elapsed.
/// Errors from `check_fn` abort the wait immediately.
pub async fn wait_with_timeout<T, F, Fut>(
    timeout: Option<Duration>,
    interval: Duration,
    description: &str,
    mut check_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    let start = Instant::now();

    loop {
        if let Some(timeout) = timeout {
            if start.elapsed() > timeout {
                return Err(Error::timeout(description));
            }
        }

        match check_fn().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {
                debug!("Waiting for {}...", description);
                tokio::time::sleep(interval).await;
            }
            Err(e) => return Err(e.context(format!("waiting for {}", description))),
        }
    }
}

/// Run `fut` under an optional deadline, mapping expiry to `Error::Timeout`
pub async fn with_deadline<T, Fut>(timeout: Option<Duration>, step: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| Error::timeout(step))?,
        None => fut.await,
    }
}
