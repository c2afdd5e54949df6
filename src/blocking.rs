//! Bounded execution of blocking calls from async code.

use crate::error::{FixError, Result};
use std::time::{Duration, Instant};
use tracing::warn;

/// Run a blocking closure on the blocking pool with a timeout.
///
/// On timeout the closure keeps running detached; callers that own resources
/// created by it must reclaim them separately.
pub async fn run_blocking<T, F>(operation: &str, timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let start = Instant::now();
    let handle = tokio::task::spawn_blocking(f);

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(FixError::Other(anyhow::anyhow!(
            "{operation} panicked: {e}"
        ))),
        Err(_elapsed) => {
            warn!(operation, timeout_secs = timeout.as_secs(), "Blocking operation timed out");
            Err(FixError::timeout(operation, start.elapsed()))
        }
    }
}
