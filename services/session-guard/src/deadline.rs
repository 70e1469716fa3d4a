//! Per-call deadline for state store operations

use std::future::Future;
use std::time::Duration;

use common::StoreResult;

use crate::error::{GuardError, GuardResult};

/// Run a store call, failing with [`GuardError::Timeout`] once `timeout_ms`
/// elapses
pub(crate) async fn within<T, F>(timeout_ms: u64, call: F) -> GuardResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(GuardError::Timeout(timeout_ms)),
    }
}
