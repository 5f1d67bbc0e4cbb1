//! Store writes with bounded retry
//!
//! A failed write is retried with exponential backoff a fixed number of
//! times before the error is handed back to the caller.

use std::future::Future;

use courier_common::{DeliveryAttempt, MessageRequest, tracing::warn};
use courier_store::StoreError;

use crate::{policy::backoff::backoff_step, processor::Dispatcher};

async fn with_retry<T, F, Fut>(
    dispatcher: &Dispatcher,
    operation: &'static str,
    mut write: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = dispatcher.config.storage_retry_attempts.max(1);
    let base = dispatcher.config.storage_retry_base();
    let max = base.saturating_mul(64);

    let mut attempt = 1;
    loop {
        match write().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                let delay = backoff_step(attempt, base, max);
                warn!(
                    operation,
                    attempt,
                    retry_in_ms = delay.as_millis(),
                    error = %e,
                    "Store write failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Persist the message record
pub(crate) async fn save(
    dispatcher: &Dispatcher,
    message: &MessageRequest,
) -> Result<(), StoreError> {
    with_retry(dispatcher, "upsert", || dispatcher.store.upsert(message)).await
}

/// Append to the attempt log; `false` if the attempt was already logged
pub(crate) async fn append(
    dispatcher: &Dispatcher,
    attempt: &DeliveryAttempt,
) -> Result<bool, StoreError> {
    with_retry(dispatcher, "append_attempt", || {
        dispatcher.store.append_attempt(attempt)
    })
    .await
}
