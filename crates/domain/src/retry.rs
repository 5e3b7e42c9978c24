//! Caller-side retry for optimistic-concurrency conflicts.

use std::future::Future;

use crate::error::DomainError;

/// Runs `operation` until it succeeds, fails with a non-retriable error, or
/// has been attempted `limit` times.
///
/// `operation` must be the whole load-modify-save sequence: each attempt
/// reloads the aggregate and reapplies the business decision to the fresh
/// state. Only `ConcurrencyConflict` triggers another attempt.
pub async fn retry_on_conflict<T, F, Fut>(limit: u32, mut operation: F) -> Result<T, DomainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DomainError>>,
{
    let limit = limit.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(error) if error.is_retriable() && attempt < limit => {
                tracing::warn!(attempt, limit, %error, "retrying after concurrency conflict");
                attempt += 1;
            }
            other => return other,
        }
    }
}
