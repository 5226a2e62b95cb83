//! Cooperative cancellation helpers for the turn loop.

use tokio_util::sync::CancellationToken;

pub type RunCancellationToken = CancellationToken;

/// Outcome of racing a future against a cancellation token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelAware<T> {
    Value(T),
    Cancelled,
}

pub fn is_cancelled(token: &RunCancellationToken) -> bool {
    token.is_cancelled()
}

/// Link an internal token to an optional external one: aborting either
/// aborts the internal.
pub fn linked_token(external: Option<&RunCancellationToken>) -> RunCancellationToken {
    match external {
        Some(token) => token.child_token(),
        None => RunCancellationToken::new(),
    }
}

pub async fn await_or_cancel<T, F>(token: &RunCancellationToken, fut: F) -> CancelAware<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        _ = token.cancelled() => CancelAware::Cancelled,
        value = fut => CancelAware::Value(value),
    }
}
