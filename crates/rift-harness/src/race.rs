//! First-of(operation, timer) racing.
//!
//! Used by wait steps, outbound connect attempts and hook chain timeouts. The
//! losing branch is dropped in place, so a late result is simply never
//! observed.

use std::future::Future;
use std::time::Duration;

/// The timer won the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timed out after {0:?}")]
pub struct TimedOut(pub Duration);

/// Race `operation` against a timer of length `limit`.
///
/// The operation is polled first, so an operation that is already complete
/// wins even with a zero limit.
pub async fn race<F>(operation: F, limit: Duration) -> Result<F::Output, TimedOut>
where
    F: Future,
{
    tokio::select! {
        biased;
        output = operation => Ok(output),
        _ = tokio::time::sleep(limit) => Err(TimedOut(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_operation_wins() {
        let result = race(async { 7 }, Duration::from_millis(50)).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_ready_operation_wins_zero_limit() {
        let result = race(std::future::ready("done"), Duration::ZERO).await;
        assert_eq!(result, Ok("done"));
    }

    #[tokio::test]
    async fn test_timer_wins_and_loser_is_discarded() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let result = race(
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                flag.store(true, Ordering::SeqCst);
            },
            Duration::from_millis(20),
        )
        .await;

        assert_eq!(result, Err(TimedOut(Duration::from_millis(20))));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }
}
