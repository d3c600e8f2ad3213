//! Time budgets shared across a chain of dependent operations.
//!
//! Opening a link means opening a connection, then a session, then the link.
//! The caller grants one budget for the whole chain; every step receives only
//! what is left of it.

use std::{future::Future, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{engine::EngineError, error::TransportError};

/// A single time budget that shrinks as time passes.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left, zero once the budget is spent.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    /// Time left, or a timeout error naming `operation` when nothing is left.
    pub fn remaining_for(&self, operation: &'static str) -> Result<Duration, TransportError> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(TransportError::Timeout {
                operation,
                after: self.budget,
            });
        }
        Ok(remaining)
    }
}

/// Runs one engine call bounded by `timeout` and `cancel`.
///
/// Engine errors are translated at this point so no engine type leaks to the
/// caller.
pub async fn bounded<T, F>(
    operation: &'static str,
    timeout: Duration,
    cancel: &CancellationToken,
    call: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        result = tokio::time::timeout(timeout, call) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TransportError::from_engine(operation, e)),
            Err(_) => Err(TransportError::Timeout { operation, after: timeout }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineErrorKind;

    #[tokio::test(start_paused = true)]
    async fn test_remaining_shrinks() {
        let deadline = Deadline::after(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(deadline.remaining(), Duration::from_secs(6));

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(deadline.remaining(), Duration::ZERO);
        assert!(matches!(
            deadline.remaining_for("open link"),
            Err(TransportError::Timeout { operation: "open link", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = bounded("open session", Duration::from_secs(1), &cancel, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(
            result,
            Err(TransportError::Timeout { operation: "open session", .. })
        ));
    }

    #[tokio::test]
    async fn test_bounded_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = bounded("send", Duration::from_secs(1), &cancel, async {
            std::future::pending::<Result<(), EngineError>>().await
        })
        .await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }

    #[tokio::test]
    async fn test_bounded_translates_engine_errors() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = bounded("send", Duration::from_secs(1), &cancel, async {
            Err(EngineError::new(EngineErrorKind::Io, "broken pipe"))
        })
        .await;
        assert!(matches!(result, Err(TransportError::Network { operation: "send", .. })));
    }
}
