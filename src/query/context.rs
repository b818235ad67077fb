use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation signal plus an optional deadline bounding a unit of work.
#[derive(Debug, Clone)]
pub struct QueryContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl QueryContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Child context: cancelled with its parent, and additionally bounded by
    /// `timeout` from now. The earlier deadline wins.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|timeout| Instant::now() + timeout);
        let deadline = match (self.deadline, own) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (parent, own) => parent.or(own),
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        self.deadline = Some(self.deadline.map_or(own, |current| current.min(own)));
        self
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drive `future` until it completes, the context is cancelled, or the
    /// deadline passes. An interrupted future is dropped.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, Interrupted> {
        if self.cancel.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => Err(Interrupted::DeadlineExceeded),
                    output = future => Ok(output),
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
                    output = future => Ok(output),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = QueryContext::background();
        assert_eq!(ctx.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_child() {
        let parent = QueryContext::background();
        let child = parent.child(None);
        parent.cancel();

        assert!(child.is_cancelled());
        let result = child.run(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let parent = QueryContext::background();
        let child = parent.child(None);
        child.cancel();

        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let ctx = QueryContext::background().child(Some(Duration::from_millis(50)));
        let result = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Interrupted::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_deadline_wins() {
        let parent = QueryContext::background().with_timeout(Duration::from_secs(1));
        let child = parent.child(Some(Duration::from_secs(60)));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
