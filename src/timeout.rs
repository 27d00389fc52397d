use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::errors::ControllerTimeoutError;

/// Track a cumulative timeout across a series of operations.
///
/// Spawning a lab or creating a file server issues many Kubernetes calls,
/// each of which supports an individual timeout, while the whole sequence
/// must complete within one overall budget. A `Timeout` is created once for
/// the logical operation and threaded through every call so that a single
/// clock governs all of them.
#[derive(Debug, Clone)]
pub struct Timeout {
    operation: String,
    user: Option<String>,
    duration: Duration,
    start: Instant,
    started_at: DateTime<Utc>,
}

impl Timeout {
    pub fn new(operation: impl Into<String>, duration: Duration, user: Option<&str>) -> Self {
        Timeout {
            operation: operation.into(),
            user: user.map(str::to_string),
            duration,
            start: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Seconds elapsed since the timeout started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Remaining budget, or the domain timeout error if it has expired.
    pub fn left(&self) -> Result<Duration, ControllerTimeoutError> {
        match self.duration.checked_sub(self.start.elapsed()) {
            Some(left) if !left.is_zero() => Ok(left),
            _ => Err(self.error()),
        }
    }

    /// Run a future under the remaining budget, translating expiry into the
    /// domain timeout error with operation context.
    pub async fn enforce<F, T, E>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<ControllerTimeoutError>,
    {
        let left = self.left()?;
        match tokio::time::timeout(left, fut).await {
            Ok(result) => result,
            Err(_) => Err(self.error().into()),
        }
    }

    /// Create a child timeout capped at the remaining duration of this one.
    ///
    /// Used when a sub-operation should get a smaller budget than the whole,
    /// such as the final existence check after a deletion watch expires.
    pub fn partial(&self, duration: Duration) -> Result<Timeout, ControllerTimeoutError> {
        let left = self.left()?;
        Ok(Timeout {
            operation: self.operation.clone(),
            user: self.user.clone(),
            duration: duration.min(left),
            start: Instant::now(),
            started_at: Utc::now(),
        })
    }

    pub fn error(&self) -> ControllerTimeoutError {
        ControllerTimeoutError {
            operation: self.operation.clone(),
            user: self.user.clone(),
            started_at: self.started_at,
            failed_at: Utc::now(),
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_left_and_elapsed() {
        let timeout = Timeout::new("test", Duration::from_secs(60), Some("someuser"));
        let left = timeout.left().unwrap();
        assert!(left <= Duration::from_secs(60));
        assert!(left > Duration::from_secs(59));
        assert!(timeout.elapsed() < Duration::from_secs(1));
        assert_eq!(timeout.operation(), "test");
        assert_eq!(timeout.user(), Some("someuser"));
    }

    #[tokio::test]
    async fn test_expired() {
        tokio::time::pause();
        let timeout = Timeout::new("test", Duration::from_secs(5), None);
        tokio::time::advance(Duration::from_secs(6)).await;
        let err = timeout.left().unwrap_err();
        assert_eq!(err.operation, "test");
        assert!(err.user.is_none());
    }

    #[tokio::test]
    async fn test_partial_is_capped() {
        tokio::time::pause();
        let timeout = Timeout::new("test", Duration::from_secs(10), Some("someuser"));
        tokio::time::advance(Duration::from_secs(7)).await;
        let child = timeout.partial(Duration::from_secs(30)).unwrap();
        assert!(child.left().unwrap() <= Duration::from_secs(3));
        let child = timeout.partial(Duration::from_secs(1)).unwrap();
        assert!(child.left().unwrap() <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_enforce_translates_expiry() {
        tokio::time::pause();
        let timeout = Timeout::new("spawn lab", Duration::from_millis(50), Some("someuser"));
        let result: Result<(), ControllerTimeoutError> = timeout
            .enforce(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.operation, "spawn lab");
        assert_eq!(err.user.as_deref(), Some("someuser"));
    }
}
