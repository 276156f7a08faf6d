//! Retry and backoff policies shared by the raw memento store adapters.
//!
//! Store writes happen on the persistence worker and reads happen on the
//! rebind thread. Adapters doing plain blocking I/O use [`retry_blocking`];
//! adapters that drive an async SDK on their own runtime block on
//! [`with_backoff`] so the delay between attempts runs on that runtime.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum attempts made by [`retry_blocking`] and [`with_backoff`] regardless of policy.
pub const MAX_ATTEMPTS: usize = 5;

/// Common retry error types
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' exceeded maximum retry attempts: {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Transient error in '{operation}': {source}")]
    Transient {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RetryError {
    /// Whether the error is worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, RetryError::Transient { .. })
    }

    /// Unwrap the underlying cause, discarding the retry classification.
    pub fn into_source(self) -> Box<dyn std::error::Error + Send + Sync> {
        match self {
            RetryError::MaxRetriesExceeded { source, .. }
            | RetryError::Transient { source, .. }
            | RetryError::Permanent { source, .. } => source,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Boxed future for retry operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = RetryResult<T>> + Send + 'a>>;

/// Run a blocking operation, retrying transient failures according to `policy`.
///
/// The closure receives the 1-based attempt number. Permanent errors are
/// returned immediately; transient errors are retried until the policy gives up
/// or [`MAX_ATTEMPTS`] is reached, after which the last cause is returned as
/// [`RetryError::MaxRetriesExceeded`].
pub fn retry_blocking<F, T>(
    op_name: &'static str,
    mut policy: ExponentialBackoff,
    mut f: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> RetryResult<T>,
{
    policy.reset();
    let mut attempt = 1;

    loop {
        match f(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = op_name, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err @ RetryError::Permanent { .. }) => return Err(err),
            Err(RetryError::MaxRetriesExceeded { source, .. }) => {
                return Err(RetryError::MaxRetriesExceeded {
                    operation: op_name,
                    source,
                })
            }
            Err(RetryError::Transient { source, .. }) => {
                let delay = policy.next_backoff();
                match delay {
                    Some(delay) if attempt < MAX_ATTEMPTS => {
                        warn!(
                            operation = op_name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %source,
                            "transient failure, retrying"
                        );
                        std::thread::sleep(delay);
                        attempt += 1;
                    }
                    _ => {
                        return Err(RetryError::MaxRetriesExceeded {
                            operation: op_name,
                            source,
                        })
                    }
                }
            }
        }
    }
}

/// Execute an async operation, retrying transient failures according to `policy`
///
/// Same attempt semantics as [`retry_blocking`]. With the `async-rt` feature
/// the delay is a Tokio sleep, so this must run inside a Tokio runtime.
pub async fn with_backoff<'a, F, T>(
    op_name: &'static str,
    mut policy: ExponentialBackoff,
    mut f: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> BoxFuture<'a, T>,
{
    policy.reset();
    let mut attempt = 1;

    loop {
        debug!("Attempting operation '{}' (attempt {})", op_name, attempt);

        match f(attempt).await {
            Ok(result) => return Ok(result),
            Err(err @ RetryError::Permanent { .. }) => {
                warn!(
                    "Operation '{}' failed permanently on attempt {}",
                    op_name, attempt
                );
                return Err(err);
            }
            Err(err) => {
                warn!(
                    "Operation '{}' failed on attempt {}: {}",
                    op_name, attempt, err
                );

                let Some(delay) = policy.next_backoff().filter(|_| attempt < MAX_ATTEMPTS) else {
                    return Err(RetryError::MaxRetriesExceeded {
                        operation: op_name,
                        source: err.into_source(),
                    });
                };
                attempt += 1;

                #[cfg(feature = "async-rt")]
                tokio::time::sleep(delay).await;

                #[cfg(not(feature = "async-rt"))]
                std::thread::sleep(delay);
            }
        }
    }
}

/// Backoff policy for object-store operations (S3 and compatible)
pub fn object_store_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(500))
        .with_max_interval(Duration::from_secs(10))
        .with_max_elapsed_time(Some(Duration::from_secs(60)))
        .with_multiplier(1.5)
        .build()
}

/// Backoff policy for local filesystem operations (short timeouts)
pub fn local_store_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(10))
        .with_max_interval(Duration::from_millis(200))
        .with_max_elapsed_time(Some(Duration::from_secs(2)))
        .with_multiplier(2.0)
        .build()
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

impl RetryableError for std::io::Error {
    fn is_transient(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self.kind(),
            ErrorKind::Interrupted
                | ErrorKind::WouldBlock
                | ErrorKind::TimedOut
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
        )
    }
}

/// Classify an error as transient or permanent for the named operation.
pub fn classify<E>(op: &'static str, err: E) -> RetryError
where
    E: RetryableError + std::error::Error + Send + Sync + 'static,
{
    if err.is_transient() {
        RetryError::Transient {
            operation: op,
            source: Box::new(err),
        }
    } else {
        RetryError::Permanent {
            operation: op,
            source: Box::new(err),
        }
    }
}

/// Helper macro for creating transient errors
#[macro_export]
macro_rules! transient_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Transient {
            operation: $op,
            source: Box::new($err),
        }
    };
}

/// Helper macro for creating permanent errors
#[macro_export]
macro_rules! permanent_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Permanent {
            operation: $op,
            source: Box::new($err),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(1))
            .with_max_interval(Duration::from_millis(2))
            .with_max_elapsed_time(Some(Duration::from_secs(1)))
            .build()
    }

    #[test]
    fn test_blocking_retries_transient_then_succeeds() {
        let mut calls = 0;
        let result = retry_blocking("write_blob", fast_policy(), |_attempt| {
            calls += 1;
            if calls < 3 {
                Err(transient_error!(
                    "write_blob",
                    io::Error::new(io::ErrorKind::TimedOut, "slow disk")
                ))
            } else {
                Ok(calls)
            }
        });

        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_blocking_stops_on_permanent() {
        let mut calls = 0;
        let result: RetryResult<()> = retry_blocking("delete_blob", fast_policy(), |_attempt| {
            calls += 1;
            Err(permanent_error!(
                "delete_blob",
                io::Error::new(io::ErrorKind::PermissionDenied, "read-only mount")
            ))
        });

        assert_eq!(calls, 1);
        assert!(matches!(result, Err(RetryError::Permanent { .. })));
    }

    #[test]
    fn test_blocking_gives_up_after_max_attempts() {
        let mut calls = 0;
        let result: RetryResult<()> = retry_blocking("read_blob", fast_policy(), |_attempt| {
            calls += 1;
            Err(transient_error!(
                "read_blob",
                io::Error::new(io::ErrorKind::Interrupted, "signal")
            ))
        });

        assert!(calls <= MAX_ATTEMPTS);
        assert!(matches!(result, Err(RetryError::MaxRetriesExceeded { .. })));
    }

    #[test]
    fn test_classify_io_errors() {
        let transient = classify("op", io::Error::new(io::ErrorKind::TimedOut, "t"));
        assert!(transient.is_transient());

        let permanent = classify("op", io::Error::new(io::ErrorKind::NotFound, "n"));
        assert!(!permanent.is_transient());
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let result =
            with_backoff("test_op", fast_policy(), |_attempt| Box::pin(async { Ok("success") }))
                .await;

        assert_eq!(result.unwrap(), "success");
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = with_backoff("test_op", fast_policy(), move |_attempt| {
            let count = attempt_count_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if count < 2 {
                    Err(transient_error!(
                        "test_op",
                        io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
                    ))
                } else {
                    Ok("success")
                }
            })
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure() {
        let result: RetryResult<&str> = with_backoff("test_op", fast_policy(), |_attempt| {
            Box::pin(async {
                Err(permanent_error!(
                    "test_op",
                    io::Error::new(io::ErrorKind::PermissionDenied, "permission denied")
                ))
            })
        })
        .await;

        assert!(matches!(result, Err(RetryError::Permanent { .. })));
    }
}
