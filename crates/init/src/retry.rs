//! Retry-with-timeout combinator, matching
//! `wsl::shared::retry::RetryWithTimeout<T>`: re-run a fallible operation on
//! a fixed period until it succeeds or the overall timeout elapses, but only
//! for errors the caller's predicate says are worth retrying.
//!
//! The original's `c_defaultRetryPeriod`/`c_defaultRetryTimeout` constants
//! live in a header that was not part of the retrieved source; the values
//! below are this implementation's own choice (documented in DESIGN.md).

use std::time::Duration;

use tokio::time::{Instant, sleep};

pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_millis(50);
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(5);

/// Retries `operation` every `period` until it returns `Ok`, `predicate`
/// returns `false` for the error, or `timeout` has elapsed since the first
/// attempt — whichever comes first. The last error is returned on timeout.
pub async fn retry_with_timeout<T, E, F, Fut, P>(
    mut operation: F,
    period: Duration,
    timeout: Duration,
    predicate: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !predicate(&err) || Instant::now() >= deadline {
                    return Err(err);
                }

                sleep(period).await;
            }
        }
    }
}

/// Error classes the original treats as transient device errors worth
/// retrying: device not yet enumerated (`ENOENT`/`ENXIO`) or a bus hiccup
/// (`EIO`). `DetectFilesystem`'s retry predicate omits `EIO`; callers that
/// need that narrower set should write their own predicate instead of
/// reusing this one.
pub fn is_retryable_device_error(errno: i32) -> bool {
    matches!(errno, libc::ENOENT | libc::ENXIO | libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success_within_timeout() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, i32> = retry_with_timeout(
            || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err(libc::ENOENT) } else { Ok(n) }
            },
            Duration::from_millis(1),
            Duration::from_secs(1),
            |e| is_retryable_device_error(*e),
        )
        .await;

        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn stops_immediately_on_non_retryable_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), i32> = retry_with_timeout(
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(libc::EPERM)
            },
            Duration::from_millis(1),
            Duration::from_secs(1),
            |e| is_retryable_device_error(*e),
        )
        .await;

        assert_eq!(result, Err(libc::EPERM));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detect_filesystem_predicate_excludes_eio() {
        assert!(is_retryable_device_error(libc::ENOENT));
        assert!(is_retryable_device_error(libc::ENXIO));
        assert!(is_retryable_device_error(libc::EIO));
        assert!(!is_retryable_device_error(libc::EPERM));
    }
}
