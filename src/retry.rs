//! Retry logic with exponential backoff
//!
//! One policy shared by the attachment fetcher and the pagination driver's
//! search step. Errors classify themselves through [`IsRetryable`]: transient
//! failures (timeouts, connection errors, 5xx answers) are retried with
//! exponential backoff, structural ones (missing token, missing link, wrong
//! file type) fail on the first attempt because retrying cannot change them.
//!
//! # Example
//!
//! ```no_run
//! use mediador_crawler::retry::{IsRetryable, with_retry};
//! use mediador_crawler::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! with_retry(&config, || async {
//!     // Your operation here
//!     Ok::<_, MyError>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, FetchFailure};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for FetchFailure {
    fn is_retryable(&self) -> bool {
        match self {
            FetchFailure::DetailPageUnreachable(_) => true,
            FetchFailure::TransferTimedOut(_) => true,
            FetchFailure::TransferInterrupted(_) => true,
            // Server-side trouble or throttling may clear up; client errors will not
            FetchFailure::TransferRejected(status) => *status >= 500 || *status == 429,
            FetchFailure::TokenMissing => false,
            FetchFailure::LinkNotFound => false,
            FetchFailure::SignatureMismatch(_) => false,
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Navigation { timed_out, .. } => *timed_out,
            Error::AttachmentFetch(failure) => failure.is_retryable(),
            // A missing form control is a page structure problem
            Error::FormFieldNotFound(_) => false,
            Error::Extraction { .. } => false,
            Error::StorageWrite { .. } => false,
            Error::StorageRootUnavailable { .. } => false,
            Error::Config { .. } => false,
            Error::NotSupported(_) => false,
            Error::Serialization(_) => false,
            Error::Other(_) => false,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// `config.max_attempts` is the total number of calls to `operation`, the
/// first one included. The delay before call `n + 1` is
/// `initial_delay * backoff_multiplier^(n - 1)`, capped at `max_delay`.
///
/// Returns the successful result or the last error once attempts run out or a
/// non-retryable error is returned.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut backoff = Backoff::new(config);

    loop {
        match operation().await {
            Ok(result) => {
                if backoff.attempt() > 1 {
                    tracing::info!(attempts = backoff.attempt(), "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                let attempt = backoff.attempt();
                match backoff.next_delay(&e) {
                    Some(wait) => {
                        tracing::warn!(
                            error = %e,
                            attempt = attempt,
                            max_attempts = config.max_attempts,
                            delay_ms = wait.as_millis(),
                            "Operation failed, retrying"
                        );
                        tokio::time::sleep(wait).await;
                    }
                    None if e.is_retryable() => {
                        tracing::warn!(
                            error = %e,
                            attempts = attempt,
                            "Operation failed after all retry attempts exhausted"
                        );
                        return Err(e);
                    }
                    None => {
                        tracing::debug!(error = %e, "Operation failed with non-retryable error");
                        return Err(e);
                    }
                }
            }
        }
    }
}

/// Backoff schedule of a [`RetryConfig`], for loops that cannot be expressed
/// as a closure passed to [`with_retry`] (the operation needs `&mut` state).
#[derive(Clone, Debug)]
pub struct Backoff {
    max_attempts: u32,
    attempt: u32,
    delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Backoff {
    /// Fresh schedule; the first attempt is about to run
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            attempt: 1,
            delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// 1-based number of the attempt currently running
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// How long to wait before retrying after `error`, or `None` to give up
    pub fn next_delay<E: IsRetryable>(&mut self, error: &E) -> Option<Duration> {
        if !error.is_retryable() || self.attempt >= self.max_attempts {
            return None;
        }
        let wait = if self.jitter {
            add_jitter(self.delay)
        } else {
            self.delay
        };
        self.attempt += 1;
        self.delay = Duration::from_secs_f64(self.delay.as_secs_f64() * self.multiplier)
            .min(self.max_delay);
        Some(wait)
    }
}

/// Add random jitter to a delay; the result lies between `delay` and `2 * delay`
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
