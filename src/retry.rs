//! Bounded exponential backoff and the generic convergence poller.
//!
//! Every "change something, then wait for it to show up" step in the harness
//! goes through [`poll_until`]: fetch a fresh value, test it, sleep, repeat,
//! until the predicate holds or the attempt budget runs out. Only errors that
//! report themselves [`Retryable`] are retried; anything else ends the poll
//! on the spot.
//!
//! # Example
//!
//! ```ignore
//! use replica_convergence::retry::{poll_until, BackoffPolicy};
//!
//! let ready = poll_until(
//!     &BackoffPolicy::default(),
//!     "wait for rancher",
//!     || async { deployments.get("rancher").await },
//!     |d| d.status.as_ref().and_then(|s| s.ready_replicas) == Some(3),
//! )
//! .await?;
//! ```

use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::Error;

/// Default initial delay between attempts
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Default multiplier applied to the delay after every attempt
pub const DEFAULT_FACTOR: f64 = 2.0;
/// Default attempt budget
pub const DEFAULT_MAX_ATTEMPTS: u32 = 7;

/// Classifies fetch errors for [`poll_until`]
pub trait Retryable {
    /// Whether another attempt may succeed
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        Error::is_retryable(self)
    }
}

/// Schedule of increasing waits between attempts, bounded by an attempt count.
///
/// Immutable once built; share it by reference across every poll in a run.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    initial_delay: Duration,
    factor: f64,
    max_attempts: u32,
    max_delay: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            factor: DEFAULT_FACTOR,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_delay: None,
        }
    }
}

impl BackoffPolicy {
    /// Build a policy, rejecting `factor <= 1` and `max_attempts == 0`.
    pub fn new(initial_delay: Duration, factor: f64, max_attempts: u32) -> Result<Self, Error> {
        if !factor.is_finite() || factor <= 1.0 {
            return Err(Error::config(format!(
                "backoff factor must be greater than 1, got {factor}"
            )));
        }
        if max_attempts == 0 {
            return Err(Error::config("backoff must allow at least one attempt"));
        }
        Ok(Self {
            initial_delay,
            factor,
            max_attempts,
            max_delay: None,
        })
    }

    /// Cap every individual sleep at `max_delay`
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay before the first retry
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Multiplier between consecutive delays
    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Maximum number of fetch attempts
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Sleep taken after the attempt with zero-based index `attempt_index`:
    /// `initial * factor^attempt_index`, capped at `max_delay` if set.
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Upper bound on wall-clock time spent sleeping:
    /// `initial * (factor^attempts - 1) / (factor - 1)`.
    pub fn total_budget(&self) -> Duration {
        let exponent = i32::try_from(self.max_attempts).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * (self.factor.powi(exponent) - 1.0)
            / (self.factor - 1.0);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Why a poll ended without the predicate holding.
///
/// Every variant keeps the last successfully fetched value so callers can
/// report (or act on) the state they saw last.
#[derive(Debug, Error)]
pub enum PollError<T, E> {
    /// Budget spent without the predicate holding and without any fetch error
    #[error("condition not met after {attempts} attempts")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Last fetched value
        last_value: Option<T>,
    },

    /// A fetch failed: either with a non-retryable error, which ends the
    /// poll at once, or with retryable errors until the budget was spent
    #[error("fetch failed after {attempts} attempts: {error}")]
    Fetch {
        /// Attempts made
        attempts: u32,
        /// Most recent fetch error
        error: E,
        /// Last successfully fetched value
        last_value: Option<T>,
    },

    /// The cancellation token fired before the budget was spent
    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts made
        attempts: u32,
        /// Last fetched value
        last_value: Option<T>,
    },
}

impl<T, E> PollError<T, E> {
    /// Number of fetch attempts made
    pub fn attempts(&self) -> u32 {
        match self {
            PollError::Exhausted { attempts, .. }
            | PollError::Fetch { attempts, .. }
            | PollError::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Last successfully fetched value, if any attempt succeeded
    pub fn last_value(&self) -> Option<&T> {
        match self {
            PollError::Exhausted { last_value, .. }
            | PollError::Fetch { last_value, .. }
            | PollError::Cancelled { last_value, .. } => last_value.as_ref(),
        }
    }
}

impl<T> PollError<T, Error> {
    /// Convert into the crate error, rendering the last value with `describe`.
    ///
    /// A non-retryable fetch error is returned as is; retryable ones are
    /// wrapped in [`Error::RetriesExhausted`].
    pub fn into_error(self, operation: &str, describe: impl Fn(&T) -> String) -> Error {
        match self {
            PollError::Exhausted {
                attempts,
                last_value,
            } => Error::PollTimeout {
                operation: operation.to_string(),
                attempts,
                last_observed: last_value.as_ref().map(&describe),
            },
            PollError::Fetch { error, .. } if !error.is_retryable() => error,
            PollError::Fetch {
                attempts,
                error,
                last_value,
            } => Error::RetriesExhausted {
                operation: operation.to_string(),
                attempts,
                last_observed: last_value.as_ref().map(&describe),
                source: Box::new(error),
            },
            PollError::Cancelled { attempts, .. } => Error::Cancelled {
                operation: operation.to_string(),
                attempts,
            },
        }
    }
}

/// Poll `fetch` until `predicate` accepts a value or the budget runs out.
///
/// Retryable fetch errors are logged and retried; a non-retryable one is
/// returned immediately as [`PollError::Fetch`]. When the budget is spent the
/// most recent fetch error is returned if any attempt failed, even one
/// followed by successful fetches, otherwise [`PollError::Exhausted`]. No
/// sleep follows the final attempt.
pub async fn poll_until<T, E, F, Fut, P>(
    policy: &BackoffPolicy,
    operation: &str,
    fetch: F,
    predicate: P,
) -> Result<T, PollError<T, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&T) -> bool,
    T: Debug,
    E: Display + Retryable,
{
    poll_loop(policy, operation, None, fetch, predicate, tokio::time::sleep).await
}

/// [`poll_until`] with an external cancellation signal.
///
/// The token is checked at the top of every iteration and interrupts the
/// sleep between attempts.
pub async fn poll_until_cancellable<T, E, F, Fut, P>(
    policy: &BackoffPolicy,
    operation: &str,
    cancel: &CancellationToken,
    fetch: F,
    predicate: P,
) -> Result<T, PollError<T, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&T) -> bool,
    T: Debug,
    E: Display + Retryable,
{
    let sleep = |delay: Duration| {
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    };
    poll_loop(policy, operation, Some(cancel), fetch, predicate, sleep).await
}

pub(crate) async fn poll_loop<T, E, F, Fut, P, S, SFut>(
    policy: &BackoffPolicy,
    operation: &str,
    cancel: Option<&CancellationToken>,
    mut fetch: F,
    mut predicate: P,
    mut sleep: S,
) -> Result<T, PollError<T, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&T) -> bool,
    S: FnMut(Duration) -> SFut,
    SFut: Future<Output = ()>,
    T: Debug,
    E: Display + Retryable,
{
    let mut last_value: Option<T> = None;
    let mut last_error: Option<E> = None;
    let mut attempts = 0u32;

    while attempts < policy.max_attempts {
        if cancel.is_some_and(|token| token.is_cancelled()) {
            debug!(operation = %operation, attempts, "Polling cancelled");
            return Err(PollError::Cancelled {
                attempts,
                last_value,
            });
        }

        attempts += 1;

        match fetch().await {
            Ok(value) => {
                if predicate(&value) {
                    debug!(operation = %operation, attempt = attempts, "Condition met");
                    return Ok(value);
                }
                trace!(
                    operation = %operation,
                    attempt = attempts,
                    value = ?value,
                    "Condition not yet met"
                );
                last_value = Some(value);
            }
            Err(e) if !e.is_retryable() => {
                warn!(
                    operation = %operation,
                    attempt = attempts,
                    error = %e,
                    "Fetch failed with a non-retryable error"
                );
                return Err(PollError::Fetch {
                    attempts,
                    error: e,
                    last_value,
                });
            }
            Err(e) => {
                warn!(
                    operation = %operation,
                    attempt = attempts,
                    error = %e,
                    "Fetch failed, retrying"
                );
                last_error = Some(e);
            }
        }

        if attempts < policy.max_attempts {
            sleep(policy.delay_for(attempts - 1)).await;
        }
    }

    match last_error {
        Some(error) => Err(PollError::Fetch {
            attempts,
            error,
            last_value,
        }),
        None => Err(PollError::Exhausted {
            attempts,
            last_value,
        }),
    }
}
