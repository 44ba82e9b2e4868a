//! Bounded exponential-backoff retry around a fallible async call.
//!
//! The caller supplies a classifier mapping each error to a [`RetryPolicy`].
//! Non-retryable errors end the loop immediately; retryable ones are retried
//! up to [`RetryConfig::max_retries`] times. Every failed attempt is kept so
//! that callers can account for what each attempt cost.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pipeline::RetryPolicy;

use crate::executor::InFlightPolicy;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8);
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter applied to each delay, `0.0..=1.0`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (zero-based).
    ///
    /// `base * 2^retry`, capped at `max_delay`, varied by up to
    /// `±jitter_factor`. A server-supplied `hint` is honoured as a minimum.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let exponential = self.base_delay.saturating_mul(1u32 << retry.min(20));
        let capped = exponential.min(self.max_delay);
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
            capped.mul_f64(factor)
        } else {
            capped
        };
        hint.map_or(delay, |h| delay.max(h))
    }
}

/// A successful call together with the attempts it took.
#[derive(Debug)]
pub struct Retried<T, E> {
    pub value: T,
    /// Total attempts made, including the successful one.
    pub attempts: u32,
    /// Errors of the attempts that failed before the success.
    pub failures: Vec<E>,
}

/// Why a retried call gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// The last error was classified as non-retryable.
    #[error("terminal failure after {attempts} attempt(s): {last}")]
    Terminal {
        #[source]
        last: E,
        attempts: u32,
        earlier: Vec<E>,
    },

    /// Every permitted attempt failed with a retryable error.
    #[error("retries exhausted after {attempts} attempt(s): {last}")]
    Exhausted {
        #[source]
        last: E,
        attempts: u32,
        earlier: Vec<E>,
    },

    /// The cancellation token fired between or during attempts.
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32, earlier: Vec<E> },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// Attempts started, including one abandoned by cancellation.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Terminal { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn last(&self) -> Option<&E> {
        match self {
            Self::Terminal { last, .. } | Self::Exhausted { last, .. } => Some(last),
            Self::Cancelled { .. } => None,
        }
    }

    /// Every attempt that completed with an error, oldest first.
    pub fn failed_attempts(&self) -> impl Iterator<Item = &E> {
        let (earlier, last) = match self {
            Self::Terminal { earlier, last, .. } | Self::Exhausted { earlier, last, .. } => {
                (earlier, Some(last))
            }
            Self::Cancelled { earlier, .. } => (earlier, None),
        };
        earlier.iter().chain(last)
    }
}

/// Runs `call` until it succeeds, fails terminally, runs out of retries, or
/// `cancel` fires.
///
/// `call` receives the zero-based attempt number. No attempt starts once
/// `cancel` has fired. An attempt already in flight is dropped under
/// [`InFlightPolicy::Abort`] and allowed to finish under
/// [`InFlightPolicy::Drain`]; a drained failure is reported but not retried.
pub async fn with_retry<T, E, C, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    in_flight: InFlightPolicy,
    classify: C,
    mut call: F,
) -> Result<Retried<T, E>, RetryError<E>>
where
    E: std::error::Error + 'static,
    C: Fn(&E) -> RetryPolicy,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut failures: Vec<E> = Vec::new();
    let mut attempt = 0u32;
    let detached = CancellationToken::new();
    let call_cancel = match in_flight {
        InFlightPolicy::Abort => cancel,
        InFlightPolicy::Drain => &detached,
    };

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt,
                earlier: failures,
            });
        }
        let result = tokio::select! {
            biased;
            _ = call_cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt + 1, earlier: failures });
            }
            r = call(attempt) => r,
        };
        attempt += 1;

        let error = match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempts = attempt, "call succeeded after retry");
                }
                return Ok(Retried {
                    value,
                    attempts: attempt,
                    failures,
                });
            }
            Err(e) => e,
        };

        let hint = match classify(&error) {
            RetryPolicy::NonRetryable => {
                warn!(attempt, error = %error, "terminal failure; not retrying");
                return Err(RetryError::Terminal {
                    last: error,
                    attempts: attempt,
                    earlier: failures,
                });
            }
            RetryPolicy::Retryable { after } => after,
        };
        if attempt > config.max_retries {
            warn!(attempts = attempt, error = %error, "retries exhausted");
            return Err(RetryError::Exhausted {
                last: error,
                attempts: attempt,
                earlier: failures,
            });
        }

        let delay = config.delay_for(attempt - 1, hint);
        warn!(
            attempt,
            max_retries = config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retryable failure; backing off"
        );
        failures.push(error);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt, earlier: failures });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
