//! Request deadlines with exactly-one-outcome delivery.
//!
//! [`TimeoutGuard::start`] registers a request and arms a timer. From then on
//! exactly one outcome reaches the caller: either the one passed to
//! [`TimeoutGuard::finish`], or a `REQUEST_TIMEOUT` failure from the timer or
//! from [`TimeoutGuard::cancel_all`], whichever comes first. A request counts
//! as responded once its entry has left the pending map; everything that
//! arrives after that is discarded.
//!
//! Discarding applies to the outcome only. The work behind a timed-out
//! request keeps running until it notices its cancellation token, and the
//! caller remains responsible for committing whatever that work cost.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pipeline::{PipelineError, RequestFailure, RequestId, RequestOutcome};

struct PendingEntry {
    max_time: Duration,
    responder: oneshot::Sender<RequestOutcome>,
    timer: AbortHandle,
    cancel: CancellationToken,
}

/// Handle returned by [`TimeoutGuard::start`].
#[derive(Debug)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub deadline: Instant,
    /// Fires when the request times out or is cancelled at shutdown.
    pub cancel: CancellationToken,
    response: oneshot::Receiver<RequestOutcome>,
}

impl PendingRequest {
    /// Waits for the single outcome of this request.
    pub async fn outcome(self) -> RequestOutcome {
        let request_id = self.request_id;
        self.response.await.unwrap_or_else(|_| {
            // The responder can only be dropped without sending if the guard
            // itself was dropped.
            Err(RequestFailure::from_error(
                Some(request_id),
                &PipelineError::RequestTimeout {
                    after: Duration::ZERO,
                },
                None,
            ))
        })
    }
}

/// Whether an outcome passed to [`TimeoutGuard::finish`] reached the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The request had already timed out or was never started.
    Discarded,
}

/// Registry of in-flight requests and their deadlines.
#[derive(Clone, Default)]
pub struct TimeoutGuard {
    pending: Arc<Mutex<HashMap<RequestId, PendingEntry>>>,
}

impl TimeoutGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `request_id` and arms its deadline `max_time` from now.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, request_id: RequestId, max_time: Duration) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + max_time;

        let mut pending = self.pending.lock();
        let timer = {
            let guard = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                guard.expire(request_id);
            })
            .abort_handle()
        };
        if let Some(previous) = pending.insert(
            request_id,
            PendingEntry {
                max_time,
                responder: tx,
                timer,
                cancel: cancel.clone(),
            },
        ) {
            warn!(%request_id, "request id reused while pending; replacing");
            previous.timer.abort();
            previous.cancel.cancel();
        }
        drop(pending);

        debug!(%request_id, max_time_ms = max_time.as_millis() as u64, "deadline armed");
        PendingRequest {
            request_id,
            deadline,
            cancel,
            response: rx,
        }
    }

    /// Delivers `outcome` unless the request has already been answered.
    pub fn finish(&self, request_id: RequestId, outcome: RequestOutcome) -> Delivery {
        let Some(entry) = self.pending.lock().remove(&request_id) else {
            debug!(%request_id, "late outcome discarded");
            return Delivery::Discarded;
        };
        entry.timer.abort();
        match entry.responder.send(outcome) {
            Ok(()) => Delivery::Delivered,
            Err(_) => {
                debug!(%request_id, "caller stopped waiting; outcome dropped");
                Delivery::Discarded
            }
        }
    }

    /// Times out every pending request. Returns the affected ids.
    pub fn cancel_all(&self) -> Vec<RequestId> {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let mut ids = Vec::with_capacity(drained.len());
        for (request_id, entry) in drained {
            entry.timer.abort();
            entry.cancel.cancel();
            let failure = RequestFailure::from_error(
                Some(request_id),
                &PipelineError::RequestTimeout {
                    after: entry.max_time,
                },
                None,
            );
            let _ = entry.responder.send(Err(RequestFailure {
                message: format!("{}; cancelled at shutdown", failure.message),
                ..failure
            }));
            ids.push(request_id);
        }
        if !ids.is_empty() {
            warn!(count = ids.len(), "cancelled all pending requests");
        }
        ids
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, request_id: RequestId) -> bool {
        self.pending.lock().contains_key(&request_id)
    }

    fn expire(&self, request_id: RequestId) {
        let Some(entry) = self.pending.lock().remove(&request_id) else {
            return;
        };
        entry.cancel.cancel();
        warn!(%request_id, after_ms = entry.max_time.as_millis() as u64, "request timed out");
        let _ = entry.responder.send(Err(RequestFailure::from_error(
            Some(request_id),
            &PipelineError::RequestTimeout {
                after: entry.max_time,
            },
            None,
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::ErrorCode;

    fn failure(message: &str) -> RequestOutcome {
        Err(RequestFailure::from_error(
            None,
            &PipelineError::Validation {
                message: message.into(),
            },
            None,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn finish_before_deadline_is_delivered() {
        let guard = TimeoutGuard::new();
        let id = RequestId::new_random();
        let pending = guard.start(id, Duration::from_secs(5));

        assert!(guard.is_pending(id));
        assert_eq!(guard.finish(id, failure("first")), Delivery::Delivered);
        assert!(!guard.is_pending(id));

        let outcome = pending.outcome().await.unwrap_err();
        assert_eq!(outcome.code, ErrorCode::ValidationError);
        assert_eq!(guard.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_delivers_timeout_and_discards_late_finish() {
        let guard = TimeoutGuard::new();
        let id = RequestId::new_random();
        let pending = guard.start(id, Duration::from_millis(100));
        let cancel = pending.cancel.clone();

        let outcome = pending.outcome().await.unwrap_err();
        assert_eq!(outcome.code, ErrorCode::RequestTimeout);
        assert_eq!(outcome.request_id, Some(id));
        assert!(cancel.is_cancelled());

        assert_eq!(guard.finish(id, failure("late")), Delivery::Discarded);
        assert_eq!(guard.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_disarms_the_timer() {
        let guard = TimeoutGuard::new();
        let id = RequestId::new_random();
        let pending = guard.start(id, Duration::from_millis(100));
        let cancel = pending.cancel.clone();
        guard.finish(id, failure("done"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!cancel.is_cancelled());
        assert_eq!(
            pending.outcome().await.unwrap_err().code,
            ErrorCode::ValidationError
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_times_out_every_pending_request() {
        let guard = TimeoutGuard::new();
        let a = guard.start(RequestId::new_random(), Duration::from_secs(60));
        let b = guard.start(RequestId::new_random(), Duration::from_secs(60));
        let (a_id, b_id) = (a.request_id, b.request_id);

        let mut cancelled = guard.cancel_all();
        cancelled.sort_by_key(|id| id.as_uuid());
        let mut expected = vec![a_id, b_id];
        expected.sort_by_key(|id| id.as_uuid());
        assert_eq!(cancelled, expected);
        assert_eq!(guard.pending_count(), 0);
        assert!(a.cancel.is_cancelled() && b.cancel.is_cancelled());

        let outcome = a.outcome().await.unwrap_err();
        assert_eq!(outcome.code, ErrorCode::RequestTimeout);
        assert!(outcome.message.contains("shutdown"));
        assert_eq!(guard.finish(b_id, failure("after shutdown")), Delivery::Discarded);
    }

    #[tokio::test]
    async fn finishing_an_unknown_request_is_discarded() {
        let guard = TimeoutGuard::new();
        assert_eq!(
            guard.finish(RequestId::new_random(), failure("nobody")),
            Delivery::Discarded
        );
    }
}
