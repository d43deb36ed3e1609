//! Stream Lifecycle State Machine
//!
//! One logical request/response exchange:
//!
//! `Created → Active → {Completed, Reset, TimedOut, Errored}`
//!
//! - `activate()` is the single increment point (request hits the wire)
//! - `claim()` is the single terminal transition: a CAS from any non-terminal
//!   state to the requested terminal state. Only the winner decrements the
//!   in-use gauge and delivers the outcome to the caller. Every other trigger
//!   (late response, duplicate reset, second timeout, connection teardown)
//!   observes the terminal state and does nothing.

use crate::error::ClientError;
use crate::pool::metrics::{safe_lock, EndpointMetrics};
use crate::pool::transport::HttpResponse;
use common::{Endpoint, StreamId, StreamState, TerminalReason};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// What the caller eventually receives for a stream
pub type Outcome = Result<HttpResponse, ClientError>;

/// One request/response exchange on a connection
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    endpoint: Endpoint,
    metrics: Option<EndpointMetrics>,
    state: AtomicU8,
    deadline: OnceLock<Instant>,
    outcome: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl Stream {
    /// New stream in `Created` state plus the receiver its outcome is delivered to
    pub fn new(
        id: StreamId,
        endpoint: Endpoint,
        metrics: Option<EndpointMetrics>,
    ) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let stream = Self {
            id,
            endpoint,
            metrics,
            state: AtomicU8::new(StreamState::Created.as_u8()),
            deadline: OnceLock::new(),
            outcome: Mutex::new(Some(tx)),
        };
        (stream, rx)
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> StreamState {
        // Only valid discriminants are ever stored
        StreamState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(StreamState::Errored)
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.get().copied()
    }

    /// Record the deadline armed for this stream. First write wins.
    pub fn set_deadline(&self, deadline: Instant) {
        let _ = self.deadline.set(deadline);
    }

    /// `Created → Active`; increments the in-use gauge exactly once.
    ///
    /// Returns false if the stream was already active or already terminated
    /// (e.g. canceled before dispatch).
    pub fn activate(&self) -> bool {
        let activated = self
            .state
            .compare_exchange(
                StreamState::Created.as_u8(),
                StreamState::Active.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if activated {
            if let Some(metrics) = &self.metrics {
                metrics.increment();
            }
            trace!(endpoint = %self.endpoint, stream_id = %self.id, "Stream active");
        }
        activated
    }

    /// Terminal claim
    ///
    /// Returns true for exactly one caller over the stream's lifetime. The
    /// winner decrements the gauge (only if the stream had reached Active)
    /// and hands `outcome` to the waiting caller.
    pub fn claim(&self, reason: TerminalReason, outcome: Outcome) -> bool {
        let target = reason.state().as_u8();
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            let previous = StreamState::from_u8(current).unwrap_or(StreamState::Errored);
            if previous.is_terminal() {
                debug!(
                    endpoint = %self.endpoint,
                    stream_id = %self.id,
                    state = previous.as_str(),
                    attempted = reason.as_str(),
                    "Terminal claim lost, stream already finished"
                );
                return false;
            }

            match self
                .state
                .compare_exchange(current, target, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if previous == StreamState::Active {
                        if let Some(metrics) = &self.metrics {
                            metrics.decrement();
                        }
                    }
                    debug!(
                        endpoint = %self.endpoint,
                        stream_id = %self.id,
                        from = previous.as_str(),
                        reason = reason.as_str(),
                        "Stream finished"
                    );
                    self.deliver(outcome);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn deliver(&self, outcome: Outcome) {
        if let Some(tx) = safe_lock(&self.outcome).take() {
            // Receiver gone means the caller stopped waiting; nothing to do
            let _ = tx.send(outcome);
        }
    }
}
