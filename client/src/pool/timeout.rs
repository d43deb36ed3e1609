//! Request Deadlines
//!
//! Each dispatched stream with a timeout gets one timer task. When it fires
//! the timer races for the stream's terminal claim with `TimedOut`; only if
//! it wins does it reset the stream on the wire. The reset itself never
//! claims again, so timeout + reset costs exactly one decrement.

use crate::error::ClientError;
use crate::pool::connection::{Connection, ResetMode};
use crate::pool::stream::Stream;
use crate::pool::transport::Transport;
use common::TerminalReason;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Request line details carried into the timeout error
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
}

/// Arms and fires per-stream deadlines
pub struct TimeoutController;

impl TimeoutController {
    /// Start the timer for a dispatched stream
    ///
    /// Dropping the returned guard disarms it.
    pub fn arm<T: Transport>(
        connection: &Arc<Connection<T>>,
        stream: &Arc<Stream>,
        timeout: Duration,
        request: RequestInfo,
    ) -> DeadlineGuard {
        let deadline = tokio::time::Instant::now() + timeout;
        stream.set_deadline(deadline.into_std());

        let connection = connection.clone();
        let stream = stream.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            Self::expire(&connection, &stream, timeout, request);
        });

        DeadlineGuard {
            timer: timer.abort_handle(),
        }
    }

    /// Deadline reached: claim `TimedOut`, then reset the stream
    ///
    /// Returns false if the stream had already finished.
    pub(crate) fn expire<T: Transport>(
        connection: &Connection<T>,
        stream: &Stream,
        timeout: Duration,
        request: RequestInfo,
    ) -> bool {
        let error = ClientError::Timeout {
            timeout,
            method: request.method,
            path: request.path,
            endpoint: stream.endpoint().clone(),
        };

        if !connection.terminate(stream, TerminalReason::TimedOut, Err(error)) {
            debug!(
                endpoint = %stream.endpoint(),
                stream_id = %stream.id(),
                state = stream.state().as_str(),
                "Deadline fired after stream finished"
            );
            return false;
        }

        warn!(
            endpoint = %stream.endpoint(),
            stream_id = %stream.id(),
            timeout_ms = timeout.as_millis() as u64,
            "Request timeout exceeded, resetting stream"
        );
        connection.reset_stream(stream.id(), ResetMode::AlreadyAccounted);
        true
    }
}

/// Keeps a stream's deadline armed while alive
#[derive(Debug)]
pub struct DeadlineGuard {
    timer: AbortHandle,
}

impl DeadlineGuard {
    pub fn disarm(self) {
        drop(self);
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.timer.abort();
    }
}
