//! Pooled Connection
//!
//! One physical transport to an endpoint multiplexing up to `max_streams`
//! concurrent streams. Every way a stream can end funnels through
//! `terminate()`, which performs the stream's terminal claim and, for the
//! winner only, releases the connection slot and wakes a queued caller.
//!
//! Stream entries outlive their terminal claim until the exchange task has
//! finished or been aborted, so a reset can still find the in-flight
//! exchange after a timeout already accounted for the stream.

use crate::error::ClientError;
use crate::pool::metrics::{safe_lock, EndpointMetrics};
use crate::pool::stream::{Outcome, Stream};
use crate::pool::timeout::{DeadlineGuard, RequestInfo, TimeoutController};
use crate::pool::transport::{HttpResponse, Transport, TransportError};
use common::{Endpoint, StreamId, StreamState, TerminalReason, FIRST_CLIENT_STREAM_ID};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Request;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open = 0,
    /// No new streams (id space exhausted); closes once drained
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OpenStreamError {
    #[error("Connection at stream capacity ({0})")]
    CapacityExceeded(u32),

    #[error("Connection is not accepting new streams")]
    Closed,
}

/// How a reset request relates to the stream's terminal claim
#[derive(Debug)]
pub enum ResetMode {
    /// Claim the stream with `reason` first; skip the reset if the claim is lost
    Claim {
        reason: TerminalReason,
        error: ClientError,
    },
    /// The caller already won the claim (timeout path); only abort on the wire
    AlreadyAccounted,
}

struct StreamEntry {
    stream: Arc<Stream>,
    exchange: Option<AbortHandle>,
    deadline: Option<DeadlineGuard>,
}

struct StreamTable {
    entries: HashMap<StreamId, StreamEntry>,
    next_id: Option<StreamId>,
}

pub struct Connection<T: Transport> {
    id: u64,
    endpoint: Endpoint,
    transport: T,
    max_streams: u32,
    state: AtomicU8,
    streams: Mutex<StreamTable>,
    /// Streams opened and not yet terminally claimed
    active: AtomicUsize,
    last_active: Mutex<Instant>,
    /// Shared with the owning pool; signalled whenever a slot frees up
    capacity: Arc<Notify>,
}

impl<T: Transport> Connection<T> {
    pub fn new(
        id: u64,
        endpoint: Endpoint,
        transport: T,
        max_streams: u32,
        capacity: Arc<Notify>,
    ) -> Self {
        Self {
            id,
            endpoint,
            transport,
            max_streams,
            state: AtomicU8::new(ConnectionState::Open as u8),
            streams: Mutex::new(StreamTable {
                entries: HashMap::new(),
                next_id: Some(StreamId(FIRST_CLIENT_STREAM_ID)),
            }),
            active: AtomicUsize::new(0),
            last_active: Mutex::new(Instant::now()),
            capacity,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open && !self.transport.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed || self.transport.is_closed()
    }

    pub fn has_capacity(&self) -> bool {
        self.is_open() && self.active_streams() < self.max_streams as usize
    }

    /// Time since the last stream finished; zero while streams are active
    pub fn idle_for(&self) -> Duration {
        if self.active_streams() > 0 {
            return Duration::ZERO;
        }
        safe_lock(&self.last_active).elapsed()
    }

    /// State of a stream still tracked by this connection
    pub fn stream_state(&self, id: StreamId) -> Option<StreamState> {
        safe_lock(&self.streams)
            .entries
            .get(&id)
            .map(|entry| entry.stream.state())
    }

    fn touch(&self) {
        *safe_lock(&self.last_active) = Instant::now();
    }

    /// Allocate a new stream in `Created` state
    pub fn open_stream(
        &self,
        metrics: Option<EndpointMetrics>,
    ) -> Result<(Arc<Stream>, oneshot::Receiver<Outcome>), OpenStreamError> {
        let mut table = safe_lock(&self.streams);

        if !self.is_open() {
            return Err(OpenStreamError::Closed);
        }
        if self.active_streams() >= self.max_streams as usize {
            return Err(OpenStreamError::CapacityExceeded(self.max_streams));
        }

        let id = table.next_id.ok_or(OpenStreamError::Closed)?;
        table.next_id = id.next();
        if table.next_id.is_none() {
            info!(
                connection_id = self.id,
                endpoint = %self.endpoint,
                "Stream ids exhausted, draining connection"
            );
            self.set_state(ConnectionState::Closing);
        }

        let (stream, outcome) = Stream::new(id, self.endpoint.clone(), metrics);
        let stream = Arc::new(stream);
        table.entries.insert(
            id,
            StreamEntry {
                stream: stream.clone(),
                exchange: None,
                deadline: None,
            },
        );
        self.active.fetch_add(1, Ordering::AcqRel);
        self.touch();

        trace!(
            connection_id = self.id,
            stream_id = %id,
            active_streams = self.active_streams(),
            "Stream opened"
        );
        Ok((stream, outcome))
    }

    /// Put the request on the wire
    ///
    /// Activates the stream (the in-use increment), spawns the exchange and
    /// arms the deadline when a timeout is given.
    pub fn dispatch(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        request: Request<Full<Bytes>>,
        timeout: Option<(Duration, RequestInfo)>,
    ) {
        let id = stream.id();
        if !stream.activate() {
            debug!(
                connection_id = self.id,
                stream_id = %id,
                state = stream.state().as_str(),
                "Stream finished before dispatch"
            );
            self.reap(id);
            return;
        }

        let connection = self.clone();
        let exchange_stream = stream.clone();
        let exchange = tokio::spawn(async move {
            let result = connection.transport.send(request).await;
            connection.complete_exchange(&exchange_stream, result);
        });

        let deadline = timeout.map(|(duration, info)| TimeoutController::arm(self, stream, duration, info));

        let mut table = safe_lock(&self.streams);
        match table.entries.get_mut(&id) {
            Some(entry) => {
                entry.exchange = Some(exchange.abort_handle());
                entry.deadline = deadline;
            }
            None => {
                // Already finished or reset; make sure nothing keeps running
                exchange.abort();
            }
        }
    }

    /// End of the exchange task: settle the stream from the transport result
    pub(crate) fn complete_exchange(
        &self,
        stream: &Arc<Stream>,
        result: Result<HttpResponse, TransportError>,
    ) {
        let id = stream.id();
        match result {
            Ok(response) => {
                let status = response.status_code();
                if self.terminate(stream, TerminalReason::Completed, Ok(response)) {
                    trace!(connection_id = self.id, stream_id = %id, status, "Exchange completed");
                } else {
                    debug!(
                        connection_id = self.id,
                        stream_id = %id,
                        status,
                        state = stream.state().as_str(),
                        "Discarding late response"
                    );
                }
            }
            Err(TransportError::ConnectionLost(message)) => {
                self.fail(ClientError::Connection(message));
            }
            Err(TransportError::StreamReset(message)) => {
                self.terminate(
                    stream,
                    TerminalReason::Reset,
                    Err(ClientError::StreamReset {
                        stream_id: id,
                        message,
                    }),
                );
            }
            Err(e) => {
                self.terminate(
                    stream,
                    TerminalReason::Errored,
                    Err(ClientError::Connection(e.to_string())),
                );
            }
        }
        self.reap(id);
    }

    /// Shared terminal path for every trigger
    ///
    /// Returns true only for the caller that won the stream's claim; that
    /// caller also releases the slot on this connection.
    pub fn terminate(&self, stream: &Stream, reason: TerminalReason, outcome: Outcome) -> bool {
        if !stream.claim(reason, outcome) {
            return false;
        }
        self.release(stream.id());
        true
    }

    /// Give a finished stream's slot back and wake the pool's queue
    ///
    /// Every queued caller re-checks; only the head of the queue may take
    /// the slot.
    fn release(&self, id: StreamId) {
        let remaining = self.active.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        self.touch();
        self.capacity.notify_waiters();

        trace!(
            connection_id = self.id,
            stream_id = %id,
            active_streams = remaining,
            "Stream slot released"
        );

        if remaining == 0 && self.state() == ConnectionState::Closing {
            self.close();
        }
    }

    /// Drop the bookkeeping entry (disarms its deadline)
    fn reap(&self, id: StreamId) {
        let entry = safe_lock(&self.streams).entries.remove(&id);
        if let Some(exchange) = entry.as_ref().and_then(|e| e.exchange.as_ref()) {
            exchange.abort();
        }
    }

    /// Abort a stream on the wire
    ///
    /// Returns true if a reset was issued. With `ResetMode::Claim` the claim is
    /// attempted first and a lost claim means no reset at all.
    pub fn reset_stream(&self, id: StreamId, mode: ResetMode) -> bool {
        let stream = safe_lock(&self.streams)
            .entries
            .get(&id)
            .map(|entry| entry.stream.clone());
        let Some(stream) = stream else {
            return false;
        };

        if let ResetMode::Claim { reason, error } = mode {
            if !self.terminate(&stream, reason, Err(error)) {
                return false;
            }
        }

        let entry = safe_lock(&self.streams).entries.remove(&id);
        let Some(entry) = entry else {
            // Exchange finished in the meantime, nothing left on the wire
            return false;
        };
        if let Some(exchange) = &entry.exchange {
            exchange.abort();
        }
        self.transport.reset(id);

        debug!(
            connection_id = self.id,
            endpoint = %self.endpoint,
            stream_id = %id,
            state = stream.state().as_str(),
            "Stream reset sent"
        );
        true
    }

    /// Transport failure: every tracked stream ends `Errored`, exactly once each
    pub fn fail(&self, error: ClientError) -> usize {
        warn!(
            connection_id = self.id,
            endpoint = %self.endpoint,
            error = %error,
            "Connection failed, terminating its streams"
        );
        self.shutdown(error)
    }

    /// Graceful close: stop accepting streams, shut down once drained
    pub fn close(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.set_state(ConnectionState::Closing);
        if self.active_streams() == 0 {
            info!(
                connection_id = self.id,
                endpoint = %self.endpoint,
                "Closing connection"
            );
            self.shutdown(ClientError::Connection("connection closed".to_string()));
        }
    }

    fn shutdown(&self, error: ClientError) -> usize {
        self.set_state(ConnectionState::Closed);

        let entries: Vec<StreamEntry> = safe_lock(&self.streams)
            .entries
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        let mut terminated = 0;
        for entry in entries {
            if self.terminate(&entry.stream, TerminalReason::Errored, Err(error.clone())) {
                terminated += 1;
            }
            if let Some(exchange) = &entry.exchange {
                exchange.abort();
            }
        }

        self.transport.close();
        // Queued callers may now open a replacement connection
        self.capacity.notify_waiters();
        terminated
    }
}
