//! Per-Endpoint Connection Pool
//!
//! Streams are placed on the least-loaded open connection with spare
//! capacity. When every connection is full a new one is opened, up to
//! `max_connections`; beyond that callers queue until a stream slot is
//! released or `queue_timeout` expires.
//!
//! Key features:
//! - Lazy connection creation with a bounded connect timeout
//! - Dead connections evicted on every acquire
//! - Bounded FIFO waiter queue (`max_waiters`): once anyone is queued,
//!   newcomers line up behind them instead of taking a released slot
//! - Idle connection eviction driven by the client's reaper

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::pool::connection::Connection;
use crate::pool::metrics::{safe_lock, EndpointMetrics};
use crate::pool::stream::{Outcome, Stream};
use crate::pool::transport::Connector;
use common::Endpoint;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, info, warn};

/// Configuration for one endpoint's pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_streams_per_connection: u32,
    /// `None` = unbounded
    pub max_waiters: Option<usize>,
    pub queue_timeout: Duration,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl From<&ClientConfig> for PoolConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_connections: config.max_connections_per_endpoint,
            max_streams_per_connection: config.max_streams_per_connection,
            max_waiters: config.max_waiters,
            queue_timeout: config.queue_timeout(),
            idle_timeout: config.idle_timeout(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

/// Statistics for an endpoint's pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub connections: usize,
    pub active_streams: usize,
    pub waiting: usize,
}

/// A stream placed on a connection, ready for dispatch
pub struct AcquiredStream<C: Connector> {
    pub connection: Arc<Connection<C::Transport>>,
    pub stream: Arc<Stream>,
    pub outcome: oneshot::Receiver<Outcome>,
}

/// Holds a caller's place in the waiter queue for as long as it waits
///
/// Dropping the guard (slot taken, timeout or cancellation) leaves the queue
/// and wakes the others so the next in line re-checks.
struct WaiterGuard<'a> {
    queue: &'a StdMutex<VecDeque<u64>>,
    capacity: &'a Notify,
    ticket: u64,
}

impl<'a> WaiterGuard<'a> {
    fn new(queue: &'a StdMutex<VecDeque<u64>>, capacity: &'a Notify, ticket: u64) -> Self {
        safe_lock(queue).push_back(ticket);
        Self {
            queue,
            capacity,
            ticket,
        }
    }

    fn is_head(&self) -> bool {
        safe_lock(self.queue).front() == Some(&self.ticket)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        safe_lock(self.queue).retain(|ticket| *ticket != self.ticket);
        self.capacity.notify_waiters();
    }
}

/// Connection pool for one endpoint
///
/// Generic over the connector so tests can run without sockets
pub struct EndpointPool<C: Connector> {
    endpoint: Endpoint,
    config: PoolConfig,
    connector: Arc<C>,
    metrics: Option<EndpointMetrics>,
    // Insertion order doubles as the tie-breaker for least-loaded selection
    connections: Mutex<Vec<Arc<Connection<C::Transport>>>>,
    capacity: Arc<Notify>,
    // Tickets of queued callers, oldest first
    waiters: StdMutex<VecDeque<u64>>,
    next_ticket: AtomicU64,
    next_connection_id: AtomicU64,
    closed: AtomicBool,
}

impl<C: Connector> EndpointPool<C> {
    pub fn new(
        endpoint: Endpoint,
        config: PoolConfig,
        connector: Arc<C>,
        metrics: Option<EndpointMetrics>,
    ) -> Self {
        debug!(
            endpoint = %endpoint,
            max_connections = config.max_connections,
            max_streams = config.max_streams_per_connection,
            "Creating endpoint pool"
        );
        Self {
            endpoint,
            config,
            connector,
            metrics,
            connections: Mutex::new(Vec::new()),
            capacity: Arc::new(Notify::new()),
            waiters: StdMutex::new(VecDeque::new()),
            next_ticket: AtomicU64::new(0),
            next_connection_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Place a new stream on a connection
    ///
    /// Policy, in order:
    /// 1. Least-loaded open connection with spare capacity
    /// 2. New connection while below `max_connections`
    /// 3. Queue for a released slot (bounded by `max_waiters` and `queue_timeout`)
    ///
    /// Steps 1 and 2 are only open to the head of the queue, or to anyone
    /// while the queue is empty.
    pub async fn acquire_stream(&self) -> Result<AcquiredStream<C>, ClientError> {
        let queue_deadline = tokio::time::Instant::now() + self.config.queue_timeout;
        let mut waiter: Option<WaiterGuard<'_>> = None;

        loop {
            if self.is_closed() {
                return Err(ClientError::Closed);
            }

            // Register interest before checking capacity so a release between
            // the check and the wait is not missed
            let notified = self.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut connections = self.connections.lock().await;

                // shutdown() may have drained the list while we waited for the lock
                if self.is_closed() {
                    return Err(ClientError::Closed);
                }

                let my_turn = match &waiter {
                    Some(guard) => guard.is_head(),
                    None => self.waiting() == 0,
                };

                if my_turn {
                    // 1. Clean up dead connections first
                    let before = connections.len();
                    connections.retain(|c| !c.is_closed());
                    if connections.len() < before {
                        debug!(
                            endpoint = %self.endpoint,
                            evicted = before - connections.len(),
                            "Evicted closed connections"
                        );
                    }

                    // 2. Least-loaded connection with capacity (first minimum wins ties)
                    let candidate = connections
                        .iter()
                        .filter(|c| c.has_capacity())
                        .min_by_key(|c| c.active_streams())
                        .cloned();

                    if let Some(connection) = candidate {
                        match connection.open_stream(self.metrics.clone()) {
                            Ok((stream, outcome)) => {
                                return Ok(AcquiredStream {
                                    connection,
                                    stream,
                                    outcome,
                                });
                            }
                            Err(e) => {
                                // Lost a race with close; re-evaluate
                                debug!(
                                    endpoint = %self.endpoint,
                                    connection_id = connection.id(),
                                    error = %e,
                                    "Retrying stream placement"
                                );
                                continue;
                            }
                        }
                    }

                    // 3. Create new connection if under limit
                    if connections.len() < self.config.max_connections {
                        let connection = self.connect().await?;
                        let (stream, outcome) = connection
                            .open_stream(self.metrics.clone())
                            .map_err(|e| ClientError::Connection(e.to_string()))?;
                        connections.push(connection.clone());
                        return Ok(AcquiredStream {
                            connection,
                            stream,
                            outcome,
                        });
                    }
                }

                // 4. All connections maxed out, or others are already queued
                if waiter.is_none() {
                    let waiting = self.waiting();
                    if let Some(max_waiters) = self.config.max_waiters {
                        if waiting >= max_waiters {
                            warn!(
                                endpoint = %self.endpoint,
                                waiting,
                                max_waiters,
                                "Connection pool exhausted"
                            );
                            return Err(ClientError::PoolExhausted {
                                endpoint: self.endpoint.clone(),
                                waiting,
                            });
                        }
                    }
                    let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                    waiter = Some(WaiterGuard::new(&self.waiters, &self.capacity, ticket));
                    debug!(
                        endpoint = %self.endpoint,
                        ticket,
                        waiting = waiting + 1,
                        "All connections at capacity, queueing request"
                    );
                }
            }

            if tokio::time::timeout_at(queue_deadline, notified).await.is_err() {
                warn!(
                    endpoint = %self.endpoint,
                    queue_timeout_ms = self.config.queue_timeout.as_millis() as u64,
                    "Gave up waiting for a pooled connection"
                );
                return Err(ClientError::QueueTimeout {
                    endpoint: self.endpoint.clone(),
                    waited: self.config.queue_timeout,
                });
            }
        }
    }

    fn waiting(&self) -> usize {
        safe_lock(&self.waiters).len()
    }

    /// Open a new connection to the endpoint
    async fn connect(&self) -> Result<Arc<Connection<C::Transport>>, ClientError> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connect_timeout = self.config.connect_timeout;

        let transport = match tokio::time::timeout(connect_timeout, self.connector.connect(&self.endpoint)).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                warn!(endpoint = %self.endpoint, error = %e, "Failed to open connection");
                return Err(ClientError::Connection(e.to_string()));
            }
            Err(_) => {
                warn!(
                    endpoint = %self.endpoint,
                    connect_timeout_ms = connect_timeout.as_millis() as u64,
                    "Connection attempt did not complete in time"
                );
                return Err(ClientError::Connection(format!(
                    "connect to {} did not complete within {}ms",
                    self.endpoint,
                    connect_timeout.as_millis()
                )));
            }
        };

        info!(
            endpoint = %self.endpoint,
            connection_id = id,
            max_streams = self.config.max_streams_per_connection,
            "Opened connection"
        );

        Ok(Arc::new(Connection::new(
            id,
            self.endpoint.clone(),
            transport,
            self.config.max_streams_per_connection,
            self.capacity.clone(),
        )))
    }

    /// Close and drop connections with no active streams idle past `idle_timeout`
    pub async fn evict_idle(&self) -> usize {
        let mut connections = self.connections.lock().await;
        let before = connections.len();
        let idle_timeout = self.config.idle_timeout;

        connections.retain(|connection| {
            if connection.is_closed() {
                return false;
            }
            if connection.active_streams() == 0 && connection.idle_for() >= idle_timeout {
                info!(
                    endpoint = %self.endpoint,
                    connection_id = connection.id(),
                    idle_ms = connection.idle_for().as_millis() as u64,
                    "Evicting idle connection"
                );
                connection.close();
                return false;
            }
            true
        });

        before - connections.len()
    }

    /// Fail every connection and reject further acquires. Idempotent.
    ///
    /// Returns the number of streams terminated.
    pub async fn shutdown(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let connections: Vec<_> = self.connections.lock().await.drain(..).collect();
        let terminated: usize = connections
            .iter()
            .map(|connection| connection.fail(ClientError::Closed))
            .sum();

        // Queued callers observe `closed` and return
        self.capacity.notify_waiters();

        info!(
            endpoint = %self.endpoint,
            connections = connections.len(),
            terminated,
            "Endpoint pool shut down"
        );
        terminated
    }

    pub async fn stats(&self) -> PoolStats {
        let connections = self.connections.lock().await;
        PoolStats {
            connections: connections.len(),
            active_streams: connections.iter().map(|c| c.active_streams()).sum(),
            waiting: self.waiting(),
        }
    }

    /// No connections and nobody queued
    pub async fn is_idle(&self) -> bool {
        let connections = self.connections.lock().await;
        connections.is_empty() && self.waiting() == 0
    }
}
