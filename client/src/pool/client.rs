//! Client Facade
//!
//! Entry point for callers: builds requests, routes them to the endpoint's
//! pool, arms request deadlines and exposes the in-use metrics snapshot.
//!
//! Pools are created lazily per endpoint. A background reaper evicts idle
//! connections and drops pools that have nothing left in them.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::pool::connection::{Connection, ResetMode};
use crate::pool::endpoint_pool::{EndpointPool, PoolConfig, PoolStats};
use crate::pool::metrics::{safe_lock, CounterSnapshot, MetricsRecorder};
use crate::pool::stream::{Outcome, Stream};
use crate::pool::timeout::RequestInfo;
use crate::pool::transport::{Connector, Http2Connector, HttpResponse};
use common::{Endpoint, StreamId, StreamState, TerminalReason};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Method, Request};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Safe RwLock read helper that recovers from poisoning
#[inline]
fn safe_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned during read, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// Safe RwLock write helper that recovers from poisoning
#[inline]
fn safe_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned during write, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// Pooled HTTP/2 client
///
/// Cheap to clone; clones share pools and metrics.
pub struct Client<C: Connector = Http2Connector> {
    inner: Arc<ClientInner<C>>,
}

impl<C: Connector> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ClientInner<C: Connector> {
    config: ClientConfig,
    pool_config: PoolConfig,
    connector: Arc<C>,
    recorder: MetricsRecorder,
    pools: RwLock<HashMap<Endpoint, Arc<EndpointPool<C>>>>,
    reaper: Mutex<Option<AbortHandle>>,
    closed: AtomicBool,
}

impl Client<Http2Connector> {
    /// Start a client speaking HTTP/2 over TCP
    pub fn start(config: ClientConfig) -> Result<Self, ClientError> {
        Self::with_connector(config, Http2Connector::new())
    }
}

impl<C: Connector> Client<C> {
    /// Start a client with a custom connector, publishing into the global registry
    pub fn with_connector(config: ClientConfig, connector: C) -> Result<Self, ClientError> {
        config.validate()?;
        let recorder = MetricsRecorder::new(&config.metrics, &config.metrics_name)?;
        Self::with_parts(config, connector, recorder)
    }

    /// Start a client from explicit parts (injected recorder for isolated metrics)
    pub fn with_parts(
        config: ClientConfig,
        connector: C,
        recorder: MetricsRecorder,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let inner = Arc::new(ClientInner {
            pool_config: PoolConfig::from(&config),
            config,
            connector: Arc::new(connector),
            recorder,
            pools: RwLock::new(HashMap::new()),
            reaper: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let reaper = ClientInner::spawn_reaper(&inner);
        *safe_lock(&inner.reaper) = reaper;

        info!(
            metrics_name = %inner.config.metrics_name,
            max_connections = inner.pool_config.max_connections,
            max_streams = inner.pool_config.max_streams_per_connection,
            request_timeout_ms = inner.config.request_timeout_ms,
            "Client started"
        );

        Ok(Self { inner })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn metrics_name(&self) -> &str {
        self.inner.recorder.metrics_name()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn get(&self, port: u16, host: &str, path: &str) -> RequestBuilder<C> {
        self.request(Method::GET, port, host, path)
    }

    pub fn post(&self, port: u16, host: &str, path: &str) -> RequestBuilder<C> {
        self.request(Method::POST, port, host, path)
    }

    /// Request template against `host:port`; reusable via `send()`
    pub fn request(&self, method: Method, port: u16, host: &str, path: &str) -> RequestBuilder<C> {
        RequestBuilder {
            client: self.clone(),
            method,
            endpoint: Endpoint::new(host, port),
            path: path.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout: None,
            error: None,
        }
    }

    /// Acquire a stream for the request and put it on the wire
    pub async fn dispatch(&self, request: &RequestBuilder<C>) -> Result<PendingResponse<C>, ClientError> {
        let http_request = request.build()?;
        let pool = self.inner.pool_for(&request.endpoint)?;
        let acquired = pool.acquire_stream().await?;

        let timeout = request
            .timeout
            .or_else(|| self.inner.config.request_timeout())
            .map(|duration| {
                (
                    duration,
                    RequestInfo {
                        method: request.method.to_string(),
                        path: request.path.clone(),
                    },
                )
            });

        debug!(
            endpoint = %request.endpoint,
            connection_id = acquired.connection.id(),
            stream_id = %acquired.stream.id(),
            method = %request.method,
            path = %request.path,
            "Dispatching request"
        );
        acquired
            .connection
            .dispatch(&acquired.stream, http_request, timeout);

        Ok(PendingResponse {
            connection: acquired.connection,
            stream: acquired.stream,
            outcome: acquired.outcome,
        })
    }

    /// Current in-use counters keyed by dotted name
    pub fn metrics_snapshot(&self) -> BTreeMap<String, CounterSnapshot> {
        self.inner.recorder.snapshot()
    }

    pub fn metrics_snapshot_json(&self) -> serde_json::Value {
        self.inner.recorder.snapshot_json()
    }

    /// Snapshot key this client publishes for an endpoint
    pub fn in_use_key(&self, endpoint: &Endpoint) -> String {
        self.inner.recorder.in_use_key(endpoint)
    }

    /// Prometheus text exposition of the recorder's registry
    pub fn encode_metrics(&self) -> Result<Vec<u8>, String> {
        self.inner.recorder.encode_metrics()
    }

    pub async fn pool_stats(&self, endpoint: &Endpoint) -> Option<PoolStats> {
        let pool = safe_read(&self.inner.pools).get(endpoint).cloned()?;
        Some(pool.stats().await)
    }

    /// Run one reaper pass now
    pub async fn evict_idle(&self) -> usize {
        self.inner.reap_idle().await
    }

    /// Tear down pools and metrics
    ///
    /// In-flight requests end with `ClientError::Closed`; later requests are
    /// rejected. Safe to call more than once.
    pub async fn stop(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(metrics_name = %self.inner.config.metrics_name, "Client already stopped");
            return;
        }

        if let Some(reaper) = safe_lock(&self.inner.reaper).take() {
            reaper.abort();
        }

        let pools: Vec<_> = safe_write(&self.inner.pools).drain().map(|(_, pool)| pool).collect();
        let mut terminated = 0;
        for pool in &pools {
            terminated += pool.shutdown().await;
        }

        self.inner.recorder.close();

        info!(
            metrics_name = %self.inner.config.metrics_name,
            pools = pools.len(),
            terminated,
            "Client stopped"
        );
    }
}

impl<C: Connector> ClientInner<C> {
    fn pool_for(&self, endpoint: &Endpoint) -> Result<Arc<EndpointPool<C>>, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }

        if let Some(pool) = safe_read(&self.pools).get(endpoint) {
            return Ok(pool.clone());
        }

        let mut pools = safe_write(&self.pools);
        // Re-check under the write lock so stop() can't race a new pool
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let pool = pools.entry(endpoint.clone()).or_insert_with(|| {
            Arc::new(EndpointPool::new(
                endpoint.clone(),
                self.pool_config.clone(),
                self.connector.clone(),
                self.recorder.endpoint(endpoint),
            ))
        });
        Ok(pool.clone())
    }

    /// Evict idle connections; drop pools left empty and unreferenced
    async fn reap_idle(&self) -> usize {
        let pools: Vec<(Endpoint, Arc<EndpointPool<C>>)> = safe_read(&self.pools)
            .iter()
            .map(|(endpoint, pool)| (endpoint.clone(), pool.clone()))
            .collect();

        let mut evicted = 0;
        for (endpoint, pool) in pools {
            evicted += pool.evict_idle().await;
            if !pool.is_idle().await {
                continue;
            }

            let mut map = safe_write(&self.pools);
            // Map entry + this local handle: no request holds the pool
            let unreferenced = map
                .get(&endpoint)
                .is_some_and(|current| Arc::ptr_eq(current, &pool) && Arc::strong_count(&pool) == 2);
            if unreferenced {
                map.remove(&endpoint);
                debug!(endpoint = %endpoint, "Removed idle endpoint pool");
            }
        }
        evicted
    }

    /// Background idle reaper; holds only a weak reference to the client
    fn spawn_reaper(inner: &Arc<Self>) -> Option<AbortHandle> {
        // Only spawn if runtime is available (gracefully skip otherwise)
        if tokio::runtime::Handle::try_current().is_err() {
            debug!("No tokio runtime, idle reaper disabled");
            return None;
        }

        let weak: Weak<Self> = Arc::downgrade(inner);
        let period = reaper_period(inner.pool_config.idle_timeout);

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                let evicted = inner.reap_idle().await;
                if evicted > 0 {
                    debug!(evicted, "Idle reaper pass");
                }
            }
        });
        Some(task.abort_handle())
    }
}

/// Half the idle timeout, kept within [100ms, 30s]
fn reaper_period(idle_timeout: Duration) -> Duration {
    (idle_timeout / 2).clamp(Duration::from_millis(100), Duration::from_secs(30))
}

/// Request template
///
/// Invalid headers or paths are reported when the request is sent.
pub struct RequestBuilder<C: Connector = Http2Connector> {
    client: Client<C>,
    method: Method,
    endpoint: Endpoint,
    path: String,
    headers: HeaderMap,
    body: Bytes,
    timeout: Option<Duration>,
    error: Option<ClientError>,
}

impl<C: Connector> Clone for RequestBuilder<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            method: self.method.clone(),
            endpoint: self.endpoint.clone(),
            path: self.path.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            timeout: self.timeout,
            error: self.error.clone(),
        }
    }
}

impl<C: Connector> RequestBuilder<C> {
    /// Per-request deadline, overriding the client default
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        let parsed = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ClientError::InvalidRequest(format!("header name {:?}: {}", name, e)))
            .and_then(|name| {
                HeaderValue::from_str(value)
                    .map(|value| (name, value))
                    .map_err(|e| ClientError::InvalidRequest(format!("header value {:?}: {}", value, e)))
            });
        match parsed {
            Ok((name, value)) => {
                self.headers.append(name, value);
            }
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send and wait for the complete response
    pub async fn send(&self) -> Result<HttpResponse, ClientError> {
        self.dispatch().await?.await
    }

    /// Send and return a handle to the in-flight response
    pub async fn dispatch(&self) -> Result<PendingResponse<C>, ClientError> {
        self.client.dispatch(self).await
    }

    fn build(&self) -> Result<Request<Full<Bytes>>, ClientError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        if !self.path.starts_with('/') {
            return Err(ClientError::InvalidRequest(format!(
                "path must start with '/': {:?}",
                self.path
            )));
        }

        // HTTP/2 needs scheme and authority on the request URI
        let uri = format!("http://{}{}", self.endpoint, self.path);
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(uri)
            .body(Full::new(self.body.clone()))
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }
}

/// In-flight response
///
/// Resolves to the stream's outcome. Dropping it before the stream finishes
/// cancels the stream (one `Reset` claim, one reset on the wire).
pub struct PendingResponse<C: Connector = Http2Connector> {
    connection: Arc<Connection<C::Transport>>,
    stream: Arc<Stream>,
    outcome: oneshot::Receiver<Outcome>,
}

impl<C: Connector> PendingResponse<C> {
    pub fn stream_id(&self) -> StreamId {
        self.stream.id()
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    /// Cancel the request; false if it had already finished
    pub fn cancel(&self) -> bool {
        self.connection.reset_stream(
            self.stream.id(),
            ResetMode::Claim {
                reason: TerminalReason::Reset,
                error: ClientError::Canceled,
            },
        )
    }
}

impl<C: Connector> Future for PendingResponse<C> {
    type Output = Result<HttpResponse, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.outcome).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::Connection(
                "stream dropped without an outcome".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<C: Connector> Drop for PendingResponse<C> {
    fn drop(&mut self) {
        if !self.stream.is_terminal() {
            debug!(
                endpoint = %self.stream.endpoint(),
                stream_id = %self.stream.id(),
                "Pending response dropped, canceling stream"
            );
            self.cancel();
        }
    }
}
