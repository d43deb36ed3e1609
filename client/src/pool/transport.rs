//! Physical transport seam
//!
//! `Connector` opens a transport to an endpoint; `Transport` carries
//! exchanges over it. The pool is generic over both so tests can swap in an
//! in-memory transport.
//!
//! The production implementation is HTTP/2 over TCP (prior knowledge, h2c)
//! using hyper's connection-level client. Dropping an in-flight
//! `send_request` future makes hyper emit RST_STREAM(CANCEL) for that stream,
//! which is how a stream reset reaches the wire.

use async_trait::async_trait;
use common::{Endpoint, StreamId};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::http2;
use hyper::{HeaderMap, Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// Fully buffered response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    /// Response with the given status and no headers or body
    pub fn empty(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("HTTP/2 handshake failed: {0}")]
    Handshake(String),

    /// The whole connection is gone; every stream on it is affected
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The peer aborted this one stream
    #[error("Stream reset: {0}")]
    StreamReset(String),
}

/// One physical connection able to carry concurrent exchanges
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a request and wait for the complete response
    async fn send(&self, request: Request<Full<Bytes>>) -> Result<HttpResponse, TransportError>;

    /// Protocol-level abort of a stream whose exchange future has been dropped
    fn reset(&self, stream_id: StreamId);

    fn is_closed(&self) -> bool;

    fn close(&self);
}

/// Opens transports to endpoints
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Transport, TransportError>;
}

/// HTTP/2 (h2c, prior knowledge) connector
#[derive(Debug, Clone, Default)]
pub struct Http2Connector;

impl Http2Connector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for Http2Connector {
    type Transport = Http2Transport;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Http2Transport, TransportError> {
        debug!(endpoint = %endpoint, "Creating new HTTP/2 connection");

        // Connect TCP (tries every resolved address)
        let stream = TcpStream::connect((endpoint.host(), endpoint.port()))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!(endpoint = %endpoint, error = %e, "Failed to set TCP_NODELAY");
        }

        let io = TokioIo::new(stream);

        // HTTP/2 handshake
        let (sender, conn) = http2::handshake(TokioExecutor::new(), io)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        // Spawn connection driver; the flag flips when the connection ends
        let closed = Arc::new(AtomicBool::new(false));
        let driver_closed = closed.clone();
        let driver_endpoint = endpoint.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(endpoint = %driver_endpoint, error = %e, "HTTP/2 connection closed");
            }
            driver_closed.store(true, Ordering::Release);
        });

        Ok(Http2Transport {
            sender,
            closed,
            driver: driver.abort_handle(),
        })
    }
}

/// HTTP/2 connection to one endpoint
pub struct Http2Transport {
    sender: http2::SendRequest<Full<Bytes>>,
    closed: Arc<AtomicBool>,
    driver: AbortHandle,
}

impl Http2Transport {
    /// Classify a hyper error as connection-level or stream-level
    fn classify(&self, e: hyper::Error) -> TransportError {
        if self.is_closed() || e.is_closed() || e.is_canceled() || has_io_source(&e) {
            TransportError::ConnectionLost(e.to_string())
        } else {
            // Remaining h2 errors on a live connection are per-stream (RST_STREAM, refused stream)
            TransportError::StreamReset(e.to_string())
        }
    }
}

fn has_io_source(e: &hyper::Error) -> bool {
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if err.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }
        source = err.source();
    }
    false
}

#[async_trait]
impl Transport for Http2Transport {
    async fn send(&self, request: Request<Full<Bytes>>) -> Result<HttpResponse, TransportError> {
        let mut sender = self.sender.clone();
        sender.ready().await.map_err(|e| self.classify(e))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| self.classify(e))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| self.classify(e))?
            .to_bytes();

        Ok(HttpResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    fn reset(&self, stream_id: StreamId) {
        // The exchange future was dropped by the caller, so hyper has already queued RST_STREAM
        trace!(stream_id = %stream_id, "HTTP/2 stream reset (CANCEL)");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.driver.abort();
    }
}
