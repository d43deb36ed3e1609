//! In-memory transport for unit tests

#![allow(clippy::unwrap_used)]

use crate::pool::transport::{Connector, HttpResponse, Transport, TransportError};
use async_trait::async_trait;
use common::{Endpoint, StreamId};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Request;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the mock peer answers requests
#[derive(Debug, Clone, Copy)]
pub(crate) enum MockMode {
    Respond { status: u16, delay: Duration },
    Hang,
    ConnectionLost,
    StreamReset,
}

/// Shared knobs and counters for every transport a `MockConnector` opens
#[derive(Debug)]
pub(crate) struct MockControl {
    mode: Mutex<MockMode>,
    pub(crate) connects: AtomicUsize,
    pub(crate) sends: AtomicUsize,
    pub(crate) resets: Mutex<Vec<StreamId>>,
    pub(crate) refuse_connect: AtomicBool,
}

impl MockControl {
    pub(crate) fn set_mode(&self, mode: MockMode) {
        *self.mode.lock().unwrap() = mode;
    }

    fn mode(&self) -> MockMode {
        *self.mode.lock().unwrap()
    }

    pub(crate) fn reset_count(&self) -> usize {
        self.resets.lock().unwrap().len()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockConnector {
    pub(crate) control: Arc<MockControl>,
}

impl MockConnector {
    pub(crate) fn new(mode: MockMode) -> Self {
        Self {
            control: Arc::new(MockControl {
                mode: Mutex::new(mode),
                connects: AtomicUsize::new(0),
                sends: AtomicUsize::new(0),
                resets: Mutex::new(Vec::new()),
                refuse_connect: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn ok() -> Self {
        Self::new(MockMode::Respond {
            status: 200,
            delay: Duration::ZERO,
        })
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self, endpoint: &Endpoint) -> Result<MockTransport, TransportError> {
        if self.control.refuse_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("{} refused", endpoint)));
        }
        self.control.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockTransport {
            control: self.control.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

#[derive(Debug)]
pub(crate) struct MockTransport {
    control: Arc<MockControl>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, _request: Request<Full<Bytes>>) -> Result<HttpResponse, TransportError> {
        self.control.sends.fetch_add(1, Ordering::SeqCst);
        match self.control.mode() {
            MockMode::Respond { status, delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(HttpResponse::empty(status))
            }
            MockMode::Hang => std::future::pending().await,
            MockMode::ConnectionLost => {
                self.closed.store(true, Ordering::SeqCst);
                Err(TransportError::ConnectionLost("socket closed".to_string()))
            }
            MockMode::StreamReset => Err(TransportError::StreamReset("RST_STREAM(REFUSED_STREAM)".to_string())),
        }
    }

    fn reset(&self, stream_id: StreamId) {
        self.control.resets.lock().unwrap().push(stream_id);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Bodyless GET for tests
pub(crate) fn get_request() -> Request<Full<Bytes>> {
    Request::builder()
        .uri("http://localhost:8080/test")
        .body(Full::new(Bytes::new()))
        .unwrap()
}
