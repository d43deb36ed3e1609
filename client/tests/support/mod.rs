//! Local HTTP/2 (h2c) backend for integration tests
//!
//! Paths:
//! - `/delay/<ms>` responds 200 after sleeping `<ms>`
//! - `/reset` fails the handler, so the server resets the stream
//! - anything else responds 200, or hangs forever while `respond` is off

#![allow(dead_code, clippy::expect_used, clippy::panic)]

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct ServerState {
    respond: AtomicBool,
    requests: AtomicUsize,
}

pub struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test server");
        let addr = listener.local_addr().expect("Failed to read local addr");

        let state = Arc::new(ServerState {
            respond: AtomicBool::new(true),
            requests: AtomicUsize::new(0),
        });

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = TokioIo::new(stream);
                let state = accept_state.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| handle_request(req, state.clone()));
                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        eprintln!("Error serving connection: {}", e);
                    }
                });
            }
        });

        Self { addr, state, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Toggle between answering and hanging forever
    pub fn set_respond(&self, respond: bool) {
        self.state.respond.store(respond, Ordering::SeqCst);
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<Full<Bytes>>, String> {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let path = req.uri().path().to_string();

    if path == "/reset" {
        return Err("handler failure".to_string());
    }

    if let Some(ms) = path.strip_prefix("/delay/") {
        let ms: u64 = ms.parse().map_err(|e| format!("bad delay {}: {}", ms, e))?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
    } else if !state.respond.load(Ordering::SeqCst) {
        std::future::pending::<()>().await;
    }

    Response::builder()
        .status(200)
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from_static(b"ok")))
        .map_err(|e| format!("Failed to build response: {}", e))
}
