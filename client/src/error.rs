use common::{Endpoint, StreamId};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to callers of the client
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Waiter queue full at acquire time; the request was never dispatched
    #[error("Connection pool exhausted for {endpoint}: {waiting} requests already queued")]
    PoolExhausted { endpoint: Endpoint, waiting: usize },

    #[error("Timed out after {}ms waiting for a pooled connection to {endpoint}", .waited.as_millis())]
    QueueTimeout { endpoint: Endpoint, waited: Duration },

    #[error("Connection error: {0}")]
    Connection(String),

    /// Request deadline expired. The message always contains "timeout".
    #[error(
        "The timeout period of {}ms has been exceeded while executing {method} {path} for server {endpoint}",
        .timeout.as_millis()
    )]
    Timeout {
        timeout: Duration,
        method: String,
        path: String,
        endpoint: Endpoint,
    },

    #[error("Stream {stream_id} reset by peer: {message}")]
    StreamReset { stream_id: StreamId, message: String },

    #[error("Request canceled")]
    Canceled,

    #[error("Client is closed")]
    Closed,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }
}
