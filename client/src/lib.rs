//! Streamgate Client Library
//!
//! Pooled HTTP/2 client that publishes an exact count of in-use streams per
//! endpoint, correct across completion, timeout, cancellation, remote reset
//! and connection failure.

pub mod config;
pub mod error;
pub mod pool;

pub use config::{ClientConfig, EndpointMatch, MatchKind, MetricsConfig};
pub use error::ClientError;
pub use pool::client::{Client, PendingResponse, RequestBuilder};
pub use pool::endpoint_pool::PoolStats;
pub use pool::metrics::{CounterSnapshot, MetricsRecorder};
pub use pool::transport::{Connector, Http2Connector, HttpResponse, Transport, TransportError};
