//! Connection pool with per-endpoint in-use stream accounting

pub mod client;
pub mod connection;
pub mod endpoint_pool;
pub mod metrics;
pub mod stream;
pub mod timeout;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
