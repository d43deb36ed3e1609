//! Configuration for the streamgate client
//!
//! Pool sizing, request timeout and metrics publishing options. Loadable from
//! serde (JSON/TOML/...) or from `STREAMGATE_*` environment variables.

use crate::error::ClientError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Maximum physical connections per endpoint (default: 1)
    #[serde(default = "default_max_connections")]
    pub max_connections_per_endpoint: usize,

    /// Maximum concurrent streams per connection (default: 100)
    #[serde(default = "default_max_streams")]
    pub max_streams_per_connection: u32,

    /// Per-request timeout in milliseconds (default: none)
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,

    /// Maximum callers queued when the pool is saturated.
    /// `None` = unbounded, `Some(0)` = fail fast with PoolExhausted.
    #[serde(default)]
    pub max_waiters: Option<usize>,

    /// How long a queued caller waits for capacity (default: 30s)
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_ms: u64,

    /// Idle connection eviction threshold in seconds (default: 60s)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// TCP connect + HTTP/2 handshake timeout in milliseconds (default: 5s)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Logical name under which this client's counters are published
    #[serde(default = "default_metrics_name")]
    pub metrics_name: String,

    /// Metrics publishing configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metrics publishing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Publish per-endpoint counters (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prefix of every published key (default: "streamgate.http")
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Allow-list of endpoints that produce metrics entries
    #[serde(default)]
    pub monitored_endpoints: Vec<EndpointMatch>,
}

/// Allow-list entry matched against `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EndpointMatch {
    pub value: String,
    #[serde(default)]
    pub kind: MatchKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    #[default]
    Equals,
    Regex,
}

impl EndpointMatch {
    pub fn equals(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: MatchKind::Equals,
        }
    }

    pub fn regex(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: MatchKind::Regex,
        }
    }
}

/// Compiled form of an `EndpointMatch`
#[derive(Debug, Clone)]
pub(crate) enum EndpointMatcher {
    Equals(String),
    Regex(Regex),
}

impl EndpointMatcher {
    pub(crate) fn compile(m: &EndpointMatch) -> Result<Self, ClientError> {
        match m.kind {
            MatchKind::Equals => Ok(EndpointMatcher::Equals(m.value.clone())),
            MatchKind::Regex => {
                // Anchor so "localhost:80" doesn't match "localhost:8080"
                let anchored = format!("^(?:{})$", m.value);
                Regex::new(&anchored)
                    .map(EndpointMatcher::Regex)
                    .map_err(|e| {
                        ClientError::Config(format!("invalid endpoint pattern {}: {}", m.value, e))
                    })
            }
        }
    }

    pub(crate) fn matches(&self, endpoint: &str) -> bool {
        match self {
            EndpointMatcher::Equals(value) => value == endpoint,
            EndpointMatcher::Regex(re) => re.is_match(endpoint),
        }
    }
}

fn default_max_connections() -> usize {
    1
}

fn default_max_streams() -> u32 {
    common::DEFAULT_MAX_STREAMS_PER_CONNECTION
}

fn default_queue_timeout() -> u64 {
    30_000
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_metrics_name() -> String {
    "default".to_string()
}

fn default_namespace() -> String {
    "streamgate.http".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            namespace: default_namespace(),
            monitored_endpoints: Vec::new(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_connections_per_endpoint: default_max_connections(),
            max_streams_per_connection: default_max_streams(),
            request_timeout_ms: None,
            max_waiters: None,
            queue_timeout_ms: default_queue_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            metrics_name: default_metrics_name(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reject configurations the pool cannot honor
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.max_connections_per_endpoint == 0 {
            return Err(ClientError::Config(
                "max_connections_per_endpoint must be at least 1".to_string(),
            ));
        }
        if self.max_streams_per_connection == 0 {
            return Err(ClientError::Config(
                "max_streams_per_connection must be at least 1".to_string(),
            ));
        }
        if self.metrics_name.is_empty() {
            return Err(ClientError::Config("metrics_name must not be empty".to_string()));
        }
        for m in &self.metrics.monitored_endpoints {
            EndpointMatcher::compile(m)?;
        }
        Ok(())
    }

    /// Load configuration from environment variables
    ///
    /// `STREAMGATE_MONITORED_ENDPOINTS` is a comma-separated list of exact
    /// `host:port` values.
    pub fn from_env() -> Result<Self, ClientError> {
        let mut config = Self::default();

        if let Some(val) = parse_env::<usize>("STREAMGATE_MAX_CONNECTIONS")? {
            config.max_connections_per_endpoint = val;
        }
        if let Some(val) = parse_env::<u32>("STREAMGATE_MAX_STREAMS")? {
            config.max_streams_per_connection = val;
        }
        if let Some(val) = parse_env::<u64>("STREAMGATE_REQUEST_TIMEOUT_MS")? {
            config.request_timeout_ms = Some(val);
        }
        if let Some(val) = parse_env::<usize>("STREAMGATE_MAX_WAITERS")? {
            config.max_waiters = Some(val);
        }
        if let Some(val) = parse_env::<u64>("STREAMGATE_QUEUE_TIMEOUT_MS")? {
            config.queue_timeout_ms = val;
        }
        if let Ok(val) = env::var("STREAMGATE_METRICS_NAME") {
            config.metrics_name = val;
        }
        if let Ok(val) = env::var("STREAMGATE_METRICS_NAMESPACE") {
            config.metrics.namespace = val;
        }
        if let Ok(val) = env::var("STREAMGATE_MONITORED_ENDPOINTS") {
            config.metrics.monitored_endpoints = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(EndpointMatch::equals)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ClientError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map(Some)
            .map_err(|e| ClientError::Config(format!("{}={}: {}", key, val, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.max_connections_per_endpoint, 1);
        assert_eq!(config.max_streams_per_connection, 100);
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.max_waiters, None, "Waiter queue unbounded by default");
        assert_eq!(config.queue_timeout(), Duration::from_secs(30));
        assert_eq!(config.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.metrics_name, "default");
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.namespace, "streamgate.http");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{
                "request_timeout_ms": 2000,
                "metrics_name": "resetStreamTest",
                "metrics": {
                    "monitored_endpoints": [
                        { "value": "localhost:8080" },
                        { "value": "10\\.0\\..*", "kind": "regex" }
                    ]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.request_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.metrics_name, "resetStreamTest");
        assert_eq!(config.max_streams_per_connection, 100);
        assert_eq!(
            config.metrics.monitored_endpoints,
            vec![
                EndpointMatch::equals("localhost:8080"),
                EndpointMatch::regex("10\\.0\\..*"),
            ]
        );
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = ClientConfig {
            max_connections_per_endpoint: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));

        let config = ClientConfig {
            max_streams_per_connection: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        let mut config = ClientConfig::default();
        config.metrics.monitored_endpoints = vec![EndpointMatch::regex("local(host")];
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_matcher_equals_and_anchored_regex() {
        let exact = EndpointMatcher::compile(&EndpointMatch::equals("localhost:80")).unwrap();
        assert!(exact.matches("localhost:80"));
        assert!(!exact.matches("localhost:8080"));

        let re = EndpointMatcher::compile(&EndpointMatch::regex("localhost:80")).unwrap();
        assert!(re.matches("localhost:80"));
        assert!(!re.matches("localhost:8080"), "Regex must be anchored");

        let any_port = EndpointMatcher::compile(&EndpointMatch::regex("localhost:\\d+")).unwrap();
        assert!(any_port.matches("localhost:8080"));
        assert!(!any_port.matches("example.com:8080"));
    }
}
