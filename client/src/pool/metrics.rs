//! Per-endpoint In-Use Stream Metrics
//!
//! Prometheus gauges counting the streams currently Active against each
//! monitored endpoint, plus a dotted-key snapshot view:
//!
//! `<namespace>.clients.<metricsName>.endpoint.<host>:<port>.in-use -> { count }`
//!
//! The recorder performs no deduplication. Each stream increments once when it
//! becomes Active and decrements once when it wins its terminal claim
//! (see `stream.rs`).
//!
//! Two registration modes:
//! - `MetricsRecorder::new` uses the process-wide `METRICS_REGISTRY`
//! - `MetricsRecorder::with_registry` registers into an injected registry

use crate::config::{EndpointMatcher, MetricsConfig};
use crate::error::ClientError;
use common::Endpoint;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

const IN_USE_METRIC: &str = "streamgate_client_streams_in_use";
const IN_USE_HELP: &str = "Streams currently active per client and endpoint";

lazy_static! {
    /// Global metrics registry for client metrics
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    /// Active streams gauge
    ///
    /// Labels:
    /// - client: metrics name of the client (e.g., "resetStreamTest")
    /// - endpoint: "host:port"
    ///
    /// Note: Fallback metrics use .expect() as last line of defense - if Prometheus itself is broken, we should panic
    #[allow(clippy::expect_used)]
    static ref IN_USE_STREAMS: IntGaugeVec = {
        let gauge = IntGaugeVec::new(Opts::new(IN_USE_METRIC, IN_USE_HELP), &["client", "endpoint"])
            .unwrap_or_else(|e| {
                eprintln!("WARN: Failed to create {} gauge: {}", IN_USE_METRIC, e);
                #[allow(clippy::expect_used)]
                {
                    IntGaugeVec::new(
                        Opts::new("streamgate_client_streams_in_use_fallback", "Fallback metric for in-use streams"),
                        &["client", "endpoint"]
                    ).expect("Fallback metric creation should never fail - if this panics, Prometheus is broken")
                }
            });
        if let Err(e) = METRICS_REGISTRY.register(Box::new(gauge.clone())) {
            eprintln!("WARN: Failed to register {} gauge: {}", IN_USE_METRIC, e);
            eprintln!("WARN: Metrics collection will be degraded but the client will continue");
        }
        gauge
    };
}

/// Safe Mutex lock helper that recovers from poisoning
#[inline]
pub(crate) fn safe_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!("Mutex poisoned, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// One entry of the metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub count: i64,
}

/// Gauge for one (client, endpoint) pair
struct EndpointSlot {
    gauge: IntGauge,
    /// Set on first increment; snapshot hides the key until then
    activated: AtomicBool,
}

impl std::fmt::Debug for EndpointSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointSlot")
            .field("count", &self.gauge.get())
            .field("activated", &self.activated.load(Ordering::Relaxed))
            .finish()
    }
}

/// Handle a pool uses to account streams against its endpoint
///
/// Cloned into every stream. Operations are single atomic adds, no locks.
#[derive(Debug, Clone)]
pub struct EndpointMetrics {
    slot: Arc<EndpointSlot>,
}

impl EndpointMetrics {
    pub fn increment(&self) {
        self.slot.activated.store(true, Ordering::Release);
        self.slot.gauge.inc();
    }

    pub fn decrement(&self) {
        self.slot.gauge.dec();
    }

    pub fn count(&self) -> i64 {
        self.slot.gauge.get()
    }
}

/// Counter registry for one client
pub struct MetricsRecorder {
    namespace: String,
    metrics_name: String,
    enabled: bool,
    matchers: Vec<EndpointMatcher>,
    gauges: IntGaugeVec,
    registry: Registry,
    entries: Mutex<HashMap<Endpoint, Arc<EndpointSlot>>>,
    closed: AtomicBool,
}

impl MetricsRecorder {
    /// Recorder publishing into the process-wide registry
    pub fn new(config: &MetricsConfig, metrics_name: &str) -> Result<Self, ClientError> {
        Self::build(
            config,
            metrics_name,
            IN_USE_STREAMS.clone(),
            METRICS_REGISTRY.clone(),
        )
    }

    /// Recorder publishing into an injected registry
    pub fn with_registry(
        config: &MetricsConfig,
        metrics_name: &str,
        registry: &Registry,
    ) -> Result<Self, ClientError> {
        let gauges = IntGaugeVec::new(Opts::new(IN_USE_METRIC, IN_USE_HELP), &["client", "endpoint"])
            .map_err(|e| ClientError::Config(format!("failed to create {}: {}", IN_USE_METRIC, e)))?;
        registry
            .register(Box::new(gauges.clone()))
            .map_err(|e| ClientError::Config(format!("failed to register {}: {}", IN_USE_METRIC, e)))?;
        Self::build(config, metrics_name, gauges, registry.clone())
    }

    fn build(
        config: &MetricsConfig,
        metrics_name: &str,
        gauges: IntGaugeVec,
        registry: Registry,
    ) -> Result<Self, ClientError> {
        let matchers = config
            .monitored_endpoints
            .iter()
            .map(EndpointMatcher::compile)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            namespace: config.namespace.clone(),
            metrics_name: metrics_name.to_string(),
            enabled: config.enabled,
            matchers,
            gauges,
            registry,
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn metrics_name(&self) -> &str {
        &self.metrics_name
    }

    /// True if the endpoint is on the allow-list
    pub fn is_monitored(&self, endpoint: &Endpoint) -> bool {
        let key = endpoint.to_string();
        self.enabled && self.matchers.iter().any(|m| m.matches(&key))
    }

    /// Accounting handle for an endpoint, or None if it is not monitored
    pub fn endpoint(&self, endpoint: &Endpoint) -> Option<EndpointMetrics> {
        if self.closed.load(Ordering::Acquire) || !self.is_monitored(endpoint) {
            return None;
        }

        let mut entries = safe_lock(&self.entries);
        // Re-check under the lock so close() can't race a late registration
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let slot = entries
            .entry(endpoint.clone())
            .or_insert_with(|| {
                debug!(
                    client = %self.metrics_name,
                    endpoint = %endpoint,
                    "Registering in-use gauge for endpoint"
                );
                let endpoint_label = endpoint.to_string();
                Arc::new(EndpointSlot {
                    gauge: self
                        .gauges
                        .with_label_values(&[self.metrics_name.as_str(), endpoint_label.as_str()]),
                    activated: AtomicBool::new(false),
                })
            })
            .clone();

        Some(EndpointMetrics { slot })
    }

    /// Snapshot key for an endpoint's in-use counter
    pub fn in_use_key(&self, endpoint: &Endpoint) -> String {
        format!(
            "{}.clients.{}.endpoint.{}.in-use",
            self.namespace, self.metrics_name, endpoint
        )
    }

    /// Current counters, keyed by dotted name
    ///
    /// Endpoints that never had an Active stream are absent. Empty after `close()`.
    pub fn snapshot(&self) -> BTreeMap<String, CounterSnapshot> {
        if self.closed.load(Ordering::Acquire) {
            return BTreeMap::new();
        }

        let entries = safe_lock(&self.entries);
        entries
            .iter()
            .filter(|(_, slot)| slot.activated.load(Ordering::Acquire))
            .map(|(endpoint, slot)| {
                (
                    self.in_use_key(endpoint),
                    CounterSnapshot {
                        count: slot.gauge.get(),
                    },
                )
            })
            .collect()
    }

    /// Snapshot as a JSON object (`{ "<key>": { "count": n } }`)
    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to serialize metrics snapshot");
            serde_json::Value::Object(serde_json::Map::new())
        })
    }

    /// Encode the backing registry to Prometheus text format
    pub fn encode_metrics(&self) -> Result<Vec<u8>, String> {
        let mut buffer = vec![];
        let encoder = TextEncoder::new();

        let metric_families = self.registry.gather();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| format!("Failed to encode metrics: {}", e))?;

        Ok(buffer)
    }

    /// Tear down this client's counters
    ///
    /// Removes the label values from the gauge vector so they vanish from
    /// Prometheus output too. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut entries = safe_lock(&self.entries);
        for endpoint in entries.keys() {
            let endpoint_label = endpoint.to_string();
            if let Err(e) = self
                .gauges
                .remove_label_values(&[self.metrics_name.as_str(), endpoint_label.as_str()])
            {
                debug!(endpoint = %endpoint, error = %e, "In-use gauge already removed");
            }
        }
        entries.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::EndpointMatch;

    fn monitored(endpoints: &[&str]) -> MetricsConfig {
        MetricsConfig {
            monitored_endpoints: endpoints.iter().map(|e| EndpointMatch::equals(*e)).collect(),
            ..Default::default()
        }
    }

    fn recorder(endpoints: &[&str]) -> MetricsRecorder {
        let registry = Registry::new();
        MetricsRecorder::with_registry(&monitored(endpoints), "resetStreamTest", &registry).unwrap()
    }

    #[test]
    fn test_key_format() {
        let recorder = recorder(&["localhost:8080"]);
        assert_eq!(
            recorder.in_use_key(&Endpoint::new("localhost", 8080)),
            "streamgate.http.clients.resetStreamTest.endpoint.localhost:8080.in-use"
        );
    }

    #[test]
    fn test_key_absent_until_first_increment() {
        let recorder = recorder(&["localhost:8080"]);
        let endpoint = Endpoint::new("localhost", 8080);

        let metrics = recorder.endpoint(&endpoint).expect("monitored endpoint");
        assert!(
            recorder.snapshot().is_empty(),
            "Handle creation alone must not publish the key"
        );

        metrics.increment();
        let snapshot = recorder.snapshot();
        assert_eq!(
            snapshot.get(&recorder.in_use_key(&endpoint)),
            Some(&CounterSnapshot { count: 1 })
        );

        metrics.decrement();
        // Key stays visible at zero once traffic has been seen
        assert_eq!(
            recorder.snapshot().get(&recorder.in_use_key(&endpoint)),
            Some(&CounterSnapshot { count: 0 })
        );
    }

    #[test]
    fn test_unmonitored_endpoint_is_invisible() {
        let recorder = recorder(&["localhost:8080"]);
        assert!(recorder.endpoint(&Endpoint::new("localhost", 9090)).is_none());
        assert!(recorder.snapshot().is_empty());
    }

    #[test]
    fn test_disabled_metrics_produce_no_entries() {
        let registry = Registry::new();
        let mut config = monitored(&["localhost:8080"]);
        config.enabled = false;
        let recorder = MetricsRecorder::with_registry(&config, "off", &registry).unwrap();
        assert!(recorder.endpoint(&Endpoint::new("localhost", 8080)).is_none());
    }

    #[test]
    fn test_handles_share_one_gauge_per_endpoint() {
        let recorder = recorder(&["localhost:8080"]);
        let endpoint = Endpoint::new("localhost", 8080);
        let a = recorder.endpoint(&endpoint).unwrap();
        let b = recorder.endpoint(&endpoint).unwrap();

        a.increment();
        b.increment();
        a.decrement();
        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);
    }

    #[test]
    fn test_close_clears_snapshot_and_is_idempotent() {
        let recorder = recorder(&["localhost:8080"]);
        let endpoint = Endpoint::new("localhost", 8080);
        recorder.endpoint(&endpoint).unwrap().increment();
        assert_eq!(recorder.snapshot().len(), 1);

        recorder.close();
        assert!(recorder.snapshot().is_empty());
        recorder.close();
        assert!(recorder.snapshot().is_empty());
        assert!(recorder.endpoint(&endpoint).is_none(), "No new handles after close");
    }

    #[test]
    fn test_snapshot_json_shape() {
        let recorder = recorder(&["localhost:8080"]);
        let endpoint = Endpoint::new("localhost", 8080);
        recorder.endpoint(&endpoint).unwrap().increment();

        let json = recorder.snapshot_json();
        let key = recorder.in_use_key(&endpoint);
        assert_eq!(json[&key]["count"], serde_json::json!(1));
    }

    #[test]
    fn test_encode_metrics_includes_gauge() {
        let recorder = recorder(&["localhost:8080"]);
        recorder
            .endpoint(&Endpoint::new("localhost", 8080))
            .unwrap()
            .increment();

        let text = String::from_utf8(recorder.encode_metrics().unwrap()).unwrap();
        assert!(text.contains(IN_USE_METRIC));
        assert!(text.contains("client=\"resetStreamTest\""));
        assert!(text.contains("endpoint=\"localhost:8080\""));
    }

    #[test]
    fn test_global_registry_recorder() {
        let config = monitored(&["global.test:1"]);
        let recorder = MetricsRecorder::new(&config, "globalRegistryTest").unwrap();
        let metrics = recorder.endpoint(&Endpoint::new("global.test", 1)).unwrap();
        metrics.increment();
        assert_eq!(recorder.snapshot().len(), 1);
        recorder.close();
        assert!(recorder.snapshot().is_empty());
    }
}
