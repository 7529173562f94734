use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RefreshLabels {
    pub trigger: RefreshTrigger,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RefreshTrigger {
    Periodic,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    pub status_class: String,
}

impl StatusLabels {
    /// Bucket an HTTP status as `2xx`, `4xx`, ...
    pub fn from_status(status: u16) -> Self {
        Self {
            status_class: format!("{}xx", status / 100),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the proxy.
pub struct Metrics {
    pub credential_refresh_total: Family<RefreshLabels, Counter>,
    pub credential_expiry_timestamp_seconds: Gauge,
    pub access_denied_total: Counter,
    pub forwarded_requests_total: Family<StatusLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let credential_refresh_total = Family::<RefreshLabels, Counter>::default();
        registry.register(
            "ecrproxy_credential_refresh",
            "Registry credential refresh attempts by trigger and outcome",
            credential_refresh_total.clone(),
        );

        let credential_expiry_timestamp_seconds: Gauge = Gauge::default();
        registry.register(
            "ecrproxy_credential_expiry_timestamp_seconds",
            "Unix time at which the current credential becomes due for refresh",
            credential_expiry_timestamp_seconds.clone(),
        );

        let access_denied_total = Counter::default();
        registry.register(
            "ecrproxy_access_denied",
            "Requests rejected by the IP allow-list",
            access_denied_total.clone(),
        );

        let forwarded_requests_total = Family::<StatusLabels, Counter>::default();
        registry.register(
            "ecrproxy_forwarded_requests",
            "Requests relayed to the registry by upstream status class",
            forwarded_requests_total.clone(),
        );

        Self {
            credential_refresh_total,
            credential_expiry_timestamp_seconds,
            access_denied_total,
            forwarded_requests_total,
        }
    }

    pub fn record_refresh(&self, trigger: RefreshTrigger, outcome: Outcome) {
        self.credential_refresh_total
            .get_or_create(&RefreshLabels { trigger, outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
