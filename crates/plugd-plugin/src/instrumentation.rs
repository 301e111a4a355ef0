//! Prometheus metrics for plugin requests.
//!
//! Counts and times each dispatched request per plugin and endpoint. Recording
//! never alters the outcome of the wrapped call.

use std::future::Future;
use std::time::Instant;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{PluginError, PluginResult};

/// Endpoint label for data queries.
pub const ENDPOINT_QUERY_DATA: &str = "queryData";
/// Endpoint label for resource calls.
pub const ENDPOINT_CALL_RESOURCE: &str = "callResource";
/// Endpoint label for health checks.
pub const ENDPOINT_CHECK_HEALTH: &str = "checkHealth";
/// Endpoint label for metrics collection.
pub const ENDPOINT_COLLECT_METRICS: &str = "collectMetrics";

/// Request metrics backed by an owned registry.
#[derive(Debug, Clone)]
pub struct PluginMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
}

impl PluginMetrics {
    /// Creates the metric families and registers them.
    pub fn new() -> PluginResult<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("plugin_request_total", "Total number of plugin requests"),
            &["plugin_id", "endpoint", "status"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "plugin_request_duration_seconds",
                "Plugin request duration in seconds",
            ),
            &["plugin_id", "endpoint"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
        })
    }

    /// Runs `fut`, recording its duration and outcome.
    pub async fn instrument<T, F>(&self, plugin_id: &str, endpoint: &str, fut: F) -> PluginResult<T>
    where
        F: Future<Output = PluginResult<T>>,
    {
        let started = Instant::now();
        let result = fut.await;

        let status = match &result {
            Ok(_) => "ok",
            Err(PluginError::Cancelled) => "cancelled",
            Err(_) => "error",
        };

        self.requests_total
            .with_label_values(&[plugin_id, endpoint, status])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[plugin_id, endpoint])
            .observe(started.elapsed().as_secs_f64());

        result
    }

    /// Request count recorded for one label set.
    pub fn request_count(&self, plugin_id: &str, endpoint: &str, status: &str) -> u64 {
        self.requests_total
            .with_label_values(&[plugin_id, endpoint, status])
            .get()
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn gather(&self) -> PluginResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| PluginError::Transport {
            reason: format!("metrics output is not UTF-8: {e}"),
        })
    }
}
