//! Typed requests and responses exchanged with plugin backends.
//!
//! These types are the payloads of the stdio RPC transport and the arguments
//! of [`crate::client::BackendClient`].

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Datasource instance a request is executed against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSourceInstanceSettings {
    /// Numeric datasource ID.
    pub id: i64,
    /// Stable datasource UID.
    pub uid: String,
    /// Display name.
    pub name: String,
    /// URL of the external system the datasource talks to.
    pub url: String,
    /// Free-form datasource settings.
    #[serde(default)]
    pub json_data: Value,
}

impl DataSourceInstanceSettings {
    /// Cookie names the datasource wants forwarded to its plugin.
    ///
    /// Read from the `keepCookies` array of the datasource settings; anything
    /// malformed yields an empty allow-list.
    pub fn keep_cookies(&self) -> Vec<String> {
        self.json_data
            .get("keepCookies")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Identifies the plugin and datasource a request targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginContext {
    /// Target plugin ID.
    pub plugin_id: String,
    /// Organization the request runs in.
    #[serde(default)]
    pub org_id: i64,
    /// Datasource instance, for datasource plugins.
    #[serde(default)]
    pub datasource: Option<DataSourceInstanceSettings>,
}

impl PluginContext {
    /// Context for a plugin without a datasource instance.
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            ..Self::default()
        }
    }

    /// URL of the external system, or an empty string.
    pub fn datasource_url(&self) -> &str {
        self.datasource.as_ref().map(|ds| ds.url.as_str()).unwrap_or("")
    }
}

/// A single query inside a [`QueryDataRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataQuery {
    /// Caller-chosen reference used to key the response.
    pub ref_id: String,
    /// Plugin-defined query type.
    #[serde(default)]
    pub query_type: String,
    /// Plugin-defined query model.
    #[serde(default)]
    pub json: Value,
}

/// Request for the query capability of a plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryDataRequest {
    /// Target plugin.
    pub plugin_context: PluginContext,
    /// Forwarded request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Queries to execute.
    pub queries: Vec<DataQuery>,
}

/// Result of a single query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataResponse {
    /// Data frames, in the plugin's serialized frame format.
    #[serde(default)]
    pub frames: Vec<Value>,
    /// Per-query error, if the query failed inside the plugin.
    #[serde(default)]
    pub error: Option<String>,
}

/// Responses keyed by query `ref_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDataResponse {
    /// Responses keyed by `ref_id`.
    #[serde(default)]
    pub responses: HashMap<String, DataResponse>,
}

/// HTTP-shaped request forwarded to a plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallResourceRequest {
    /// Target plugin.
    pub plugin_context: PluginContext,
    /// Resource path below the plugin's resource root.
    pub path: String,
    /// HTTP method.
    pub method: String,
    /// Path plus query string.
    pub url: String,
    /// Request headers.
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    /// Fully buffered request body.
    #[serde(default)]
    pub body: Bytes,
}

/// One chunk of a streamed resource response.
///
/// Status and headers are only honoured on the first chunk of a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResourceResponse {
    /// HTTP status code.
    #[serde(default = "default_status")]
    pub status: u16,
    /// Response headers.
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    /// Body bytes of this chunk.
    #[serde(default)]
    pub body: Bytes,
}

impl CallResourceResponse {
    /// A chunk carrying only body bytes.
    pub fn body(body: impl Into<Bytes>) -> Self {
        Self {
            status: default_status(),
            headers: HashMap::new(),
            body: body.into(),
        }
    }
}

fn default_status() -> u16 {
    200
}

/// Health check request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckHealthRequest {
    /// Target plugin.
    pub plugin_context: PluginContext,
}

/// Health status reported by a plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The plugin did not report a status.
    #[default]
    Unknown,
    /// Healthy.
    Ok,
    /// Unhealthy.
    Error,
    /// Access to the external system was denied by policy.
    Forbidden,
}

/// Result of a health check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckHealthResult {
    /// Reported status.
    pub status: HealthStatus,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Plugin-defined details.
    #[serde(default)]
    pub json_details: Value,
}

impl CheckHealthResult {
    /// Result synthesized when the request validator rejects the target URL.
    pub fn forbidden() -> Self {
        Self {
            status: HealthStatus::Forbidden,
            message: "Access denied".to_string(),
            json_details: Value::Null,
        }
    }
}

/// Metrics exposed by a plugin backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectMetricsResult {
    /// Metrics in the Prometheus text exposition format.
    #[serde(default)]
    pub prometheus_metrics: Bytes,
}
