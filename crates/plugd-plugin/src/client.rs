//! Client handle through which the runtime talks to a plugin backend.

use async_trait::async_trait;

use crate::error::{PluginError, PluginResult};
use crate::protocol::{
    CallResourceRequest, CheckHealthRequest, CheckHealthResult, CollectMetricsResult,
    QueryDataRequest, QueryDataResponse,
};
use crate::stream::ResourceSender;

/// A live connection to a plugin backend.
///
/// Process-backed implementations own the child process; in-process core
/// plugins implement only the capabilities they support. Every capability
/// defaults to [`PluginError::MethodNotImplemented`].
#[async_trait]
pub trait BackendClient: Send + Sync + std::fmt::Debug {
    /// Launches the backend. Called again by the restart watchdog after an exit.
    async fn start(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Requests a graceful shutdown of the backend.
    async fn stop(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Whether the backend process has exited since it was last started.
    fn exited(&self) -> bool {
        false
    }

    /// Executes data queries.
    async fn query_data(&self, _req: QueryDataRequest) -> PluginResult<QueryDataResponse> {
        Err(PluginError::MethodNotImplemented)
    }

    /// Serves a resource call, writing response chunks into `sender`.
    async fn call_resource(
        &self,
        _req: CallResourceRequest,
        _sender: &ResourceSender,
    ) -> PluginResult<()> {
        Err(PluginError::MethodNotImplemented)
    }

    /// Reports backend health.
    async fn check_health(&self, _req: CheckHealthRequest) -> PluginResult<CheckHealthResult> {
        Err(PluginError::MethodNotImplemented)
    }

    /// Returns the backend's own metrics.
    async fn collect_metrics(&self) -> PluginResult<CollectMetricsResult> {
        Err(PluginError::MethodNotImplemented)
    }
}
