//! Request dispatcher — typed entry points that route calls to plugin backends.
//!
//! Every operation looks the target plugin up in the registry, invokes its
//! client under the caller's cancellation token and normalizes the failure.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};
use crate::instrumentation::{
    ENDPOINT_CALL_RESOURCE, ENDPOINT_CHECK_HEALTH, ENDPOINT_COLLECT_METRICS, ENDPOINT_QUERY_DATA,
    PluginMetrics,
};
use crate::protocol::{
    CallResourceRequest, CheckHealthRequest, CheckHealthResult, CollectMetricsResult,
    PluginContext, QueryDataRequest, QueryDataResponse,
};
use crate::registry::PluginRegistry;
use crate::relay::{self, ResponseSink};
use crate::stream;
use crate::traits::RequestValidator;

/// Routes typed requests to registered plugins.
pub struct RequestDispatcher {
    registry: Arc<PluginRegistry>,
    validator: Arc<dyn RequestValidator>,
    metrics: PluginMetrics,
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher").finish_non_exhaustive()
    }
}

impl RequestDispatcher {
    /// Creates a dispatcher over `registry`.
    pub fn new(
        registry: Arc<PluginRegistry>,
        validator: Arc<dyn RequestValidator>,
        metrics: PluginMetrics,
    ) -> Self {
        Self {
            registry,
            validator,
            metrics,
        }
    }

    /// Request metrics recorded by this dispatcher.
    pub fn metrics(&self) -> &PluginMetrics {
        &self.metrics
    }

    /// Executes data queries.
    ///
    /// An unknown plugin yields an empty response rather than an error.
    pub async fn query_data(
        &self,
        cancel: &CancellationToken,
        req: QueryDataRequest,
    ) -> PluginResult<QueryDataResponse> {
        let plugin_id = req.plugin_context.plugin_id.clone();

        let Some(plugin) = self.registry.lookup(&plugin_id).await else {
            debug!(plugin_id = %plugin_id, "Query for unknown plugin");
            return Ok(QueryDataResponse::default());
        };
        let client = plugin.client().cloned().ok_or(PluginError::Unavailable)?;

        self.metrics
            .instrument(
                &plugin_id,
                ENDPOINT_QUERY_DATA,
                with_cancel(cancel, client.query_data(req)),
            )
            .await
            .map_err(|e| {
                if e.is_passthrough() || matches!(e, PluginError::Cancelled) {
                    e
                } else {
                    PluginError::QueryFailed {
                        plugin_id: plugin_id.clone(),
                        source: Box::new(e),
                    }
                }
            })
    }

    /// Forwards an HTTP request to a plugin and relays its streamed response into `sink`.
    ///
    /// `path` is the resource path below the plugin's resource root. On any
    /// error nothing has been relayed yet, so a JSON error response is written
    /// to `sink` before the error is returned.
    pub async fn call_resource<S>(
        &self,
        cancel: &CancellationToken,
        req: http::Request<Bytes>,
        path: &str,
        ctx: PluginContext,
        sink: &mut S,
    ) -> PluginResult<()>
    where
        S: ResponseSink + ?Sized,
    {
        let result = self.call_resource_inner(cancel, req, path, ctx, &mut *sink).await;

        if let Err(e) = &result {
            if let Err(write_err) = relay::write_error(sink, e).await {
                warn!(error = %write_err, "Failed to write resource error response");
            }
        }

        result
    }

    async fn call_resource_inner<S>(
        &self,
        cancel: &CancellationToken,
        req: http::Request<Bytes>,
        path: &str,
        ctx: PluginContext,
        sink: &mut S,
    ) -> PluginResult<()>
    where
        S: ResponseSink + ?Sized,
    {
        let (parts, body) = req.into_parts();

        self.validator.validate(ctx.datasource_url(), Some(&parts))?;

        let plugin_id = ctx.plugin_id.clone();
        let plugin = self
            .registry
            .lookup(&plugin_id)
            .await
            .ok_or(PluginError::NotRegistered)?;
        let client = plugin.client().cloned().ok_or(PluginError::Unavailable)?;

        let mut headers = parts.headers.clone();
        let keep = ctx
            .datasource
            .as_ref()
            .map(|ds| ds.keep_cookies())
            .unwrap_or_default();
        relay::clear_cookie_header(&mut headers, &keep);

        let url = match parts.uri.query() {
            Some(query) if !query.is_empty() => format!("{path}?{query}"),
            _ => path.to_string(),
        };

        let request = CallResourceRequest {
            plugin_context: ctx,
            path: path.to_string(),
            method: parts.method.to_string(),
            url,
            headers: relay::header_multimap(&headers),
            body,
        };

        let child = cancel.child_token();
        let (tx, mut rx) = stream::channel(child.clone());

        let invoke = async {
            let res = with_cancel(&child, client.call_resource(request, &tx)).await;
            if tx.close().is_err() {
                debug!(plugin_id = %plugin_id, "Resource stream already closed by plugin");
            }
            res
        };

        let drain = async {
            let res = relay::relay_stream(&plugin_id, &mut rx, &mut *sink).await;
            child.cancel();
            res
        };

        let call = async {
            let (invoked, drained) = tokio::join!(invoke, drain);

            match (invoked, drained) {
                (Ok(()), Ok(_)) => Ok(()),
                (Err(e), Ok(chunks)) => {
                    warn!(
                        plugin_id = %plugin_id,
                        chunks,
                        error = %e,
                        "Resource call failed after response started"
                    );
                    Ok(())
                }
                (Ok(()), Err(e)) => Err(e),
                // Our own cancellation after a failed drain hides the real cause.
                (Err(PluginError::Cancelled), Err(e)) if !cancel.is_cancelled() => Err(e),
                (Err(e), Err(_)) => Err(e),
            }
        };

        self.metrics
            .instrument(&plugin_id, ENDPOINT_CALL_RESOURCE, call)
            .await
    }

    /// Collects a plugin's own metrics.
    pub async fn collect_metrics(
        &self,
        cancel: &CancellationToken,
        plugin_id: &str,
    ) -> PluginResult<CollectMetricsResult> {
        let plugin = self
            .registry
            .lookup(plugin_id)
            .await
            .ok_or(PluginError::NotRegistered)?;
        let client = plugin.client().cloned().ok_or(PluginError::Unavailable)?;

        self.metrics
            .instrument(
                plugin_id,
                ENDPOINT_COLLECT_METRICS,
                with_cancel(cancel, client.collect_metrics()),
            )
            .await
    }

    /// Checks a plugin's health.
    ///
    /// A datasource URL rejected by the validator produces a forbidden result,
    /// not an error.
    pub async fn check_health(
        &self,
        cancel: &CancellationToken,
        req: CheckHealthRequest,
    ) -> PluginResult<CheckHealthResult> {
        let plugin_id = req.plugin_context.plugin_id.clone();

        if let Err(e) = self
            .validator
            .validate(req.plugin_context.datasource_url(), None)
        {
            debug!(plugin_id = %plugin_id, error = %e, "Health check target rejected");
            return Ok(CheckHealthResult::forbidden());
        }

        let plugin = self
            .registry
            .lookup(&plugin_id)
            .await
            .ok_or(PluginError::NotRegistered)?;
        let client = plugin.client().cloned().ok_or(PluginError::Unavailable)?;

        self.metrics
            .instrument(
                &plugin_id,
                ENDPOINT_CHECK_HEALTH,
                with_cancel(cancel, client.check_health(req)),
            )
            .await
            .map_err(|e| {
                if e.is_passthrough() || matches!(e, PluginError::Cancelled) {
                    e
                } else {
                    PluginError::HealthCheckFailed {
                        plugin_id: plugin_id.clone(),
                        source: Box::new(e),
                    }
                }
            })
    }
}

/// Races `fut` against `cancel`.
async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> PluginResult<T>
where
    F: Future<Output = PluginResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PluginError::Cancelled),
        res = fut => res,
    }
}
