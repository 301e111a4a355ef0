//! Error taxonomy for the plugin runtime.
//!
//! `MethodNotImplemented` and `Unavailable` are expected conditions and are
//! handed to callers unwrapped; other invocation failures are wrapped with the
//! operation and plugin they came from.

use std::path::PathBuf;

use http::StatusCode;
use thiserror::Error;

use plugd_core::error::{AppError, ErrorKind};

/// Result alias used throughout the plugin runtime.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors produced by the registry, supervisor, dispatcher and lifecycle manager.
#[derive(Debug, Error)]
pub enum PluginError {
    // --- Registry ---
    /// A plugin with this ID is already registered.
    #[error("plugin {plugin_id} already registered")]
    AlreadyRegistered {
        /// The conflicting plugin ID.
        plugin_id: String,
    },

    /// No live plugin is registered under the requested ID.
    #[error("plugin not registered")]
    NotRegistered,

    // --- Invocation ---
    /// The plugin does not implement the requested method.
    #[error("method not implemented")]
    MethodNotImplemented,

    /// The plugin process is not running or not reachable.
    #[error("plugin unavailable")]
    Unavailable,

    /// The backend process could not be launched.
    #[error("failed to start plugin {plugin_id}: {reason}")]
    StartFailed {
        /// The plugin that failed to start.
        plugin_id: String,
        /// Why the launch failed.
        reason: String,
    },

    /// The backend process did not stop within the allotted time.
    #[error("timed out stopping plugin {plugin_id}")]
    StopTimedOut {
        /// The plugin that did not stop.
        plugin_id: String,
    },

    /// A data query failed for a reason other than the expected conditions.
    #[error("failed to query data from plugin {plugin_id}")]
    QueryFailed {
        /// The queried plugin.
        plugin_id: String,
        /// The underlying failure.
        #[source]
        source: Box<PluginError>,
    },

    /// A health check failed for a reason other than the expected conditions.
    #[error("failed to check health of plugin {plugin_id}")]
    HealthCheckFailed {
        /// The checked plugin.
        plugin_id: String,
        /// The underlying failure.
        #[source]
        source: Box<PluginError>,
    },

    /// The plugin closed a resource stream without sending a single chunk.
    #[error("received empty resource response")]
    EmptyResourceResponse,

    /// The first chunk of a resource response could not be received.
    #[error("failed to receive response from resource call")]
    ResourceReceiveFailed {
        /// The underlying failure.
        #[source]
        source: Box<PluginError>,
    },

    /// The request was rejected by the request validator.
    #[error("access denied: {reason}")]
    AccessDenied {
        /// Why the validator rejected the request.
        reason: String,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A send or close was attempted on a closed resource stream.
    #[error("resource stream is closed")]
    StreamClosed,

    /// The backend reported an error of its own.
    #[error("plugin error: {message}")]
    Backend {
        /// Message reported by the plugin.
        message: String,
    },

    /// The RPC transport to the backend process failed.
    #[error("transport error: {reason}")]
    Transport {
        /// What went wrong on the wire.
        reason: String,
    },

    // --- Lifecycle ---
    /// Core plugins ship with the host and cannot be installed.
    #[error("cannot install or upgrade core plugin {plugin_id}")]
    CannotInstallCore {
        /// The core plugin ID.
        plugin_id: String,
    },

    /// Core plugins ship with the host and cannot be uninstalled.
    #[error("cannot uninstall core plugin {plugin_id}")]
    CannotUninstallCore {
        /// The core plugin ID.
        plugin_id: String,
    },

    /// The requested version is already installed.
    #[error("plugin {plugin_id} is already installed in {}", .existing_dir.display())]
    DuplicatePlugin {
        /// The plugin ID.
        plugin_id: String,
        /// Directory of the existing installation.
        existing_dir: PathBuf,
    },

    /// No plugin with this ID is installed.
    #[error("plugin {plugin_id} is not installed")]
    NotInstalled {
        /// The plugin ID.
        plugin_id: String,
    },

    /// The plugin directory does not resolve inside the external plugins root.
    #[error("refusing to uninstall plugin located outside the plugins directory: {}", .path.display())]
    UnsafeUninstallPath {
        /// The offending plugin directory.
        path: PathBuf,
    },

    /// The plugin loader failed.
    #[error("failed to load plugins: {reason}")]
    Load {
        /// Why loading failed.
        reason: String,
    },

    /// The plugin installer failed.
    #[error("plugin installer error: {reason}")]
    Install {
        /// Why the installer failed.
        reason: String,
    },

    /// Metrics could not be registered or encoded.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Whether the error is one of the expected conditions handed to callers unwrapped.
    pub fn is_passthrough(&self) -> bool {
        matches!(self, Self::MethodNotImplemented | Self::Unavailable)
    }

    /// HTTP status used when the error is rendered as a resource-call response.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::MethodNotImplemented => StatusCode::NOT_FOUND,
            Self::AccessDenied { .. } => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short message shown to HTTP callers for this error.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Unavailable => "Plugin unavailable",
            Self::MethodNotImplemented => "Not found",
            Self::AccessDenied { .. } => "Access denied",
            _ => "Failed to call resource",
        }
    }
}

impl From<PluginError> for AppError {
    fn from(err: PluginError) -> Self {
        let kind = match &err {
            PluginError::NotRegistered | PluginError::NotInstalled { .. } => ErrorKind::NotFound,
            PluginError::AlreadyRegistered { .. } | PluginError::DuplicatePlugin { .. } => {
                ErrorKind::Conflict
            }
            PluginError::MethodNotImplemented => ErrorKind::NotImplemented,
            PluginError::Unavailable => ErrorKind::ServiceUnavailable,
            PluginError::AccessDenied { .. }
            | PluginError::CannotInstallCore { .. }
            | PluginError::CannotUninstallCore { .. }
            | PluginError::UnsafeUninstallPath { .. } => ErrorKind::Forbidden,
            PluginError::Cancelled => ErrorKind::Cancelled,
            PluginError::Install { .. } => ErrorKind::ExternalService,
            PluginError::Io(_) => ErrorKind::Storage,
            _ => ErrorKind::Plugin,
        };
        let message = err.to_string();
        AppError::with_source(kind, message, err)
    }
}
