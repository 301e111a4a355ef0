//! # plugd-plugin
//!
//! Runtime supervisor for out-of-process plugins. Provides:
//!
//! - Plugin registry with at-most-once registration and decommissioning
//! - Process supervision with a fixed-interval crash-restart watchdog
//! - Request dispatch for queries, resource calls, health checks and metrics
//! - Streaming relay of resource-call responses with cancellation
//! - Lifecycle management: load, install, uninstall, update checks, shutdown
//! - Manifest loader and stdio RPC transport for plugin executables

pub mod client;
pub mod descriptor;
pub mod dispatcher;
pub mod env;
pub mod error;
pub mod installer;
pub mod instrumentation;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod stream;
pub mod supervisor;
pub mod traits;
pub mod transport;
pub mod validator;

pub use client::BackendClient;
pub use descriptor::{PluginClass, PluginDescriptor, PluginType, StaticRoute};
pub use dispatcher::RequestDispatcher;
pub use error::{PluginError, PluginResult};
pub use installer::OfflineInstaller;
pub use instrumentation::PluginMetrics;
pub use loader::ManifestLoader;
pub use manager::{InstallOptions, PluginManager};
pub use registry::PluginRegistry;
pub use relay::{BufferedResponse, ResponseSink};
pub use stream::{ResourceReceiver, ResourceSender};
pub use supervisor::ProcessSupervisor;
pub use traits::{
    BackendFactory, PluginInstaller, PluginLoader, PluginSource, RequestValidator, UpdateInfo,
};
pub use transport::ProcessClient;
pub use validator::AllowListValidator;
