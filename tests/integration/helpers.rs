//! Shared test helpers for integration tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use plugd_core::config::PluginConfig;
use plugd_plugin::protocol::{
    CallResourceRequest, CallResourceResponse, CheckHealthRequest, CheckHealthResult,
    CollectMetricsResult, HealthStatus, QueryDataRequest, QueryDataResponse,
};
use plugd_plugin::{
    AllowListValidator, BackendClient, BackendFactory, PluginClass, PluginDescriptor,
    PluginError, PluginInstaller, PluginLoader, PluginManager, PluginResult, PluginSource,
    PluginType, ResourceSender, UpdateInfo,
};

/// What a fake plugin directory contains.
#[derive(Debug, Clone)]
pub struct PluginSpec {
    pub id: String,
    pub version: String,
    pub plugin_type: PluginType,
    pub client: Option<Arc<dyn BackendClient>>,
}

impl PluginSpec {
    pub fn frontend(id: &str, plugin_type: PluginType) -> Self {
        Self {
            id: id.to_string(),
            version: "1.0.0".to_string(),
            plugin_type,
            client: None,
        }
    }

    pub fn backend(id: &str, client: Arc<dyn BackendClient>) -> Self {
        Self {
            id: id.to_string(),
            version: "1.0.0".to_string(),
            plugin_type: PluginType::Datasource,
            client: Some(client),
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }
}

/// Loader serving descriptors from an in-memory table keyed by root directory.
///
/// Each plugin's directory is `<root>/<id>`.
#[derive(Debug, Default)]
pub struct FakeLoader {
    roots: Mutex<HashMap<PathBuf, Vec<PluginSpec>>>,
    pub load_calls: Mutex<Vec<Vec<PathBuf>>>,
}

impl FakeLoader {
    pub fn add(&self, root: &Path, spec: PluginSpec) {
        self.roots
            .lock()
            .unwrap()
            .entry(root.to_path_buf())
            .or_default()
            .push(spec);
    }

    pub fn remove(&self, root: &Path, plugin_id: &str) {
        if let Some(specs) = self.roots.lock().unwrap().get_mut(root) {
            specs.retain(|s| s.id != plugin_id);
        }
    }
}

#[async_trait]
impl PluginLoader for FakeLoader {
    async fn load_all(
        &self,
        sources: &[PluginSource],
        already_registered: &HashSet<String>,
    ) -> PluginResult<Vec<PluginDescriptor>> {
        self.load_calls
            .lock()
            .unwrap()
            .push(sources.iter().map(|s| s.path.clone()).collect());

        let roots = self.roots.lock().unwrap();
        let mut loaded = Vec::new();

        for source in sources {
            for spec in roots.get(&source.path).into_iter().flatten() {
                if already_registered.contains(&spec.id) {
                    continue;
                }
                let mut descriptor = PluginDescriptor::new(
                    &spec.id,
                    spec.plugin_type,
                    source.class,
                    source.path.join(&spec.id),
                )
                .with_version(&spec.version);
                if let Some(client) = &spec.client {
                    descriptor = descriptor.with_backend(Arc::clone(client), true);
                }
                loaded.push(descriptor);
            }
        }

        Ok(loaded)
    }

    async fn load_with_factory(
        &self,
        path: &Path,
        factory: BackendFactory,
    ) -> PluginResult<PluginDescriptor> {
        let plugin_id = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let client = factory(&plugin_id)?;

        Ok(
            PluginDescriptor::new(&plugin_id, PluginType::Datasource, PluginClass::Core, path)
                .with_backend(client, true),
        )
    }
}

/// Installer that materializes plugins as directories plus loader entries.
#[derive(Debug)]
pub struct FakeInstaller {
    loader: Arc<FakeLoader>,
    pub calls: Mutex<Vec<String>>,
    pub latest: Mutex<HashMap<String, String>>,
}

impl FakeInstaller {
    pub fn new(loader: Arc<FakeLoader>) -> Self {
        Self {
            loader,
            calls: Mutex::new(Vec::new()),
            latest: Mutex::new(HashMap::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PluginInstaller for FakeInstaller {
    async fn install(
        &self,
        plugin_id: &str,
        version: &str,
        plugins_dir: &Path,
        zip_url: Option<&str>,
        _repo_url: &str,
    ) -> PluginResult<()> {
        self.calls.lock().unwrap().push(format!(
            "install {plugin_id}@{version} zip={}",
            zip_url.unwrap_or("-")
        ));

        std::fs::create_dir_all(plugins_dir.join(plugin_id))?;
        self.loader.add(
            plugins_dir,
            PluginSpec::frontend(plugin_id, PluginType::Datasource).version(version),
        );
        Ok(())
    }

    async fn uninstall(&self, plugin_dir: &Path) -> PluginResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("uninstall {}", plugin_dir.display()));

        if let (Some(root), Some(id)) = (plugin_dir.parent(), plugin_dir.file_name()) {
            self.loader.remove(root, &id.to_string_lossy());
        }
        std::fs::remove_dir_all(plugin_dir)?;
        Ok(())
    }

    async fn get_update_info(
        &self,
        plugin_id: &str,
        version: &str,
        _repo_url: &str,
    ) -> PluginResult<UpdateInfo> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("update-info {plugin_id}@{version}"));
        Ok(UpdateInfo {
            zip_url: format!("https://repo.example/{plugin_id}-{version}.zip"),
        })
    }

    async fn latest_version(
        &self,
        plugin_id: &str,
        _repo_url: &str,
    ) -> PluginResult<Option<String>> {
        Ok(self.latest.lock().unwrap().get(plugin_id).cloned())
    }
}

/// Backend that counts lifecycle calls and answers every RPC.
#[derive(Debug, Default)]
pub struct CountingClient {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl CountingClient {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendClient for CountingClient {
    async fn start(&self) -> PluginResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> PluginResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn query_data(&self, req: QueryDataRequest) -> PluginResult<QueryDataResponse> {
        let mut resp = QueryDataResponse::default();
        for query in req.queries {
            resp.responses.insert(query.ref_id, Default::default());
        }
        Ok(resp)
    }

    async fn check_health(&self, _req: CheckHealthRequest) -> PluginResult<CheckHealthResult> {
        Ok(CheckHealthResult {
            status: HealthStatus::Ok,
            message: "Data source is working".to_string(),
            json_details: serde_json::Value::Null,
        })
    }

    async fn collect_metrics(&self) -> PluginResult<CollectMetricsResult> {
        Ok(CollectMetricsResult {
            prometheus_metrics: bytes::Bytes::from_static(b"backend_up 1\n"),
        })
    }
}

/// How a [`StreamingClient`] answers a resource call.
#[derive(Debug, Clone)]
pub enum StreamScript {
    /// Send these chunks, then return.
    Chunks(Vec<CallResourceResponse>),
    /// Send these chunks, then wait forever.
    ChunksThenStall(Vec<CallResourceResponse>),
    /// Return this error without sending anything.
    Fail(fn() -> PluginError),
}

/// Backend that answers resource calls from a script.
#[derive(Debug)]
pub struct StreamingClient {
    script: StreamScript,
    pub last_sender: Mutex<Option<ResourceSender>>,
    pub last_request: Mutex<Option<CallResourceRequest>>,
}

impl StreamingClient {
    pub fn new(script: StreamScript) -> Self {
        Self {
            script,
            last_sender: Mutex::new(None),
            last_request: Mutex::new(None),
        }
    }
}

#[async_trait]
impl BackendClient for StreamingClient {
    async fn call_resource(
        &self,
        req: CallResourceRequest,
        sender: &ResourceSender,
    ) -> PluginResult<()> {
        *self.last_sender.lock().unwrap() = Some(sender.clone());
        *self.last_request.lock().unwrap() = Some(req);

        match &self.script {
            StreamScript::Chunks(chunks) => {
                for chunk in chunks {
                    sender.send(chunk.clone()).await?;
                }
                Ok(())
            }
            StreamScript::ChunksThenStall(chunks) => {
                for chunk in chunks {
                    sender.send(chunk.clone()).await?;
                }
                std::future::pending().await
            }
            StreamScript::Fail(make) => Err(make()),
        }
    }
}

/// Plugin manager over fakes, rooted in temporary directories.
pub struct TestEnv {
    pub manager: PluginManager,
    pub loader: Arc<FakeLoader>,
    pub installer: Arc<FakeInstaller>,
    pub config: PluginConfig,
    pub root: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_allowed_hosts(Vec::new())
    }

    pub fn with_allowed_hosts(allowed_hosts: Vec<String>) -> Self {
        Self::with_config(|config| config.allowed_hosts = allowed_hosts)
    }

    /// Builds the environment after `tweak` has adjusted the default config.
    pub fn with_config(tweak: impl FnOnce(&mut PluginConfig)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = PluginConfig {
            plugins_path: root.path().join("plugins"),
            bundled_plugins_path: Some(root.path().join("bundled")),
            static_root_path: root.path().join("public"),
            ..PluginConfig::default()
        };
        tweak(&mut config);
        let allowed_hosts = config.allowed_hosts.clone();

        let loader = Arc::new(FakeLoader::default());
        let installer = Arc::new(FakeInstaller::new(Arc::clone(&loader)));
        let manager = PluginManager::new(
            config.clone(),
            Arc::clone(&loader) as Arc<dyn PluginLoader>,
            Arc::clone(&installer) as Arc<dyn PluginInstaller>,
            Arc::new(AllowListValidator::new(allowed_hosts)),
        )
        .unwrap();

        Self {
            manager,
            loader,
            installer,
            config,
            root,
        }
    }

    /// Adds an external plugin with an on-disk directory.
    pub fn add_external(&self, spec: PluginSpec) -> PathBuf {
        let dir = self.config.plugins_path.join(&spec.id);
        std::fs::create_dir_all(&dir).unwrap();
        self.loader.add(&self.config.plugins_path, spec);
        dir
    }

    /// Adds a core plugin under the first core plugin directory.
    pub fn add_core(&self, spec: PluginSpec) {
        let core_dir = self.config.core_plugin_dirs()[0].clone();
        self.loader.add(&core_dir, spec);
    }
}

/// A chunk with status and headers.
pub fn chunk(status: u16, headers: &[(&str, &str)], body: &'static str) -> CallResourceResponse {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        map.entry(name.to_string())
            .or_default()
            .push(value.to_string());
    }
    CallResourceResponse {
        status,
        headers: map,
        body: bytes::Bytes::from_static(body.as_bytes()),
    }
}
