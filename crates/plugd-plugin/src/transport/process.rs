//! Backend client that runs the plugin as a child process speaking RPC over stdio.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::rpc::RpcConnection;
use crate::client::BackendClient;
use crate::error::{PluginError, PluginResult};
use crate::protocol::{
    CallResourceRequest, CallResourceResponse, CheckHealthRequest, CheckHealthResult,
    CollectMetricsResult, QueryDataRequest, QueryDataResponse,
};
use crate::stream::ResourceSender;

/// Time a backend gets to exit on its own after its input is closed.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// A running backend process.
#[derive(Debug)]
struct Running {
    conn: Arc<RpcConnection>,
    kill: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<()>,
}

/// Plugin backend running as a child process.
#[derive(Debug)]
pub struct ProcessClient {
    plugin_id: String,
    executable: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    running: Mutex<Option<Running>>,
    exited: Arc<AtomicBool>,
}

impl ProcessClient {
    /// Creates a client for `executable`; nothing is spawned until [`BackendClient::start`].
    pub fn new(plugin_id: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            running: Mutex::new(None),
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets command-line arguments.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets extra environment variables.
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    async fn connection(&self) -> PluginResult<Arc<RpcConnection>> {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(running) if !running.conn.is_closed() => Ok(Arc::clone(&running.conn)),
            _ => Err(PluginError::Unavailable),
        }
    }

    async fn call<P, T>(&self, method: &str, params: &P) -> PluginResult<T>
    where
        P: Serialize + Sync,
        T: DeserializeOwned,
    {
        let conn = self.connection().await?;
        let data = conn.call(method, encode(method, params)?).await?;
        decode(method, data)
    }

    fn spawn(&self) -> PluginResult<Running> {
        let mut command = Command::new(&self.executable);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| PluginError::Transport {
            reason: "failed to capture plugin stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| PluginError::Transport {
            reason: "failed to capture plugin stdout".to_string(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(self.plugin_id.clone(), stderr));
        }

        let conn = Arc::new(RpcConnection::new(stdout, stdin));
        let (kill_tx, kill_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_exit(
            self.plugin_id.clone(),
            child,
            Arc::clone(&conn),
            kill_rx,
            Arc::clone(&self.exited),
        ));

        Ok(Running {
            conn,
            kill: Some(kill_tx),
            watcher,
        })
    }
}

#[async_trait]
impl BackendClient for ProcessClient {
    async fn start(&self) -> PluginResult<()> {
        let mut running = self.running.lock().await;

        if running.is_some() && !self.exited.load(Ordering::Acquire) {
            return Ok(());
        }

        // Cleared before spawning; a process that dies at once must still be seen as exited.
        let was_exited = self.exited.swap(false, Ordering::AcqRel);
        match self.spawn() {
            Ok(spawned) => *running = Some(spawned),
            Err(e) => {
                self.exited.store(was_exited, Ordering::Release);
                return Err(e);
            }
        }

        debug!(plugin_id = %self.plugin_id, executable = %self.executable.display(), "Plugin process spawned");
        Ok(())
    }

    async fn stop(&self) -> PluginResult<()> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = running.conn.close_writer().await {
            debug!(plugin_id = %self.plugin_id, error = %e, "Failed to close plugin input");
        }

        if tokio::time::timeout(STOP_GRACE_PERIOD, &mut running.watcher)
            .await
            .is_err()
        {
            warn!(plugin_id = %self.plugin_id, "Plugin did not exit after input closed, killing");
            if let Some(kill) = running.kill.take() {
                let _ = kill.send(());
            }
            let _ = running.watcher.await;
        }

        Ok(())
    }

    fn exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    async fn query_data(&self, req: QueryDataRequest) -> PluginResult<QueryDataResponse> {
        self.call("queryData", &req).await
    }

    async fn call_resource(
        &self,
        req: CallResourceRequest,
        sender: &ResourceSender,
    ) -> PluginResult<()> {
        let conn = self.connection().await?;
        let mut replies = conn
            .call_streaming("callResource", encode("callResource", &req)?)
            .await?;

        while let Some(data) = replies.next_chunk().await? {
            let chunk: CallResourceResponse = decode("callResource", data)?;
            sender.send(chunk).await?;
        }

        Ok(())
    }

    async fn check_health(&self, req: CheckHealthRequest) -> PluginResult<CheckHealthResult> {
        self.call("checkHealth", &req).await
    }

    async fn collect_metrics(&self) -> PluginResult<CollectMetricsResult> {
        self.call("collectMetrics", &Value::Null).await
    }
}

fn encode<P: Serialize>(method: &str, params: &P) -> PluginResult<Value> {
    serde_json::to_value(params).map_err(|e| PluginError::Transport {
        reason: format!("failed to encode {method} request: {e}"),
    })
}

fn decode<T: DeserializeOwned>(method: &str, data: Value) -> PluginResult<T> {
    serde_json::from_value(data).map_err(|e| PluginError::Transport {
        reason: format!("invalid {method} reply: {e}"),
    })
}

async fn forward_stderr(plugin_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(plugin_id = %plugin_id, "{line}");
    }
}

/// Owns the child until it exits, then marks the client exited.
async fn watch_exit(
    plugin_id: String,
    mut child: Child,
    conn: Arc<RpcConnection>,
    kill: oneshot::Receiver<()>,
    exited: Arc<AtomicBool>,
) {
    tokio::select! {
        biased;
        status = child.wait() => match status {
            Ok(status) => info!(plugin_id = %plugin_id, %status, "Plugin process exited"),
            Err(e) => warn!(plugin_id = %plugin_id, error = %e, "Failed to wait for plugin process"),
        },
        _ = kill => {
            if let Err(e) = child.kill().await {
                warn!(plugin_id = %plugin_id, error = %e, "Failed to kill plugin process");
            }
        }
        _ = conn.closed() => {
            warn!(plugin_id = %plugin_id, "Plugin closed its output, killing process");
            if let Err(e) = child.kill().await {
                warn!(plugin_id = %plugin_id, error = %e, "Failed to kill plugin process");
            }
        }
    }

    exited.store(true, Ordering::Release);
}
