//! Process supervisor — starts managed backends and restarts them after an exit.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::descriptor::PluginDescriptor;
use crate::error::{PluginError, PluginResult};

/// Default delay between restart checks.
pub const DEFAULT_RESTART_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest accepted delay between restart checks.
pub const MIN_RESTART_INTERVAL: Duration = Duration::from_millis(1);

/// Starts managed backend processes and keeps them running.
///
/// Each started plugin gets a watchdog task that checks it once per restart
/// interval. The watchdog only holds a weak reference, so it never keeps a
/// removed descriptor alive.
#[derive(Debug)]
pub struct ProcessSupervisor {
    restart_interval: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ProcessSupervisor {
    /// Creates a supervisor that checks plugins every `restart_interval`.
    ///
    /// Intervals below [`MIN_RESTART_INTERVAL`] are raised to it.
    pub fn new(restart_interval: Duration) -> Self {
        Self {
            restart_interval: restart_interval.max(MIN_RESTART_INTERVAL),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Starts the plugin's backend and its watchdog.
    ///
    /// Plugins that are not managed or have no backend are skipped.
    pub async fn start(&self, plugin: &Arc<PluginDescriptor>) -> PluginResult<()> {
        if !plugin.backend || !plugin.managed {
            debug!(plugin_id = %plugin.id, "Skipping start of unmanaged plugin");
            return Ok(());
        }

        let Some(client) = plugin.client() else {
            return Ok(());
        };

        client
            .start()
            .await
            .map_err(|e| PluginError::StartFailed {
                plugin_id: plugin.id.clone(),
                reason: e.to_string(),
            })?;

        info!(plugin_id = %plugin.id, "Plugin started");

        self.spawn_watchdog(plugin);
        Ok(())
    }

    /// Stops the plugin's backend, waiting at most `timeout`.
    pub async fn stop(&self, plugin: &PluginDescriptor, timeout: Duration) -> PluginResult<()> {
        let Some(client) = plugin.client() else {
            return Ok(());
        };

        match time::timeout(timeout, client.stop()).await {
            Ok(Ok(())) => {
                debug!(plugin_id = %plugin.id, "Plugin stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PluginError::StopTimedOut {
                plugin_id: plugin.id.clone(),
            }),
        }
    }

    /// Cancels every watchdog and waits for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Process supervisor shut down");
    }

    /// Number of watchdogs still running.
    pub fn watchdog_count(&self) -> usize {
        self.tracker.len()
    }

    fn spawn_watchdog(&self, plugin: &Arc<PluginDescriptor>) {
        let plugin_id = plugin.id.clone();
        let weak = Arc::downgrade(plugin);
        let cancel = self.shutdown.child_token();
        let period = self.restart_interval;

        self.tracker.spawn(async move {
            watchdog(plugin_id, weak, period, cancel).await;
        });
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_RESTART_INTERVAL)
    }
}

async fn watchdog(
    plugin_id: String,
    plugin: Weak<PluginDescriptor>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(descriptor) = plugin.upgrade() else {
            break;
        };
        if descriptor.is_decommissioned() {
            break;
        }
        if !descriptor.exited() {
            continue;
        }
        let Some(client) = descriptor.client().cloned() else {
            break;
        };
        drop(descriptor);

        info!(plugin_id = %plugin_id, "Restarting plugin");
        if let Err(e) = client.start().await {
            error!(plugin_id = %plugin_id, error = %e, "Failed to restart plugin");
        }
    }

    debug!(plugin_id = %plugin_id, "Watchdog stopped");
}
