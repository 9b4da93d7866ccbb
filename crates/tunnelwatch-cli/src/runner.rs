//! Host lifecycle runner
//!
//! Plays the role of the host application around a [`ConnectionSupervisor`]:
//! feeds it the saved settings at startup, turns edits to the settings file
//! into configuration-changed events, reports notifications, and shuts the
//! tunnel down when asked to stop.

use crate::settings::{Settings, SettingsStore};
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tunnelwatch_agent::TunnelAgentClient;
use tunnelwatch_supervisor::{
    ConnectionSupervisor, Notification, SupervisorConfig, SupervisorError, SupervisorHandle,
};

/// Runner options
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Connect once and keep the tunnel open without watching the settings file
    pub once: bool,
    /// How often the settings file is checked for changes
    pub watch_interval: Duration,
    pub supervisor: SupervisorConfig,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            once: false,
            watch_interval: Duration::from_secs(2),
            supervisor: SupervisorConfig::default(),
        }
    }
}

/// Supervise a tunnel until `shutdown` completes
pub async fn run<F>(
    store: &SettingsStore,
    agent: Arc<dyn TunnelAgentClient>,
    options: RunOptions,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let mut current = store.load()?;
    info!("🚀 Supervising tunnel for local port {}", current.local_port);

    let (handle, task) =
        ConnectionSupervisor::new(agent, current.tunnel.clone(), options.supervisor.clone())
            .spawn();
    let reporter = tokio::spawn(report_notifications(handle.subscribe()));

    handle
        .configure(current.local_port, current.public_port)
        .await?;

    let mut watcher = None;
    let startup = if options.once {
        open_once(&handle).await
    } else {
        if let Err(e) = handle.startup_connect().await {
            report_failure(&e);
        }
        let mut interval = tokio::time::interval(options.watch_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        interval.tick().await;
        watcher = Some(interval);
        Ok(())
    };

    let result = match startup {
        Ok(()) => {
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break Ok(()),
                    _ = next_tick(&mut watcher) => {
                        if let Err(e) = apply_changes(store, &handle, &mut current).await {
                            break Err(e);
                        }
                    }
                }
            }
        }
        Err(e) => Err(e),
    };

    info!("Shutting down tunnel...");
    handle.shutdown().await?;
    drop(handle);
    task.await.context("Supervisor task failed")?;
    reporter.abort();

    result
}

async fn open_once(handle: &SupervisorHandle) -> Result<()> {
    handle.connect().await.context("Failed to open tunnel")?;

    let status = handle.status().await?;
    println!("https://{}", status.tunnel_url);
    Ok(())
}

async fn next_tick(watcher: &mut Option<Interval>) {
    match watcher {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Reload the settings file and forward what changed
async fn apply_changes(
    store: &SettingsStore,
    handle: &SupervisorHandle,
    current: &mut Settings,
) -> Result<()> {
    let latest = match store.load() {
        Ok(latest) => latest,
        Err(e) => {
            // Possibly caught mid-write; the next tick sees the full file
            warn!("Ignoring unreadable settings: {:#}", e);
            return Ok(());
        }
    };

    if latest == *current {
        return Ok(());
    }

    let port_changed =
        (latest.local_port, latest.public_port) != (current.local_port, current.public_port);
    if port_changed {
        handle
            .configure(latest.local_port, latest.public_port)
            .await?;
    }

    let previous = std::mem::replace(current, latest);

    if previous.tunnel != current.tunnel {
        info!("Tunnel settings changed");
        let result = handle
            .on_configuration_changed(previous.tunnel, current.tunnel.clone())
            .await;
        forward(result)?;
    } else if port_changed && current.tunnel.auto_connect {
        info!("Local port changed, reopening tunnel");
        forward(handle.connect().await)?;
    }

    Ok(())
}

/// Stop only when the supervisor is gone; other failures are reported
fn forward(result: Result<(), SupervisorError>) -> Result<()> {
    match result {
        Err(SupervisorError::Stopped) => Err(SupervisorError::Stopped.into()),
        Err(e) => {
            report_failure(&e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

fn report_failure(e: &SupervisorError) {
    if e.is_configuration_error() {
        warn!("{}", e);
    } else {
        debug!("Connect failed: {}", e);
    }
}

async fn report_notifications(mut notifications: broadcast::Receiver<Notification>) {
    loop {
        match notifications.recv().await {
            Ok(notification) => {
                if let Ok(json) = serde_json::to_string(&notification) {
                    debug!("notification: {}", json);
                }
                match notification {
                    Notification::Tunnel(url) if url.is_empty() => info!("Tunnel closed"),
                    Notification::Tunnel(url) => info!("🌐 Tunnel available at https://{}", url),
                    Notification::Error(message) => error!("❌ {}", message),
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Missed {} tunnel notifications", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
