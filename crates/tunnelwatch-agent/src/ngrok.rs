//! ngrok agent driven as a child process
//!
//! The agent binary is started with `start --none` so it opens no tunnels on
//! its own, logs JSON to stdout, and serves its local API on the address it
//! announces in the "starting web service" log line. Tunnels are then managed
//! through that API.

use crate::client::{AgentError, TunnelAgentClient, TunnelOptions};
use crate::log::{LogEvent, LogLevel};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Log message announcing the local API address
const WEB_SERVICE_STARTED: &str = "starting web service";

const LOG_CHANNEL_CAPACITY: usize = 256;

/// Configuration for [`NgrokAgent`]
#[derive(Debug, Clone)]
pub struct NgrokAgentConfig {
    /// Path to the agent binary
    pub binary_path: PathBuf,
    /// How long to wait for the agent's local API to come up
    pub startup_timeout: Duration,
    /// Timeout for each local API request
    pub request_timeout: Duration,
}

impl Default for NgrokAgentConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("ngrok"),
            startup_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// A running agent process
struct AgentProcess {
    child: Child,
    api_url: String,
    reader: JoinHandle<()>,
    /// Set by the reader once the agent's output closes
    output_closed: Arc<AtomicBool>,
}

impl AgentProcess {
    /// Why the process is gone, if it is
    fn exit_reason(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) if self.output_closed.load(Ordering::Acquire) => {
                Some("output closed".to_string())
            }
            Ok(None) => None,
            Err(e) => Some(e.to_string()),
        }
    }

    async fn shutdown(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Tunnel agent already exited: {}", e);
        }
        self.reader.abort();
    }
}

#[derive(Debug, Serialize)]
struct StartTunnelRequest<'a> {
    name: String,
    proto: &'static str,
    addr: String,
    bind_tls: bool,
    auth: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subdomain: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TunnelResponse {
    name: String,
    public_url: String,
}

#[derive(Debug, Deserialize)]
struct TunnelListResponse {
    tunnels: Vec<TunnelResponse>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: Option<ApiErrorDetails>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetails {
    err: Option<String>,
}

/// [`TunnelAgentClient`] backed by the ngrok agent binary
pub struct NgrokAgent {
    config: NgrokAgentConfig,
    http: reqwest::Client,
    events: broadcast::Sender<LogEvent>,
    process: Mutex<Option<AgentProcess>>,
}

impl NgrokAgent {
    pub fn new(config: NgrokAgentConfig) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let (events, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            http,
            events,
            process: Mutex::new(None),
        })
    }

    /// Forward agent output to subscribers and report readiness once
    fn spawn_log_reader(
        stdout: ChildStdout,
        events: broadcast::Sender<LogEvent>,
        ready_tx: oneshot::Sender<Result<String, String>>,
        output_closed: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            let mut lines = BufReader::new(stdout).lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(event) = LogEvent::parse_line(&line) else {
                            continue;
                        };

                        let outcome = startup_outcome(&event);

                        // No subscribers is fine
                        let _ = events.send(event);

                        if let Some(outcome) = outcome {
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(outcome);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read tunnel agent output: {}", e);
                        break;
                    }
                }
            }

            output_closed.store(true, Ordering::Release);
            if let Some(tx) = ready_tx {
                let _ = tx.send(Err("agent exited before it was ready".to_string()));
            }
            debug!("Tunnel agent output closed");
        })
    }

    /// Local API address of a live agent; a process that has exited is
    /// reaped here so the next `start` launches a fresh one
    async fn api_url(&self) -> Result<String, AgentError> {
        let mut process = self.process.lock().await;
        let agent = process.as_mut().ok_or(AgentError::NotRunning)?;

        if let Some(reason) = agent.exit_reason() {
            warn!("Tunnel agent exited unexpectedly ({})", reason);
            if let Some(dead) = process.take() {
                dead.shutdown().await;
            }
            return Err(AgentError::NotRunning);
        }

        Ok(agent.api_url.clone())
    }

    async fn fetch_tunnels(&self) -> Result<Vec<TunnelResponse>, AgentError> {
        let api_url = self.api_url().await?;
        let response = self
            .http
            .get(format!("{}/api/tunnels", api_url))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let list: TunnelListResponse = response.json().await?;
        Ok(list.tunnels)
    }
}

/// Whether a log event settles agent startup, and how
fn startup_outcome(event: &LogEvent) -> Option<Result<String, String>> {
    if event.message == WEB_SERVICE_STARTED {
        return Some(
            event
                .field("addr")
                .map(|addr| format!("http://{}", addr))
                .ok_or_else(|| "web service started without an address".to_string()),
        );
    }

    if event.level >= LogLevel::Error {
        return Some(Err(event
            .detail
            .clone()
            .unwrap_or_else(|| event.message.clone())));
    }

    None
}

async fn api_error(response: reqwest::Response) -> AgentError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();

    let message = serde_json::from_str::<ApiErrorResponse>(&body)
        .ok()
        .map(|e| e.details.and_then(|d| d.err).unwrap_or(e.msg))
        .filter(|m| !m.is_empty())
        .unwrap_or(body);

    AgentError::Api { status, message }
}

#[async_trait]
impl TunnelAgentClient for NgrokAgent {
    async fn start(&self, auth_token: &str, region: &str) -> Result<(), AgentError> {
        let mut process = self.process.lock().await;

        // Never let a previous session's credentials linger
        if let Some(previous) = process.take() {
            debug!("Replacing running tunnel agent");
            previous.shutdown().await;
        }

        let mut command = Command::new(&self.config.binary_path);
        command.args([
            "start",
            "--none",
            "--log",
            "stdout",
            "--log-format",
            "json",
            "--authtoken",
            auth_token,
        ]);
        if !region.is_empty() {
            command.args(["--region", region]);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        info!(
            "Launching tunnel agent {} (region: {})",
            self.config.binary_path.display(),
            if region.is_empty() { "default" } else { region }
        );

        let mut child = command.spawn().map_err(|e| {
            AgentError::Launch(format!("{}: {}", self.config.binary_path.display(), e))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Launch("agent stdout was not captured".to_string()))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let output_closed = Arc::new(AtomicBool::new(false));
        let reader = Self::spawn_log_reader(
            stdout,
            self.events.clone(),
            ready_tx,
            output_closed.clone(),
        );
        let mut agent = AgentProcess {
            child,
            api_url: String::new(),
            reader,
            output_closed,
        };

        let ready = match tokio::time::timeout(self.config.startup_timeout, ready_rx).await {
            Ok(Ok(outcome)) => outcome.map_err(AgentError::Startup),
            Ok(Err(_)) => Err(AgentError::Startup(
                "agent exited before it was ready".to_string(),
            )),
            Err(_) => Err(AgentError::Timeout(self.config.startup_timeout)),
        };

        match ready {
            Ok(api_url) => {
                info!("Tunnel agent ready, local API at {}", api_url);
                agent.api_url = api_url;
                *process = Some(agent);
                Ok(())
            }
            Err(e) => {
                agent.shutdown().await;
                Err(e)
            }
        }
    }

    async fn stop(&self) {
        if let Some(agent) = self.process.lock().await.take() {
            info!("Stopping tunnel agent");
            agent.shutdown().await;
        }
    }

    async fn open_tunnel(&self, port: u16, options: &TunnelOptions) -> Result<String, AgentError> {
        let api_url = self.api_url().await?;

        let request = StartTunnelRequest {
            name: format!("tunnelwatch-{}", Uuid::new_v4()),
            proto: "http",
            addr: port.to_string(),
            bind_tls: options.bind_tls,
            auth: &options.basic_auth,
            subdomain: options.subdomain.as_deref(),
            hostname: options.hostname.as_deref(),
        };

        let response = self
            .http
            .post(format!("{}/api/tunnels", api_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let tunnel: TunnelResponse = response.json().await?;
        debug!("Agent opened tunnel '{}'", tunnel.name);
        Ok(tunnel.public_url)
    }

    async fn list_tunnels(&self) -> Result<Vec<String>, AgentError> {
        Ok(self
            .fetch_tunnels()
            .await?
            .into_iter()
            .map(|t| t.public_url)
            .collect())
    }

    async fn close_tunnel(&self, public_url: &str) -> Result<(), AgentError> {
        let api_url = self.api_url().await?;

        let Some(tunnel) = self
            .fetch_tunnels()
            .await?
            .into_iter()
            .find(|t| t.public_url == public_url)
        else {
            debug!("Tunnel {} is already closed", public_url);
            return Ok(());
        };

        let response = self
            .http
            .delete(format!("{}/api/tunnels/{}", api_url, tunnel.name))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        Ok(())
    }

    fn subscribe_log_events(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_outcome_web_service() {
        let event = LogEvent::parse_line(
            r#"{"lvl":"info","msg":"starting web service","addr":"127.0.0.1:4040"}"#,
        )
        .unwrap();

        assert_eq!(
            startup_outcome(&event),
            Some(Ok("http://127.0.0.1:4040".to_string()))
        );
    }

    #[test]
    fn test_startup_outcome_error_line() {
        let event = LogEvent::parse_line(
            r#"{"lvl":"crit","msg":"command failed","err":"authentication failed: bad token"}"#,
        )
        .unwrap();

        assert_eq!(
            startup_outcome(&event),
            Some(Err("authentication failed: bad token".to_string()))
        );
    }

    #[test]
    fn test_startup_outcome_ignores_chatter() {
        let event =
            LogEvent::parse_line(r#"{"lvl":"info","msg":"open config file","path":"x"}"#).unwrap();
        assert!(startup_outcome(&event).is_none());
    }

    #[tokio::test]
    async fn test_start_missing_binary() {
        let agent = NgrokAgent::new(NgrokAgentConfig {
            binary_path: PathBuf::from("/nonexistent/tunnel-agent-binary"),
            ..Default::default()
        })
        .unwrap();

        let result = agent.start("token", "us").await;
        assert!(matches!(result, Err(AgentError::Launch(_))));
    }

    #[tokio::test]
    async fn test_api_calls_require_running_agent() {
        let agent = NgrokAgent::new(NgrokAgentConfig::default()).unwrap();

        assert!(matches!(
            agent.list_tunnels().await,
            Err(AgentError::NotRunning)
        ));
        assert!(matches!(
            agent.close_tunnel("https://x.ngrok.io").await,
            Err(AgentError::NotRunning)
        ));

        // Stopping an agent that never started is a no-op
        agent.stop().await;
    }
}
