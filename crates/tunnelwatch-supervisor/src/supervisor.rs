//! Tunnel connection supervisor
//!
//! A single task owns [`SupervisorState`] and processes, one at a time:
//! commands from [`SupervisorHandle`]s, log events from the tunnel agent, and
//! fired retries. A connect therefore always runs to completion before the
//! next request is looked at, and at most one tunnel is ever advertised.

use crate::classifier::{Diagnostic, EventClassifier};
use crate::config::{needs_restart, SupervisorConfig, TunnelConfiguration};
use crate::error::SupervisorError;
use crate::notification::Notification;
use crate::retry::{RetryScheduler, RetryTicket};
use crate::state::{strip_scheme, StatusSnapshot, SupervisorState};
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tunnelwatch_agent::{AgentError, LogEvent, TunnelAgentClient};

/// Request to the supervisor task
pub(crate) enum SupervisorCommand {
    /// Set the local port, preferring a discovered public port
    Configure {
        port: u16,
        public_port: Option<u16>,
        reply: oneshot::Sender<()>,
    },
    /// Settings were saved
    ConfigurationChanged {
        old: TunnelConfiguration,
        new: TunnelConfiguration,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    /// (Re)open the tunnel. `startup` marks the automatic connect at launch.
    Connect {
        startup: bool,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    /// Close any open tunnel
    Disconnect { reply: oneshot::Sender<()> },
    /// Close tunnels and stop the agent
    Shutdown { reply: oneshot::Sender<()> },
    /// Get a status snapshot
    GetStatus(oneshot::Sender<StatusSnapshot>),
}

/// Input to the supervisor loop
enum Input {
    Command(SupervisorCommand),
    Log(Result<LogEvent, RecvError>),
    Retry(RetryTicket),
}

/// Owner of the tunnel lifecycle
pub struct ConnectionSupervisor {
    agent: Arc<dyn TunnelAgentClient>,
    config: SupervisorConfig,
    configuration: TunnelConfiguration,
    classifier: EventClassifier,
    state: SupervisorState,
    retry: RetryScheduler,
    retry_tx: mpsc::UnboundedSender<RetryTicket>,
    retry_rx: mpsc::UnboundedReceiver<RetryTicket>,
    log_events: broadcast::Receiver<LogEvent>,
    log_open: bool,
    notifications: broadcast::Sender<Notification>,
}

impl ConnectionSupervisor {
    /// Create a supervisor for `agent` with the current tunnel settings
    pub fn new(
        agent: Arc<dyn TunnelAgentClient>,
        configuration: TunnelConfiguration,
        config: SupervisorConfig,
    ) -> Self {
        let log_events = agent.subscribe_log_events();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(config.notification_capacity.max(1));

        Self {
            agent,
            config,
            configuration,
            classifier: EventClassifier::default(),
            state: SupervisorState::default(),
            retry: RetryScheduler::new(),
            retry_tx,
            retry_rx,
            log_events,
            log_open: true,
            notifications,
        }
    }

    /// Replace the agent log classifier
    pub fn with_classifier(mut self, classifier: EventClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Start the supervisor task
    ///
    /// The task runs until every handle is dropped, then shuts the tunnel down.
    pub fn spawn(self) -> (SupervisorHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(self.config.command_capacity.max(1));
        let handle = SupervisorHandle {
            commands: command_tx,
            notifications: self.notifications.clone(),
        };
        let task = tokio::spawn(self.run(command_rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SupervisorCommand>) {
        debug!("Tunnel supervisor started");

        loop {
            let input = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Input::Command(command),
                    None => break,
                },
                event = self.log_events.recv(), if self.log_open => Input::Log(event),
                Some(ticket) = self.retry_rx.recv() => Input::Retry(ticket),
            };

            match input {
                Input::Command(command) => self.handle_command(command).await,
                Input::Log(Ok(event)) => self.handle_log_event(event),
                Input::Log(Err(RecvError::Lagged(skipped))) => {
                    warn!("Dropped {} tunnel agent log events", skipped);
                }
                Input::Log(Err(RecvError::Closed)) => {
                    debug!("Tunnel agent log stream closed");
                    self.log_open = false;
                }
                Input::Retry(ticket) => {
                    if self.retry.claim(ticket) {
                        info!("Retrying tunnel connection");
                        // Failures are already reported to subscribers
                        let _ = self.connect().await;
                    }
                }
            }

            debug_assert!(self.state.is_consistent());
        }

        self.shutdown().await;
        debug!("Tunnel supervisor stopped");
    }

    async fn handle_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Configure {
                port,
                public_port,
                reply,
            } => {
                self.configure(port, public_port);
                let _ = reply.send(());
            }
            SupervisorCommand::ConfigurationChanged { old, new, reply } => {
                let result = self.on_configuration_changed(old, new).await;
                let _ = reply.send(result);
            }
            SupervisorCommand::Connect { startup, reply } => {
                let result = if startup {
                    self.startup_connect().await
                } else {
                    self.connect().await
                };
                let _ = reply.send(result);
            }
            SupervisorCommand::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            SupervisorCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
            SupervisorCommand::GetStatus(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn configure(&mut self, port: u16, public_port: Option<u16>) {
        // A discovered public port means a reverse proxy sits in front
        self.state.local_port = match public_port {
            Some(public_port) if public_port != 0 => {
                info!(
                    "Using discovered public port {} instead of {}",
                    public_port, port
                );
                public_port
            }
            _ => port,
        };
    }

    async fn on_configuration_changed(
        &mut self,
        old: TunnelConfiguration,
        new: TunnelConfiguration,
    ) -> Result<(), SupervisorError> {
        if needs_restart(&old, &new, self.config.region_policy) {
            debug!("Agent credentials changed, agent restart required");
            self.state.needs_agent_restart = true;
        }

        self.configuration = new;

        if !self.configuration.auto_connect {
            debug!("Auto-connect disabled, keeping new settings for the next connect");
            return Ok(());
        }

        self.connect().await
    }

    async fn startup_connect(&mut self) -> Result<(), SupervisorError> {
        if !self.configuration.auto_connect {
            info!("Auto-connect disabled, not opening a tunnel at startup");
            return Ok(());
        }

        self.state.startup_connect_in_flight = true;
        self.connect().await
    }

    async fn connect(&mut self) -> Result<(), SupervisorError> {
        self.retry.cancel();

        // Tunnels are never stacked
        if self.state.agent_running {
            self.disconnect().await;
        }

        if let Err(e) = self.configuration.validate() {
            if matches!(e, SupervisorError::MissingToken) {
                self.state.needs_agent_restart = true;
            }
            self.state.startup_connect_in_flight = false;
            warn!("{}", e);
            self.notify(Notification::Error(e.to_string()));
            return Err(e);
        }

        let result = self.open_tunnel().await;

        // Events logged while the attempt was blocked belong to this attempt
        self.drain_log_events();
        self.state.startup_connect_in_flight = false;

        match result {
            Ok(public_url) => {
                if self.retry.cancel() {
                    debug!("Tunnel is up, dropping scheduled retry");
                }
                self.state.tunnel_url = strip_scheme(&public_url).to_string();
                self.state.needs_agent_restart = false;
                info!("✅ Tunnel open: {}", self.state.tunnel_url);
                self.notify(Notification::Tunnel(self.state.tunnel_url.clone()));
                Ok(())
            }
            Err(e) => {
                error!("Could not open tunnel: {}", e);
                let e = SupervisorError::from(e);
                self.notify(Notification::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Restart or start the agent as needed, then open the tunnel
    async fn open_tunnel(&mut self) -> Result<String, AgentError> {
        if self.state.needs_agent_restart && self.state.agent_running {
            info!("Restarting tunnel agent with new credentials");
            self.agent.stop().await;
            self.state.agent_running = false;
        }

        let reused = self.state.agent_running;
        if !reused {
            self.start_agent().await?;
        }

        info!("Opening tunnel to local port {}...", self.state.local_port);
        let options = self.configuration.tunnel_options();
        match self.agent.open_tunnel(self.state.local_port, &options).await {
            Err(AgentError::NotRunning) if reused => {
                warn!("Tunnel agent is no longer running, relaunching");
                self.mark_agent_stopped();
                self.start_agent().await?;
                self.agent
                    .open_tunnel(self.state.local_port, &options)
                    .await
            }
            result => result,
        }
    }

    async fn start_agent(&mut self) -> Result<(), AgentError> {
        info!("Starting tunnel agent (region: {})", self.configuration.region);
        self.agent
            .start(&self.configuration.token, &self.configuration.region)
            .await?;
        self.state.agent_running = true;
        Ok(())
    }

    /// The agent went away without being asked to
    fn mark_agent_stopped(&mut self) {
        self.state.agent_running = false;
        self.state.tunnel_url.clear();
    }

    async fn disconnect(&mut self) {
        if !self.state.agent_running {
            return;
        }

        info!("Closing any open tunnels");
        match self.agent.list_tunnels().await {
            Ok(urls) => {
                for url in urls {
                    info!("Closing tunnel {}", url);
                    if let Err(e) = self.agent.close_tunnel(&url).await {
                        debug!("Failed to close tunnel {}: {}", url, e);
                    }
                }
            }
            Err(AgentError::NotRunning) => {
                warn!("Tunnel agent is no longer running");
                self.mark_agent_stopped();
            }
            Err(e) => debug!("Failed to list open tunnels: {}", e),
        }

        self.state.tunnel_url.clear();
        self.notify(Notification::closed());
    }

    async fn shutdown(&mut self) {
        self.retry.cancel();

        if !self.state.agent_running {
            return;
        }

        self.disconnect().await;
        self.agent.stop().await;
        self.state.agent_running = false;
        info!("Tunnel agent stopped");
    }

    fn handle_log_event(&mut self, event: LogEvent) {
        let Some(diagnostic) = self
            .classifier
            .classify(&event, self.state.startup_connect_in_flight)
        else {
            debug!("agent: [{}] {}", event.level, event.message);
            return;
        };

        match diagnostic {
            Diagnostic::RetryRequested => {
                self.state.startup_connect_in_flight = false;
                warn!(
                    "Network unreachable while connecting at startup, retrying in {}s",
                    self.config.retry_delay.as_secs()
                );
                let retry_tx = self.retry_tx.clone();
                self.retry.schedule(self.config.retry_delay, move |ticket| {
                    let _ = retry_tx.send(ticket);
                });
            }
            diagnostic => {
                error!("{}", diagnostic);
                self.notify(Notification::Error(diagnostic.to_string()));
            }
        }
    }

    fn drain_log_events(&mut self) {
        if !self.log_open {
            return;
        }

        loop {
            match self.log_events.try_recv() {
                Ok(event) => self.handle_log_event(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Dropped {} tunnel agent log events", skipped);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => {
                    self.log_open = false;
                    break;
                }
            }
        }
    }

    fn notify(&self, notification: Notification) {
        // No subscribers is fine
        let _ = self.notifications.send(notification);
    }

    fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            local_port: self.state.local_port,
            tunnel_url: self.state.tunnel_url.clone(),
            agent_running: self.state.agent_running,
            needs_agent_restart: self.state.needs_agent_restart,
            startup_connect_in_flight: self.state.startup_connect_in_flight,
            retry_pending: self.retry.is_pending(),
        }
    }
}

/// Cloneable handle to a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<SupervisorCommand>,
    notifications: broadcast::Sender<Notification>,
}

impl SupervisorHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T, SupervisorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| SupervisorError::Stopped)?;
        reply_rx.await.map_err(|_| SupervisorError::Stopped)
    }

    /// Set the local port; `public_port` overrides it when present
    pub async fn configure(
        &self,
        port: u16,
        public_port: Option<u16>,
    ) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorCommand::Configure {
            port,
            public_port,
            reply,
        })
        .await
    }

    /// Report saved settings; reconnects when auto-connect is enabled
    pub async fn on_configuration_changed(
        &self,
        old: TunnelConfiguration,
        new: TunnelConfiguration,
    ) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorCommand::ConfigurationChanged { old, new, reply })
            .await?
    }

    /// Automatic connect at process startup
    pub async fn startup_connect(&self) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorCommand::Connect {
            startup: true,
            reply,
        })
        .await?
    }

    /// Open the tunnel, replacing any open one
    pub async fn connect(&self) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorCommand::Connect {
            startup: false,
            reply,
        })
        .await?
    }

    /// Close any open tunnel; the agent keeps running
    pub async fn disconnect(&self) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorCommand::Disconnect { reply })
            .await
    }

    /// Close tunnels and stop the agent
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorCommand::Shutdown { reply })
            .await
    }

    /// Snapshot of the supervisor state
    pub async fn status(&self) -> Result<StatusSnapshot, SupervisorError> {
        self.request(SupervisorCommand::GetStatus).await
    }

    /// Subscribe to tunnel notifications
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }
}
