//! In-memory agent for tests
//!
//! [`RecordingAgent`] records every call in order, hands out predictable
//! tunnel URLs, and can be told to fail or to emit log events while a tunnel
//! is being opened.

use crate::client::{AgentError, TunnelAgentClient, TunnelOptions};
use crate::log::LogEvent;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// A call made against a [`RecordingAgent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    Start { auth_token: String, region: String },
    Stop,
    OpenTunnel { port: u16, options: TunnelOptions },
    ListTunnels,
    CloseTunnel(String),
}

#[derive(Default)]
struct RecordingState {
    calls: Vec<AgentCall>,
    running: bool,
    open: Vec<String>,
    opened_total: u32,
    fail_start: VecDeque<String>,
    fail_open: VecDeque<String>,
    fail_listing: bool,
    emit_during_open: VecDeque<LogEvent>,
}

pub struct RecordingAgent {
    state: Mutex<RecordingState>,
    events: broadcast::Sender<LogEvent>,
}

impl RecordingAgent {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(RecordingState::default()),
            events,
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut RecordingState) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    /// All calls so far, oldest first
    pub fn calls(&self) -> Vec<AgentCall> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with_state(|s| s.calls.clear());
    }

    /// Public URLs of tunnels the agent currently has open
    pub fn open_tunnels(&self) -> Vec<String> {
        self.with_state(|s| s.open.clone())
    }

    pub fn is_running(&self) -> bool {
        self.with_state(|s| s.running)
    }

    /// Make the next `start` fail with the given message
    pub fn fail_next_start(&self, message: &str) {
        self.with_state(|s| s.fail_start.push_back(message.to_string()));
    }

    /// Make the next `open_tunnel` fail with the given message
    pub fn fail_next_open(&self, message: &str) {
        self.with_state(|s| s.fail_open.push_back(message.to_string()));
    }

    /// Make `list_tunnels` and `close_tunnel` fail
    pub fn fail_listing(&self, fail: bool) {
        self.with_state(|s| s.fail_listing = fail);
    }

    /// The agent process dies on its own: no call is recorded
    pub fn crash(&self) {
        self.with_state(|s| {
            s.running = false;
            s.open.clear();
        });
    }

    /// Publish a log event to subscribers right away
    pub fn emit(&self, event: LogEvent) {
        let _ = self.events.send(event);
    }

    /// Publish a log event from inside the next `open_tunnel` call
    pub fn emit_during_next_open(&self, event: LogEvent) {
        self.with_state(|s| s.emit_during_open.push_back(event));
    }
}

impl Default for RecordingAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelAgentClient for RecordingAgent {
    async fn start(&self, auth_token: &str, region: &str) -> Result<(), AgentError> {
        self.with_state(|s| {
            s.calls.push(AgentCall::Start {
                auth_token: auth_token.to_string(),
                region: region.to_string(),
            });
            if let Some(message) = s.fail_start.pop_front() {
                return Err(AgentError::Startup(message));
            }
            // Starting replaces any previous session
            s.open.clear();
            s.running = true;
            Ok(())
        })
    }

    async fn stop(&self) {
        self.with_state(|s| {
            s.calls.push(AgentCall::Stop);
            s.running = false;
            s.open.clear();
        });
    }

    async fn open_tunnel(&self, port: u16, options: &TunnelOptions) -> Result<String, AgentError> {
        let (result, events) = self.with_state(|s| {
            s.calls.push(AgentCall::OpenTunnel {
                port,
                options: options.clone(),
            });
            let events: Vec<LogEvent> = s.emit_during_open.drain(..).collect();

            if !s.running {
                return (Err(AgentError::NotRunning), events);
            }
            if let Some(message) = s.fail_open.pop_front() {
                return (Err(AgentError::Api { status: 502, message }), events);
            }

            s.opened_total += 1;
            let url = format!("https://tunnel-{}.ngrok.io", s.opened_total);
            s.open.push(url.clone());
            (Ok(url), events)
        });

        for event in events {
            self.emit(event);
        }
        result
    }

    async fn list_tunnels(&self) -> Result<Vec<String>, AgentError> {
        self.with_state(|s| {
            s.calls.push(AgentCall::ListTunnels);
            if s.fail_listing {
                return Err(AgentError::Protocol("listing failed".to_string()));
            }
            if !s.running {
                return Err(AgentError::NotRunning);
            }
            Ok(s.open.clone())
        })
    }

    async fn close_tunnel(&self, public_url: &str) -> Result<(), AgentError> {
        self.with_state(|s| {
            s.calls.push(AgentCall::CloseTunnel(public_url.to_string()));
            if s.fail_listing {
                return Err(AgentError::Protocol("close failed".to_string()));
            }
            s.open.retain(|url| url != public_url);
            Ok(())
        })
    }

    fn subscribe_log_events(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }
}
