//! Supervisor state

use serde::{Deserialize, Serialize};

/// Mutable state owned by the supervisor task
#[derive(Debug, Default)]
pub struct SupervisorState {
    /// Port of the service being tunneled
    pub local_port: u16,
    /// Public host of the open tunnel, empty when none. Only non-empty while
    /// `agent_running` is set.
    pub tunnel_url: String,
    /// Agent process/session has been started successfully
    pub agent_running: bool,
    /// Token or region changed since the last successful connect
    pub needs_agent_restart: bool,
    /// The automatic connect fired at startup is in progress
    pub startup_connect_in_flight: bool,
}

impl SupervisorState {
    /// `tunnel_url` is only ever set while the agent runs
    pub fn is_consistent(&self) -> bool {
        self.tunnel_url.is_empty() || self.agent_running
    }
}

/// Point-in-time view of the supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub local_port: u16,
    pub tunnel_url: String,
    pub agent_running: bool,
    pub needs_agent_restart: bool,
    pub startup_connect_in_flight: bool,
    pub retry_pending: bool,
}

/// Strip the scheme from a public URL: `https://abc.ngrok.io` -> `abc.ngrok.io`
pub fn strip_scheme(url: &str) -> &str {
    url.split_once("://").map(|(_, rest)| rest).unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_scheme() {
        assert_eq!(strip_scheme("https://abc.ngrok.io"), "abc.ngrok.io");
        assert_eq!(strip_scheme("tcp://0.tcp.ngrok.io:12345"), "0.tcp.ngrok.io:12345");
        assert_eq!(strip_scheme("abc.ngrok.io"), "abc.ngrok.io");
    }

    #[test]
    fn test_initial_state() {
        let state = SupervisorState::default();
        assert_eq!(state.local_port, 0);
        assert!(state.tunnel_url.is_empty());
        assert!(!state.agent_running);
        assert!(!state.needs_agent_restart);
        assert!(!state.startup_connect_in_flight);
        assert!(state.is_consistent());
    }
}
