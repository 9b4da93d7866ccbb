//! Agent client trait and shared request types

use crate::log::LogEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors reported by a tunnel agent
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to launch tunnel agent: {0}")]
    Launch(String),

    #[error("Tunnel agent failed to start: {0}")]
    Startup(String),

    #[error("Tunnel agent did not become ready within {0:?}")]
    Timeout(Duration),

    #[error("Tunnel agent is not running")]
    NotRunning,

    #[error("Tunnel agent rejected the request ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected response from tunnel agent: {0}")]
    Protocol(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Options for opening a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOptions {
    /// Only expose the TLS endpoint
    pub bind_tls: bool,
    /// HTTP basic-auth challenge in `username:password` form
    pub basic_auth: String,
    /// Requested subdomain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    /// Custom hostname (reserved domain)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Client for an external tunnel agent
///
/// Implementations must be safe to call from a single owner task; the
/// supervisor never issues overlapping calls.
#[async_trait]
pub trait TunnelAgentClient: Send + Sync {
    /// Launch and configure the agent with the given credentials
    async fn start(&self, auth_token: &str, region: &str) -> Result<(), AgentError>;

    /// Stop the agent, killing any session it holds. Idempotent.
    async fn stop(&self);

    /// Open an HTTP tunnel to `port`, returning the public URL
    async fn open_tunnel(&self, port: u16, options: &TunnelOptions) -> Result<String, AgentError>;

    /// Public URLs of all open tunnels
    async fn list_tunnels(&self) -> Result<Vec<String>, AgentError>;

    /// Close the tunnel with the given public URL
    async fn close_tunnel(&self, public_url: &str) -> Result<(), AgentError>;

    /// Subscribe to the agent's diagnostic log stream
    fn subscribe_log_events(&self) -> broadcast::Receiver<LogEvent>;
}

/// Characters left as-is when encoding basic-auth credentials
const AUTH_ENCODE_SET: &percent_encoding::AsciiSet = &percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Build the `username:password` challenge for a tunnel
///
/// Each half is percent-encoded so a `:` inside a credential cannot shift
/// the split point.
///
/// # Example
/// ```
/// use tunnelwatch_agent::basic_auth_pair;
///
/// assert_eq!(basic_auth_pair("u", "p"), "u:p");
/// assert_eq!(basic_auth_pair("a:b", "p w"), "a%3Ab:p%20w");
/// ```
pub fn basic_auth_pair(username: &str, password: &str) -> String {
    format!(
        "{}:{}",
        percent_encoding::utf8_percent_encode(username, AUTH_ENCODE_SET),
        percent_encoding::utf8_percent_encode(password, AUTH_ENCODE_SET)
    )
}
