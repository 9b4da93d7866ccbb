//! Supervisor errors

use thiserror::Error;
use tunnelwatch_agent::AgentError;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Tunnel is not fully configured: auth token is missing")]
    MissingToken,

    #[error("Tunnel is not fully configured: basic auth username and password are required")]
    MissingBasicAuth,

    #[error("Could not open tunnel: {0}")]
    Agent(#[from] AgentError),

    #[error("Tunnel supervisor has stopped")]
    Stopped,
}

impl SupervisorError {
    /// Settings problems that need user action rather than a retry
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            SupervisorError::MissingToken | SupervisorError::MissingBasicAuth
        )
    }
}
