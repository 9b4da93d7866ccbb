//! Tunnel and supervisor configuration

use crate::error::SupervisorError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tunnelwatch_agent::{basic_auth_pair, TunnelOptions};

/// User-facing tunnel settings
///
/// Owned by the host's settings store; the supervisor keeps a copy only to
/// connect with and to detect changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfiguration {
    /// Agent auth token
    pub token: String,
    /// Point-of-presence region, e.g. "us" or "eu"
    pub region: String,
    pub subdomain: Option<String>,
    /// Custom hostname (reserved domain)
    pub hostname: Option<String>,
    /// Basic-auth username guarding the tunnel
    pub auth_name: String,
    /// Basic-auth password guarding the tunnel
    pub auth_pass: String,
    /// Connect automatically at startup and whenever settings change
    pub auto_connect: bool,
    /// Whether the host should trust the basic-auth header as a login
    pub trust_basic_auth: bool,
}

impl Default for TunnelConfiguration {
    fn default() -> Self {
        Self {
            token: String::new(),
            region: "us".to_string(),
            subdomain: None,
            hostname: None,
            auth_name: String::new(),
            auth_pass: String::new(),
            auto_connect: true,
            trust_basic_auth: false,
        }
    }
}

impl TunnelConfiguration {
    pub fn builder() -> TunnelConfigurationBuilder {
        TunnelConfigurationBuilder::default()
    }

    /// Check that a tunnel can be opened with these settings
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.token.is_empty() {
            return Err(SupervisorError::MissingToken);
        }
        if self.auth_name.is_empty() || self.auth_pass.is_empty() {
            return Err(SupervisorError::MissingBasicAuth);
        }
        Ok(())
    }

    /// Options for opening a tunnel with these settings
    pub fn tunnel_options(&self) -> TunnelOptions {
        TunnelOptions {
            bind_tls: true,
            basic_auth: basic_auth_pair(&self.auth_name, &self.auth_pass),
            subdomain: non_empty(&self.subdomain),
            hostname: non_empty(&self.hostname),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Builder for TunnelConfiguration
#[derive(Default)]
pub struct TunnelConfigurationBuilder {
    config: TunnelConfiguration,
}

impl TunnelConfigurationBuilder {
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = token.into();
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.config.region = region.into();
        self
    }

    pub fn subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.config.subdomain = Some(subdomain.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = Some(hostname.into());
        self
    }

    pub fn basic_auth(mut self, name: impl Into<String>, pass: impl Into<String>) -> Self {
        self.config.auth_name = name.into();
        self.config.auth_pass = pass.into();
        self
    }

    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.config.auto_connect = enabled;
        self
    }

    pub fn trust_basic_auth(mut self, enabled: bool) -> Self {
        self.config.trust_basic_auth = enabled;
        self
    }

    pub fn build(self) -> TunnelConfiguration {
        self.config
    }
}

/// How a region change is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionPolicy {
    /// Region is agent-level configuration; changing it restarts the agent
    #[default]
    RestartAgent,
    /// Region is picked up the next time the agent starts for another reason
    ApplyOnNextStart,
}

/// Whether moving from `old` to `new` requires restarting the agent
pub fn needs_restart(
    old: &TunnelConfiguration,
    new: &TunnelConfiguration,
    policy: RegionPolicy,
) -> bool {
    if old.token != new.token {
        return true;
    }
    policy == RegionPolicy::RestartAgent && old.region != new.region
}

/// Supervisor tuning
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Delay before retrying a startup connect that hit an unreachable network
    pub retry_delay: Duration,
    pub region_policy: RegionPolicy,
    pub command_capacity: usize,
    pub notification_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(20),
            region_policy: RegionPolicy::default(),
            command_capacity: 32,
            notification_capacity: 16,
        }
    }
}
