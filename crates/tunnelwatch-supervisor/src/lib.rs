//! Tunnel connection supervisor - Public API
//!
//! Decides when to open, tear down, or retry a tunnel in response to host
//! lifecycle events and settings changes. All state lives in one task; the
//! host talks to it through a [`SupervisorHandle`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunnelwatch_agent::{NgrokAgent, NgrokAgentConfig};
//! use tunnelwatch_supervisor::{ConnectionSupervisor, SupervisorConfig, TunnelConfiguration};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let agent = Arc::new(NgrokAgent::new(NgrokAgentConfig::default())?);
//! let settings = TunnelConfiguration::builder()
//!     .token("2abc...")
//!     .basic_auth("user", "secret")
//!     .build();
//!
//! let (handle, _task) =
//!     ConnectionSupervisor::new(agent, settings, SupervisorConfig::default()).spawn();
//! handle.configure(5000, None).await?;
//! handle.startup_connect().await?;
//! println!("{:?}", handle.status().await?);
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod config;
pub mod error;
pub mod notification;
pub mod retry;
pub mod state;
pub mod supervisor;

pub use classifier::{Diagnostic, EventClassifier, Rule, RuleOutcome};
pub use config::{
    needs_restart, RegionPolicy, SupervisorConfig, TunnelConfiguration,
    TunnelConfigurationBuilder,
};
pub use error::SupervisorError;
pub use notification::Notification;
pub use retry::{RetryScheduler, RetryTicket};
pub use state::{strip_scheme, StatusSnapshot, SupervisorState};
pub use supervisor::{ConnectionSupervisor, SupervisorHandle};
