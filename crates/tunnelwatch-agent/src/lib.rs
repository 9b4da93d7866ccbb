//! Tunnel agent client - Public API
//!
//! The tunnel agent is an external process that owns the actual tunnel
//! transport. This crate defines the [`TunnelAgentClient`] seam the supervisor
//! talks to, plus an implementation driving the ngrok agent binary.

pub mod client;
pub mod log;
pub mod ngrok;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use client::{basic_auth_pair, AgentError, TunnelAgentClient, TunnelOptions};
pub use log::{LogEvent, LogLevel};
pub use ngrok::{NgrokAgent, NgrokAgentConfig};

// Re-export so implementors don't need their own async-trait dependency
pub use async_trait::async_trait;
