//! Operator-facing notifications

use serde::{Deserialize, Serialize};

/// Status message for whoever displays tunnel state
///
/// Serializes as `{"tunnel": "<host>"}` or `{"error": "<message>"}`. An empty
/// tunnel means the tunnel was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Notification {
    Tunnel(String),
    Error(String),
}

impl Notification {
    pub fn closed() -> Self {
        Notification::Tunnel(String::new())
    }
}
