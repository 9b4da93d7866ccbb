//! Classification of tunnel agent diagnostics
//!
//! The agent reports session problems out-of-band through its log stream.
//! [`EventClassifier`] matches events against a table of known
//! `(level, message)` pairs and turns the few that matter into a
//! [`Diagnostic`]. Everything else is dropped. New agent messages are
//! supported by adding a [`Rule`].

use std::fmt;
use tunnelwatch_agent::{LogEvent, LogLevel};

/// Detail fragments meaning the host has no network route
pub const NETWORK_UNREACHABLE: &[&str] = &["network is unreachable"];

/// Detail fragments meaning the tunnel server could not be reached
pub const SERVER_UNREACHABLE: &[&str] =
    &["no such host", "server misbehaving", "connection refused"];

/// A classified agent diagnostic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// The agent could not start the requested tunnel
    TunnelStartFailed(String),
    /// The agent's credentials were rejected
    AuthenticationFailed(String),
    /// The startup connect hit an unreachable network and should be retried
    RetryRequested,
    /// The tunnel server could not be reached
    ServerUnreachable(String),
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::TunnelStartFailed(detail) => write!(f, "Failed to start tunnel: {}", detail),
            Diagnostic::AuthenticationFailed(detail) => {
                write!(f, "Tunnel authentication failed: {}", detail)
            }
            Diagnostic::RetryRequested => f.write_str("Network unreachable, retry requested"),
            Diagnostic::ServerUnreachable(detail) => {
                write!(f, "Tunnel server unreachable: {}", detail)
            }
        }
    }
}

/// What a matching rule produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    TunnelStartFailed,
    AuthenticationFailed,
    /// Lost session: retry on `retry_when` during the startup connect,
    /// report on `unreachable_when`, drop otherwise
    SessionLost {
        retry_when: Vec<String>,
        unreachable_when: Vec<String>,
    },
}

/// A `(level, message) -> outcome` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub level: LogLevel,
    pub message: String,
    pub outcome: RuleOutcome,
}

impl Rule {
    pub fn new(level: LogLevel, message: impl Into<String>, outcome: RuleOutcome) -> Self {
        Self {
            level,
            message: message.into(),
            outcome,
        }
    }

    fn matches(&self, event: &LogEvent) -> bool {
        self.level == event.level && self.message == event.message
    }
}

/// Table-driven classifier for agent log events
#[derive(Debug, Clone)]
pub struct EventClassifier {
    rules: Vec<Rule>,
}

impl EventClassifier {
    /// Classifier with no rules; drops every event
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule. Earlier rules win.
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Classify one event
    ///
    /// `startup_connect_in_flight` gates the network-unreachable retry.
    pub fn classify(&self, event: &LogEvent, startup_connect_in_flight: bool) -> Option<Diagnostic> {
        let rule = self.rules.iter().find(|rule| rule.matches(event))?;
        let detail = event.detail.clone().unwrap_or_default();

        match &rule.outcome {
            RuleOutcome::TunnelStartFailed => Some(Diagnostic::TunnelStartFailed(detail)),
            RuleOutcome::AuthenticationFailed => Some(Diagnostic::AuthenticationFailed(detail)),
            RuleOutcome::SessionLost {
                retry_when,
                unreachable_when,
            } => {
                let mentions =
                    |fragments: &[String]| fragments.iter().any(|f| detail.contains(f.as_str()));

                if startup_connect_in_flight && mentions(retry_when) {
                    Some(Diagnostic::RetryRequested)
                } else if mentions(unreachable_when) {
                    Some(Diagnostic::ServerUnreachable(detail))
                } else {
                    None
                }
            }
        }
    }
}

impl Default for EventClassifier {
    fn default() -> Self {
        let owned = |fragments: &[&str]| -> Vec<String> {
            fragments.iter().map(|f| f.to_string()).collect()
        };

        Self::empty()
            .with_rule(Rule::new(
                LogLevel::Warning,
                "failed to start tunnel",
                RuleOutcome::TunnelStartFailed,
            ))
            .with_rule(Rule::new(
                LogLevel::Error,
                "failed to auth",
                RuleOutcome::AuthenticationFailed,
            ))
            .with_rule(Rule::new(
                LogLevel::Error,
                "failed to reconnect session",
                RuleOutcome::SessionLost {
                    retry_when: owned(NETWORK_UNREACHABLE),
                    unreachable_when: owned(SERVER_UNREACHABLE),
                },
            ))
    }
}
