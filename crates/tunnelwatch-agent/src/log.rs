//! Diagnostic log events emitted by the tunnel agent
//!
//! The agent writes one JSON object per line when started with
//! `--log-format json`:
//!
//! ```text
//! {"lvl":"eror","msg":"failed to reconnect session","obj":"csess","err":"dial tcp: connect: network is unreachable"}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Severity of an agent log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Map the agent's four-letter level names
    pub fn from_agent(lvl: &str) -> Self {
        match lvl.to_ascii_lowercase().as_str() {
            "dbug" | "debug" | "trace" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warning,
            "eror" | "error" => LogLevel::Error,
            "crit" | "critical" => LogLevel::Critical,
            _ => LogLevel::Info,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A single structured log event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    /// Error detail (`err` field), if any
    pub detail: Option<String>,
    /// Remaining fields, stringified
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            level,
            message: message.into(),
            detail,
            fields: BTreeMap::new(),
        }
    }

    /// Look up an extra field such as `addr` or `obj`
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Parse one line of JSON agent output
    ///
    /// Returns `None` for blank lines and anything that is not a JSON object.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let object = match serde_json::from_str::<serde_json::Value>(line) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) => return None,
            Err(e) => {
                debug!("Skipping non-JSON agent output ({}): {}", e, line);
                return None;
            }
        };

        let mut level = LogLevel::Info;
        let mut message = String::new();
        let mut detail = None;
        let mut fields = BTreeMap::new();

        for (key, value) in object {
            let text = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            match key.as_str() {
                "lvl" => level = LogLevel::from_agent(&text),
                "msg" => message = text,
                "err" => detail = Some(text),
                _ => {
                    fields.insert(key, text);
                }
            }
        }

        Some(Self {
            level,
            message,
            detail,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_line() {
        let event = LogEvent::parse_line(
            r#"{"lvl":"eror","msg":"failed to reconnect session","obj":"csess","err":"connect: network is unreachable"}"#,
        )
        .unwrap();

        assert_eq!(event.level, LogLevel::Error);
        assert_eq!(event.message, "failed to reconnect session");
        assert_eq!(
            event.detail.as_deref(),
            Some("connect: network is unreachable")
        );
        assert_eq!(event.field("obj"), Some("csess"));
    }

    #[test]
    fn test_parse_web_service_line() {
        let event = LogEvent::parse_line(
            r#"{"addr":"127.0.0.1:4040","lvl":"info","msg":"starting web service","obj":"web","pid":42}"#,
        )
        .unwrap();

        assert_eq!(event.level, LogLevel::Info);
        assert_eq!(event.field("addr"), Some("127.0.0.1:4040"));
        assert_eq!(event.field("pid"), Some("42"));
        assert!(event.detail.is_none());
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(LogEvent::parse_line("").is_none());
        assert!(LogEvent::parse_line("t=2020 lvl=info msg=hello").is_none());
        assert!(LogEvent::parse_line("[1, 2, 3]").is_none());
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(LogLevel::from_agent("warn"), LogLevel::Warning);
        assert_eq!(LogLevel::from_agent("crit"), LogLevel::Critical);
        assert_eq!(LogLevel::from_agent("dbug"), LogLevel::Debug);
        assert_eq!(LogLevel::from_agent("something"), LogLevel::Info);
        assert!(LogLevel::Error > LogLevel::Warning);
    }
}
