//! Monitor definitions, condition evaluation and the check runner.

mod condition;
mod runner;

pub use condition::*;
pub use runner::*;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Protocol a monitor checks with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorType {
    Http,
    Tcp,
    Dns,
    Ping,
    #[serde(rename = "websocket")]
    WebSocket,
    /// Any type tag this build does not know about.
    #[serde(other)]
    Unsupported,
}

impl std::fmt::Display for MonitorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorType::Http => write!(f, "HTTP"),
            MonitorType::Tcp => write!(f, "TCP"),
            MonitorType::Dns => write!(f, "DNS"),
            MonitorType::Ping => write!(f, "Ping"),
            MonitorType::WebSocket => write!(f, "WebSocket"),
            MonitorType::Unsupported => write!(f, "Unsupported"),
        }
    }
}

fn default_interval() -> u64 {
    60
}

fn default_public() -> bool {
    true
}

/// A monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Monitor {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub monitor_type: MonitorType,
    pub url: String,
    /// Seconds between checks.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Per-check timeout in seconds; the checker default applies when unset.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default = "default_public")]
    pub public: bool,
    #[serde(default)]
    pub group: Option<String>,
}

impl Monitor {
    pub fn new(id: i64, name: &str, monitor_type: MonitorType, url: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            monitor_type,
            url: url.to_string(),
            interval: default_interval(),
            timeout: None,
            conditions: Vec::new(),
            public: default_public(),
            group: None,
        }
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.filter(|t| *t > 0).map(Duration::from_secs)
    }

    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.interval.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_from_json() {
        let json = r#"{
            "id": 3,
            "name": "API",
            "type": "http",
            "url": "https://api.example.com/health",
            "interval": 30,
            "conditions": [{"key": "STATUS_CODE", "operator": "==", "expectedValue": 200}],
            "group": "Backend"
        }"#;
        let monitor: Monitor = serde_json::from_str(json).unwrap();
        assert_eq!(monitor.monitor_type, MonitorType::Http);
        assert_eq!(monitor.interval, 30);
        assert!(monitor.public);
        assert_eq!(monitor.conditions.len(), 1);
        assert_eq!(monitor.group.as_deref(), Some("Backend"));
        assert_eq!(monitor.timeout_duration(), None);
    }

    #[test]
    fn test_unknown_type_maps_to_unsupported() {
        let json = r#"{"id": 1, "name": "x", "type": "smtp", "url": "smtp://mail"}"#;
        let monitor: Monitor = serde_json::from_str(json).unwrap();
        assert_eq!(monitor.monitor_type, MonitorType::Unsupported);
        assert_eq!(monitor.interval, 60);
    }

    #[test]
    fn test_websocket_type_tag() {
        let t: MonitorType = serde_json::from_str(r#""websocket""#).unwrap();
        assert_eq!(t, MonitorType::WebSocket);
        assert_eq!(serde_json::to_string(&MonitorType::WebSocket).unwrap(), r#""websocket""#);
    }

    #[test]
    fn test_interval_never_zero() {
        let mut monitor = Monitor::new(1, "x", MonitorType::Tcp, "tcp://h:1");
        monitor.interval = 0;
        assert_eq!(monitor.interval_duration(), Duration::from_secs(1));
    }
}
