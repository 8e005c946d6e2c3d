//! Configuration module for uptrail.
//!
//! Loads configuration from environment variables with sensible defaults,
//! and the monitor list from a JSON file.

use std::env;
use std::path::Path;
use thiserror::Error;

use crate::monitor::Monitor;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to read monitors file {path}: {source}")]
    ReadMonitors {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse monitors file {path}: {source}")]
    ParseMonitors {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Path to the SQLite database file (default: "uptrail.db")
    pub db_path: String,
    /// Path to the JSON monitors file (default: "monitors.json")
    pub monitors_path: String,
    /// Days to keep raw checks (default: 90)
    pub checks_retention_days: u32,
    /// Days to keep resolved incidents (default: 365)
    pub incidents_retention_days: u32,
    /// Days the startup backfill looks back (default: 90)
    pub backfill_days: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "uptrail.db".to_string(),
            monitors_path: "monitors.json".to_string(),
            checks_retention_days: 90,
            incidents_retention_days: 365,
            backfill_days: 90,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPTRAIL_DB_PATH`: Database file path (default: "uptrail.db")
    /// - `UPTRAIL_MONITORS_PATH`: Monitors file path (default: "monitors.json")
    /// - `UPTRAIL_CHECKS_RETENTION_DAYS`: Raw check retention (default: 90)
    /// - `UPTRAIL_INCIDENTS_RETENTION_DAYS`: Resolved incident retention (default: 365)
    /// - `UPTRAIL_BACKFILL_DAYS`: Aggregation backfill window (default: 90)
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(db_path) = lookup("UPTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(monitors_path) = lookup("UPTRAIL_MONITORS_PATH") {
            cfg.monitors_path = monitors_path;
        }
        if let Some(v) = lookup("UPTRAIL_CHECKS_RETENTION_DAYS") {
            cfg.checks_retention_days = parse_days("UPTRAIL_CHECKS_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = lookup("UPTRAIL_INCIDENTS_RETENTION_DAYS") {
            cfg.incidents_retention_days = parse_days("UPTRAIL_INCIDENTS_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = lookup("UPTRAIL_BACKFILL_DAYS") {
            cfg.backfill_days = parse_days("UPTRAIL_BACKFILL_DAYS", &v)?;
        }

        Ok(cfg)
    }
}

fn parse_days(key: &'static str, value: &str) -> Result<u32, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason,
    };

    let days: u32 = value.trim().parse().map_err(|e| invalid(format!("{}", e)))?;
    if days == 0 {
        return Err(invalid("must be at least 1".to_string()));
    }
    Ok(days)
}

/// Read the monitor list from a JSON array file.
pub fn load_monitors<P: AsRef<Path>>(path: P) -> Result<Vec<Monitor>, ConfigError> {
    let display = path.as_ref().display().to_string();
    let data = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::ReadMonitors {
        path: display.clone(),
        source,
    })?;

    serde_json::from_str(&data).map_err(|source| ConfigError::ParseMonitors {
        path: display,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MonitorType;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg, ServerConfig::default());
        assert_eq!(cfg.db_path, "uptrail.db");
        assert_eq!(cfg.checks_retention_days, 90);
        assert_eq!(cfg.incidents_retention_days, 365);
    }

    #[test]
    fn test_overrides() {
        let cfg = ServerConfig::from_lookup(lookup_from(&[
            ("UPTRAIL_DB_PATH", "/var/lib/uptrail/data.db"),
            ("UPTRAIL_CHECKS_RETENTION_DAYS", " 30 "),
            ("UPTRAIL_BACKFILL_DAYS", "7"),
        ]))
        .unwrap();
        assert_eq!(cfg.db_path, "/var/lib/uptrail/data.db");
        assert_eq!(cfg.checks_retention_days, 30);
        assert_eq!(cfg.backfill_days, 7);
        assert_eq!(cfg.incidents_retention_days, 365);
    }

    #[test]
    fn test_invalid_days_rejected() {
        let err = ServerConfig::from_lookup(lookup_from(&[("UPTRAIL_BACKFILL_DAYS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "UPTRAIL_BACKFILL_DAYS", .. }));

        let err = ServerConfig::from_lookup(lookup_from(&[("UPTRAIL_INCIDENTS_RETENTION_DAYS", "a year")]))
            .unwrap_err();
        assert!(err.to_string().contains("UPTRAIL_INCIDENTS_RETENTION_DAYS"));
    }

    #[test]
    fn test_load_monitors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": 1, "name": "site", "type": "http", "url": "https://example.com"}},
                {{"id": 2, "name": "db", "type": "tcp", "url": "tcp://db:5432", "timeout": 3}}
            ]"#
        )
        .unwrap();

        let monitors = load_monitors(file.path()).unwrap();
        assert_eq!(monitors.len(), 2);
        assert_eq!(monitors[1].monitor_type, MonitorType::Tcp);
        assert_eq!(monitors[1].timeout, Some(3));
    }

    #[test]
    fn test_load_monitors_errors() {
        let missing = load_monitors("/nonexistent/monitors.json").unwrap_err();
        assert!(matches!(missing, ConfigError::ReadMonitors { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let bad = load_monitors(file.path()).unwrap_err();
        assert!(matches!(bad, ConfigError::ParseMonitors { .. }));
    }
}
