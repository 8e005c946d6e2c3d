//! Checker module for protocol checks.
//!
//! Supports HTTP, TCP, DNS, Ping and WebSocket checks. Every checker resolves
//! to a [`CheckResult`]; failures are reported in the result, never raised.

mod dns;
mod http;
mod ping;
mod tcp;
mod websocket;

pub use dns::*;
pub use http::*;
pub use ping::*;
pub use tcp::*;
pub use websocket::*;

use crate::monitor::MonitorType;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Internal checker error types. These never escape a checker; they are
/// folded into a failed [`CheckResult`].
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Network(String),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Command(String),
    #[error("{0}")]
    Resolve(String),
}

/// A single value in a check context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<ContextValue>),
}

impl ContextValue {
    /// Numeric view of the value; numeric text is coerced.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ContextValue::Number(n) => Some(*n),
            ContextValue::Text(s) => s.trim().parse().ok(),
            ContextValue::Bool(_) | ContextValue::List(_) => None,
        }
    }
}

impl std::fmt::Display for ContextValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextValue::Bool(b) => write!(f, "{}", b),
            ContextValue::Number(n) => write!(f, "{}", n),
            ContextValue::Text(s) => write!(f, "{}", s),
            ContextValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        ContextValue::Bool(v)
    }
}

impl From<f64> for ContextValue {
    fn from(v: f64) -> Self {
        ContextValue::Number(v)
    }
}

impl From<u64> for ContextValue {
    fn from(v: u64) -> Self {
        ContextValue::Number(v as f64)
    }
}

impl From<u16> for ContextValue {
    fn from(v: u16) -> Self {
        ContextValue::Number(v as f64)
    }
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        ContextValue::Text(v.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        ContextValue::Text(v)
    }
}

impl From<Vec<String>> for ContextValue {
    fn from(v: Vec<String>) -> Self {
        ContextValue::List(v.into_iter().map(ContextValue::Text).collect())
    }
}

/// Key/value bag describing a check, referenced by conditions.
pub type Context = BTreeMap<String, ContextValue>;

/// Uniform result of a single check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub success: bool,
    /// Elapsed time in milliseconds.
    pub response_time: u64,
    pub context: Context,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    /// A successful check. `RESPONSE_TIME` and `TIMESTAMP` are filled in.
    pub fn success(response_time: u64) -> Self {
        let mut result = Self {
            success: true,
            response_time,
            context: Context::new(),
            error: None,
        };
        result.context.insert("RESPONSE_TIME".into(), response_time.into());
        result.stamp()
    }

    /// A failed check with `ERROR` and `TIMESTAMP` filled in.
    pub fn failure(response_time: u64, error: impl Into<String>) -> Self {
        let error = error.into();
        let mut result = Self {
            success: false,
            response_time,
            context: Context::new(),
            error: Some(error.clone()),
        };
        result.context.insert("ERROR".into(), error.into());
        result.stamp()
    }

    /// Result for a monitor type that has no checker registered.
    pub fn not_implemented(monitor_type: MonitorType) -> Self {
        let mut result = Self::failure(0, "Not implemented");
        result.context.insert(
            "ERROR".into(),
            format!("{} checker not implemented", monitor_type).into(),
        );
        result
    }

    /// Result for a monitor whose type is not one of the known protocols.
    pub fn unknown_type() -> Self {
        let mut result = Self::failure(0, "Unknown monitor type");
        result
            .context
            .insert("ERROR".into(), "Unknown monitor type".into());
        result
    }

    /// Add a context entry.
    pub fn with(mut self, key: &str, value: impl Into<ContextValue>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    fn stamp(mut self) -> Self {
        self.context
            .insert("TIMESTAMP".into(), Utc::now().to_rfc3339().into());
        self
    }
}

/// Milliseconds elapsed since `start`.
pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// A protocol-specific checker.
#[async_trait]
pub trait Checker: Send + Sync {
    /// Check `address`. `timeout` overrides the checker's default.
    async fn check(&self, address: &str, timeout: Option<Duration>) -> CheckResult;

    /// Upper bound on how long a check may take with its default timeout.
    fn default_timeout(&self) -> Duration;
}

/// Lookup table from monitor type to its checker.
#[derive(Clone, Default)]
pub struct CheckerRegistry {
    checkers: HashMap<MonitorType, Arc<dyn Checker>>,
}

impl CheckerRegistry {
    /// A registry with no checkers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry with the built-in checker for every protocol.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(MonitorType::Http, Arc::new(HttpChecker::default()));
        registry.register(MonitorType::Tcp, Arc::new(TcpChecker::default()));
        registry.register(MonitorType::Dns, Arc::new(DnsChecker::default()));
        registry.register(MonitorType::Ping, Arc::new(PingChecker::default()));
        registry.register(MonitorType::WebSocket, Arc::new(WebSocketChecker::default()));
        registry
    }

    /// Register (or replace) the checker for a monitor type.
    ///
    /// The `Unsupported` type can never be registered.
    pub fn register(&mut self, monitor_type: MonitorType, checker: Arc<dyn Checker>) {
        if monitor_type == MonitorType::Unsupported {
            tracing::warn!("CheckerRegistry: ignoring checker registered for unsupported type");
            return;
        }
        self.checkers.insert(monitor_type, checker);
    }

    pub fn get(&self, monitor_type: MonitorType) -> Option<Arc<dyn Checker>> {
        self.checkers.get(&monitor_type).cloned()
    }
}
