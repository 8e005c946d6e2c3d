//! uptrail - uptime monitoring engine
//!
//! Checks HTTP, TCP, DNS, ping and WebSocket endpoints, evaluates conditions
//! against the check context, stores raw checks in SQLite and keeps daily
//! uptime aggregates. The binary in `main.rs` wires these together; an HTTP
//! API or incident detector can drive the same types directly.

pub mod checker;
pub mod config;
pub mod db;
pub mod monitor;
pub mod scheduler;
