//! Database module for uptrail.
//!
//! Provides SQLite storage for raw checks, daily aggregates and incidents.

mod models;
mod store;

pub use models::*;
pub use store::*;
