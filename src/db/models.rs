//! Database model types.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::monitor::MonitorCheckResult;

/// A single raw check row.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCheck {
    pub monitor_id: i64,
    pub time: DateTime<Utc>,
    pub success: bool,
    pub response_time_ms: i64,
    pub error: Option<String>,
}

impl From<&MonitorCheckResult> for RawCheck {
    fn from(result: &MonitorCheckResult) -> Self {
        Self {
            monitor_id: result.monitor_id,
            time: result.timestamp,
            success: result.success,
            response_time_ms: result.response_time as i64,
            error: result.error.clone(),
        }
    }
}

/// Per-monitor totals over a time range, computed from raw checks.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckSummary {
    pub monitor_id: i64,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub avg_response_time: f64,
    pub min_response_time: i64,
    pub max_response_time: i64,
}

/// One row per monitor per local calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub monitor_id: i64,
    pub date: NaiveDate,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub uptime_percentage: f64,
    pub avg_response_time: f64,
    pub min_response_time: i64,
    pub max_response_time: i64,
}

impl DailyAggregate {
    pub fn from_summary(date: NaiveDate, summary: &CheckSummary) -> Self {
        let uptime_percentage = if summary.total_checks > 0 {
            summary.successful_checks as f64 * 100.0 / summary.total_checks as f64
        } else {
            0.0
        };

        Self {
            monitor_id: summary.monitor_id,
            date,
            total_checks: summary.total_checks,
            successful_checks: summary.successful_checks,
            uptime_percentage,
            avg_response_time: summary.avg_response_time,
            min_response_time: summary.min_response_time,
            max_response_time: summary.max_response_time,
        }
    }
}

/// An incident row. Lifecycle is owned by the incident detector.
#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    pub id: i64,
    pub monitor_id: i64,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub description: String,
}
