//! Runs monitors through their checkers and folds in condition results.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;

use super::{evaluate, ConditionResult, Monitor, MonitorType};
use crate::checker::{CheckResult, CheckerRegistry};

/// Slack on top of a checker's own timeout before the runner gives up on it.
const DEADLINE_GRACE: Duration = Duration::from_secs(5);

/// Final verdict for one monitor in one sweep.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorCheckResult {
    pub monitor_id: i64,
    pub monitor_name: String,
    pub success: bool,
    pub response_time: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub condition_results: Vec<ConditionResult>,
}

/// Dispatches monitors to the checker registered for their type.
pub struct MonitorRunner {
    registry: CheckerRegistry,
    deadline: Option<Duration>,
}

impl Default for MonitorRunner {
    fn default() -> Self {
        Self::new(CheckerRegistry::with_defaults())
    }
}

impl MonitorRunner {
    pub fn new(registry: CheckerRegistry) -> Self {
        Self {
            registry,
            deadline: None,
        }
    }

    /// Use a fixed per-check deadline instead of one derived from the
    /// checker's timeout.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Run one monitor's check and evaluate its conditions.
    pub async fn run_check(&self, monitor: &Monitor) -> MonitorCheckResult {
        let check = self.execute(monitor).await;
        let condition_results = evaluate(&monitor.conditions, &check.context);
        let all_conditions_pass = condition_results.iter().all(|r| r.success);

        MonitorCheckResult {
            monitor_id: monitor.id,
            monitor_name: monitor.name.clone(),
            success: check.success && all_conditions_pass,
            response_time: check.response_time,
            timestamp: Utc::now(),
            error: check.error,
            condition_results,
        }
    }

    /// Run every monitor concurrently. Results are in input order.
    pub async fn run_checks(&self, monitors: &[Monitor]) -> Vec<MonitorCheckResult> {
        join_all(monitors.iter().map(|m| self.run_check(m))).await
    }

    async fn execute(&self, monitor: &Monitor) -> CheckResult {
        if monitor.monitor_type == MonitorType::Unsupported {
            return CheckResult::unknown_type();
        }
        let Some(checker) = self.registry.get(monitor.monitor_type) else {
            return CheckResult::not_implemented(monitor.monitor_type);
        };

        let timeout = monitor.timeout_duration();
        let deadline = self
            .deadline
            .unwrap_or_else(|| timeout.unwrap_or_else(|| checker.default_timeout()) + DEADLINE_GRACE);

        match tokio::time::timeout(deadline, checker.check(&monitor.url, timeout)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "MonitorRunner: {} did not finish within {:?}",
                    monitor.name,
                    deadline
                );
                CheckResult::failure(
                    deadline.as_millis() as u64,
                    format!("Check did not complete within {:?}", deadline),
                )
            }
        }
    }
}
