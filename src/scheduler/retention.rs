//! Retention scheduler for cleaning up old checks and resolved incidents.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::timer::{spawn_recurring, Clock, JobHandle, Schedule};
use crate::config::{ConfigError, ServerConfig};
use crate::db::Store;

const RETENTION_HOUR: u32 = 0;
const RETENTION_MINUTE: u32 = 30;

/// How long data is kept, in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub checks_days: u32,
    pub incidents_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            checks_days: 90,
            incidents_days: 365,
        }
    }
}

impl From<&ServerConfig> for RetentionPolicy {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            checks_days: cfg.checks_retention_days,
            incidents_days: cfg.incidents_retention_days,
        }
    }
}

/// Rows removed by one retention run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub deleted_checks: usize,
    pub deleted_incidents: usize,
}

/// Delete checks and resolved incidents older than the policy allows.
/// Open incidents are kept regardless of age.
///
/// Failures are logged. A failed step stops the run and the report holds
/// whatever was deleted before it.
pub fn run_retention(store: &Store, policy: RetentionPolicy, now: DateTime<Utc>) -> RetentionReport {
    let mut report = RetentionReport::default();

    let checks_cutoff = now - ChronoDuration::days(i64::from(policy.checks_days));
    match store.delete_checks_before(checks_cutoff) {
        Ok(n) => {
            report.deleted_checks = n;
            tracing::info!(
                "RetentionScheduler: deleted {} checks older than {} days",
                n,
                policy.checks_days
            );
        }
        Err(e) => {
            tracing::error!("RetentionScheduler: cleanup failed deleting checks: {}", e);
            return report;
        }
    }

    let incidents_cutoff = now - ChronoDuration::days(i64::from(policy.incidents_days));
    match store.delete_resolved_incidents_before(incidents_cutoff) {
        Ok(n) => {
            report.deleted_incidents = n;
            tracing::info!(
                "RetentionScheduler: deleted {} resolved incidents older than {} days",
                n,
                policy.incidents_days
            );
        }
        Err(e) => {
            tracing::error!("RetentionScheduler: cleanup failed deleting incidents: {}", e);
            return report;
        }
    }

    tracing::info!("RetentionScheduler: cleanup complete");
    report
}

/// Runs retention nightly at 00:30 local time.
pub struct RetentionScheduler {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    policy: RetentionPolicy,
}

impl RetentionScheduler {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, policy: RetentionPolicy) -> Self {
        Self { store, clock, policy }
    }

    /// Run once now.
    pub fn run_once(&self) -> RetentionReport {
        run_retention(&self.store, self.policy, self.clock.now().with_timezone(&Utc))
    }

    pub fn start(&self) -> Result<JobHandle, ConfigError> {
        tracing::info!(
            "RetentionScheduler: checks kept {} days, resolved incidents kept {} days",
            self.policy.checks_days,
            self.policy.incidents_days
        );

        let store = self.store.clone();
        let clock = self.clock.clone();
        let policy = self.policy;
        Ok(spawn_recurring(
            "data retention",
            Schedule::daily_at(RETENTION_HOUR, RETENTION_MINUTE)?,
            self.clock.clone(),
            move || {
                let store = store.clone();
                let clock = clock.clone();
                async move {
                    run_retention(&store, policy, clock.now().with_timezone(&Utc));
                }
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RawCheck;
    use chrono::{Local, TimeZone};

    struct FixedClock(DateTime<Local>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Local> {
            self.0
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 30, 0).unwrap()
    }

    fn check_at(time: DateTime<Utc>) -> RawCheck {
        RawCheck {
            monitor_id: 1,
            time,
            success: true,
            response_time_ms: 10,
            error: None,
        }
    }

    #[test]
    fn test_old_checks_deleted() {
        let store = Store::in_memory().unwrap();
        let now = now();
        store
            .add_checks(&[
                check_at(now - ChronoDuration::days(100)),
                check_at(now - ChronoDuration::days(91)),
                check_at(now - ChronoDuration::days(89)),
                check_at(now - ChronoDuration::hours(1)),
            ])
            .unwrap();

        let report = run_retention(&store, RetentionPolicy::default(), now);
        assert_eq!(report.deleted_checks, 2);
        assert_eq!(report.deleted_incidents, 0);

        let left = store.get_checks(1, now - ChronoDuration::days(365), now).unwrap();
        assert_eq!(left.len(), 2);
    }

    #[test]
    fn test_incident_retention() {
        let store = Store::in_memory().unwrap();
        let now = now();

        // Resolved 400 days ago: deleted
        let old = store.open_incident(1, now - ChronoDuration::days(401), "old").unwrap();
        store.resolve_incident(old, now - ChronoDuration::days(400)).unwrap();

        // Started long ago, resolved recently: kept
        let recent = store.open_incident(1, now - ChronoDuration::days(500), "recent").unwrap();
        store.resolve_incident(recent, now - ChronoDuration::days(10)).unwrap();

        // Still open after 1000 days: kept
        let open = store.open_incident(1, now - ChronoDuration::days(1000), "open").unwrap();

        let report = run_retention(&store, RetentionPolicy::default(), now);
        assert_eq!(report.deleted_incidents, 1);
        assert!(store.get_incident(old).unwrap().is_none());
        assert!(store.get_incident(recent).unwrap().is_some());
        assert!(store.get_incident(open).unwrap().is_some());
    }

    #[test]
    fn test_failed_incident_step_keeps_check_count() {
        let store = Store::in_memory().unwrap();
        let now = now();
        store
            .add_checks(&[check_at(now - ChronoDuration::days(120)), check_at(now)])
            .unwrap();
        store.execute_batch("DROP TABLE incidents").unwrap();

        let report = run_retention(&store, RetentionPolicy::default(), now);
        assert_eq!(
            report,
            RetentionReport { deleted_checks: 1, deleted_incidents: 0 }
        );
    }

    #[test]
    fn test_failed_check_step_reports_nothing() {
        let store = Store::in_memory().unwrap();
        let old = store.open_incident(1, now() - ChronoDuration::days(900), "old").unwrap();
        store.resolve_incident(old, now() - ChronoDuration::days(800)).unwrap();
        store.execute_batch("DROP TABLE checks").unwrap();

        let report = run_retention(&store, RetentionPolicy::default(), now());
        assert_eq!(report, RetentionReport::default());
        assert!(store.get_incident(old).unwrap().is_some());
    }

    #[test]
    fn test_policy_from_config() {
        let cfg = ServerConfig {
            checks_retention_days: 7,
            incidents_retention_days: 30,
            ..ServerConfig::default()
        };
        assert_eq!(
            RetentionPolicy::from(&cfg),
            RetentionPolicy { checks_days: 7, incidents_days: 30 }
        );
    }

    #[test]
    fn test_run_once_uses_clock() {
        let store = Arc::new(Store::in_memory().unwrap());
        let now = now();
        store.add_checks(&[check_at(now - ChronoDuration::days(8))]).unwrap();

        let policy = RetentionPolicy { checks_days: 7, incidents_days: 365 };
        let scheduler = RetentionScheduler::new(store, Arc::new(FixedClock(now.with_timezone(&Local))), policy);
        assert_eq!(scheduler.run_once().deleted_checks, 1);
        assert_eq!(scheduler.run_once(), RetentionReport::default());
    }
}
