//! Daily aggregation of raw checks into per-monitor daily rows.

use chrono::{DateTime, Days, Duration as ChronoDuration, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::timer::{spawn_recurring, Clock, JobHandle, Schedule};
use crate::config::ConfigError;
use crate::db::{DailyAggregate, DbError, Store};

const DAILY_HOUR: u32 = 0;
const DAILY_MINUTE: u32 = 5;
const TODAY_REFRESH_DELAY: Duration = Duration::from_secs(5);
const TODAY_REFRESH_PERIOD: Duration = Duration::from_secs(60 * 60);

/// First instant of `date` in `tz`. Where a DST gap swallows midnight the
/// day starts at the first local time that exists.
fn day_start_in<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    (0..=24 * 4)
        .map(|quarter| midnight + ChronoDuration::minutes(quarter * 15))
        .find_map(|t| tz.from_local_datetime(&t).earliest())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

fn day_bounds_in<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let next = date.checked_add_days(Days::new(1)).unwrap_or(date);
    (day_start_in(tz, date), day_start_in(tz, next))
}

/// UTC instants bounding a local calendar day, as `[start, end)`.
pub fn local_day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    day_bounds_in(&Local, date)
}

/// Recompute and upsert the aggregate rows for `date`. Returns the number of
/// monitors written; monitors without checks that day get no row.
pub fn aggregate_day(store: &Store, date: NaiveDate) -> Result<usize, DbError> {
    let (start, end) = local_day_bounds(date);
    let aggregates: Vec<DailyAggregate> = store
        .summarize_checks(start, end)?
        .iter()
        .map(|s| DailyAggregate::from_summary(date, s))
        .collect();

    store.upsert_daily_aggregates(&aggregates)?;
    Ok(aggregates.len())
}

/// Fill in missing aggregate rows for the `lookback_days` days before
/// `today`. Monitors that already have a row for a day are left alone.
/// Returns how many days received at least one new row.
pub fn backfill_history(store: &Store, today: NaiveDate, lookback_days: u32) -> Result<usize, DbError> {
    let mut days_filled = 0;

    for offset in (1..=u64::from(lookback_days)).rev() {
        let Some(date) = today.checked_sub_days(Days::new(offset)) else {
            continue;
        };

        let existing = store.aggregated_monitor_ids(date)?;
        let (start, end) = local_day_bounds(date);
        let missing: Vec<DailyAggregate> = store
            .summarize_checks(start, end)?
            .iter()
            .filter(|s| !existing.contains(&s.monitor_id))
            .map(|s| DailyAggregate::from_summary(date, s))
            .collect();

        if missing.is_empty() {
            continue;
        }

        store.upsert_daily_aggregates(&missing)?;
        tracing::debug!("Aggregation: backfilled {} monitors for {}", missing.len(), date);
        days_filled += 1;
    }

    Ok(days_filled)
}

fn yesterday(clock: &dyn Clock) -> NaiveDate {
    let today = clock.now().date_naive();
    today.pred_opt().unwrap_or(today)
}

/// Owns the startup backfill, the nightly rollup and the hourly refresh of
/// today's rows.
pub struct AggregationScheduler {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    lookback_days: u32,
}

impl AggregationScheduler {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, lookback_days: u32) -> Self {
        Self {
            store,
            clock,
            lookback_days,
        }
    }

    /// Roll yesterday's checks into aggregate rows.
    pub fn run_daily(&self) {
        run_daily(&self.store, self.clock.as_ref());
    }

    /// Recompute today's rows from the checks so far.
    pub fn refresh_today(&self) {
        refresh_today(&self.store, self.clock.as_ref());
    }

    /// Fill gaps in the lookback window. Returns the number of days filled.
    pub fn backfill(&self) -> usize {
        backfill(&self.store, self.clock.as_ref(), self.lookback_days)
    }

    /// Spawn the backfill and both recurring jobs.
    pub fn start(&self) -> Result<Vec<JobHandle>, ConfigError> {
        let store = self.store.clone();
        let clock = self.clock.clone();
        let lookback = self.lookback_days;
        tokio::spawn(async move {
            backfill(&store, clock.as_ref(), lookback);
        });

        let store = self.store.clone();
        let clock = self.clock.clone();
        let daily = spawn_recurring(
            "daily aggregation",
            Schedule::daily_at(DAILY_HOUR, DAILY_MINUTE)?,
            self.clock.clone(),
            move || {
                let store = store.clone();
                let clock = clock.clone();
                async move { run_daily(&store, clock.as_ref()) }
            },
        );

        let store = self.store.clone();
        let clock = self.clock.clone();
        let hourly = spawn_recurring(
            "hourly aggregation",
            Schedule::every(TODAY_REFRESH_DELAY, TODAY_REFRESH_PERIOD),
            self.clock.clone(),
            move || {
                let store = store.clone();
                let clock = clock.clone();
                async move { refresh_today(&store, clock.as_ref()) }
            },
        );

        Ok(vec![daily, hourly])
    }
}

fn run_daily(store: &Store, clock: &dyn Clock) {
    let date = yesterday(clock);
    tracing::info!("Aggregation: running daily aggregation for {}", date);
    match aggregate_day(store, date) {
        Ok(n) => tracing::info!("Aggregation: daily aggregation complete ({} monitors)", n),
        Err(e) => tracing::error!("Aggregation: daily aggregation failed: {}", e),
    }
}

fn refresh_today(store: &Store, clock: &dyn Clock) {
    let today = clock.now().date_naive();
    if let Err(e) = aggregate_day(store, today) {
        tracing::error!("Aggregation: hourly aggregation failed: {}", e);
    }
}

fn backfill(store: &Store, clock: &dyn Clock, lookback_days: u32) -> usize {
    tracing::info!("Aggregation: checking for missing historical data");
    match backfill_history(store, clock.now().date_naive(), lookback_days) {
        Ok(0) => {
            tracing::info!("Aggregation: historical data is up to date");
            0
        }
        Ok(n) => {
            tracing::info!("Aggregation: backfilled {} days of historical data", n);
            n
        }
        Err(e) => {
            tracing::error!("Aggregation: backfill failed: {}", e);
            0
        }
    }
}
