//! Recurring job timers: wall-clock daily slots and fixed intervals.

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, TimeZone};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ConfigError;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Source of local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// The host's clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// When a recurring job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Next occurrence of a local time of day, then every 24 hours.
    DailyAt { hour: u32, minute: u32 },
    /// After `initial_delay`, then every `period`.
    Every { initial_delay: Duration, period: Duration },
}

impl Schedule {
    pub fn daily_at(hour: u32, minute: u32) -> Result<Self, ConfigError> {
        if hour > 23 || minute > 59 {
            return Err(ConfigError::InvalidSchedule(format!(
                "{:02}:{:02} is not a time of day",
                hour, minute
            )));
        }
        Ok(Schedule::DailyAt { hour, minute })
    }

    pub fn every(initial_delay: Duration, period: Duration) -> Self {
        Schedule::Every {
            initial_delay,
            period: period.max(Duration::from_millis(1)),
        }
    }

    pub fn period(&self) -> Duration {
        match self {
            Schedule::DailyAt { .. } => DAY,
            Schedule::Every { period, .. } => *period,
        }
    }

    /// Time from `now` until the first run.
    ///
    /// For `DailyAt` this is the next occurrence strictly after `now`, so a
    /// start exactly on the slot waits a full day. Arithmetic is on the naive
    /// local time; a DST shift on that night moves the run by the offset.
    pub fn first_delay<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Duration {
        match *self {
            Schedule::Every { initial_delay, .. } => initial_delay,
            Schedule::DailyAt { hour, minute } => {
                let now = now.naive_local();
                let Some(slot) = NaiveTime::from_hms_opt(hour, minute, 0) else {
                    return DAY;
                };
                let mut target = now.date().and_time(slot);
                if target <= now {
                    target += ChronoDuration::days(1);
                }
                (target - now).to_std().unwrap_or(DAY)
            }
        }
    }
}

/// Handle to a spawned recurring job.
pub struct JobHandle {
    name: &'static str,
    stop: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl JobHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the job to stop. A run in progress completes first.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the job and wait for its task to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            tracing::error!("Scheduler: {} task ended abnormally: {}", self.name, e);
        }
    }
}

/// Spawn `job` on `schedule`. Runs are awaited in sequence, so they never
/// overlap; ticks missed while a run is in progress are skipped.
pub fn spawn_recurring<F, Fut>(
    name: &'static str,
    schedule: Schedule,
    clock: Arc<dyn Clock>,
    mut job: F,
) -> JobHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (stop_tx, mut stop_rx) = broadcast::channel(1);
    let first_delay = schedule.first_delay(&clock.now());
    let period = schedule.period();

    tracing::info!("Scheduler: {} first run in {:?}, then every {:?}", name, first_delay, period);

    let task = tokio::spawn(async move {
        tokio::select! {
            _ = stop_rx.recv() => return,
            _ = tokio::time::sleep(first_delay) => {}
        }

        let mut interval = tokio::time::interval_at(Instant::now(), period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = interval.tick() => {
                    tracing::debug!("Scheduler: running {}", name);
                    job().await;
                }
            }
        }

        tracing::info!("Scheduler: {} stopped", name);
    });

    JobHandle {
        name,
        stop: stop_tx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, s).unwrap()
    }

    fn mins(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    #[test]
    fn test_daily_first_delay_before_slot() {
        let schedule = Schedule::daily_at(0, 5).unwrap();
        assert_eq!(schedule.first_delay(&at(0, 4, 0)), mins(1));
        assert_eq!(schedule.first_delay(&at(0, 0, 0)), mins(5));
    }

    #[test]
    fn test_daily_first_delay_after_slot() {
        let schedule = Schedule::daily_at(0, 5).unwrap();
        assert_eq!(schedule.first_delay(&at(23, 0, 0)), mins(65));
        assert_eq!(schedule.first_delay(&at(0, 6, 0)), mins(24 * 60 - 1));
    }

    #[test]
    fn test_daily_first_delay_on_slot_waits_a_day() {
        let schedule = Schedule::daily_at(0, 30).unwrap();
        assert_eq!(schedule.first_delay(&at(0, 30, 0)), DAY);
        assert_eq!(schedule.first_delay(&at(0, 29, 30)), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_daily_slot() {
        assert!(Schedule::daily_at(24, 0).is_err());
        assert!(Schedule::daily_at(12, 60).is_err());
        assert!(Schedule::daily_at(23, 59).is_ok());
    }

    #[test]
    fn test_every_uses_initial_delay() {
        let schedule = Schedule::every(Duration::from_secs(5), Duration::from_secs(3600));
        assert_eq!(schedule.first_delay(&at(12, 0, 0)), Duration::from_secs(5));
        assert_eq!(schedule.period(), Duration::from_secs(3600));
        assert_eq!(Schedule::daily_at(0, 5).unwrap().period(), DAY);
    }

    #[tokio::test]
    async fn test_spawn_recurring_runs_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let handle = spawn_recurring(
            "test job",
            Schedule::every(Duration::from_millis(10), Duration::from_millis(20)),
            Arc::new(SystemClock),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handle.name(), "test job");
        handle.shutdown().await;

        let after_stop = runs.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "expected at least two runs, got {}", after_stop);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_stop_before_first_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let handle = spawn_recurring(
            "never",
            Schedule::every(Duration::from_secs(60), Duration::from_secs(60)),
            Arc::new(SystemClock),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        handle.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
