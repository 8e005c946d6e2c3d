//! Scheduler module for running monitor checks and maintaining stored data.

mod aggregation;
mod retention;
mod timer;

pub use aggregation::*;
pub use retention::*;
pub use timer::*;

use crate::db::{RawCheck, Store};
use crate::monitor::{Monitor, MonitorRunner};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const FLUSH_BATCH: usize = 500;

/// Runs every monitor on its own interval and persists the results.
pub struct Scheduler {
    runner: Arc<MonitorRunner>,
    stop_chans: Arc<RwLock<HashMap<i64, broadcast::Sender<()>>>>,
    raw_check_tx: mpsc::Sender<RawCheck>,
    writer: JoinHandle<()>,
}

impl Scheduler {
    /// Create a new scheduler writing to the given store.
    pub fn new(runner: Arc<MonitorRunner>, store: Arc<Store>) -> Self {
        let (tx, rx) = mpsc::channel(1000);

        // Start batch writer in a separate task
        let writer = tokio::spawn(run_batch_writer(rx, store));

        Self {
            runner,
            stop_chans: Arc::new(RwLock::new(HashMap::new())),
            raw_check_tx: tx,
            writer,
        }
    }

    /// Begin checking every monitor in `monitors`.
    pub async fn start(&self, monitors: Vec<Monitor>) {
        tracing::info!("Scheduler: starting with {} monitors", monitors.len());

        for monitor in monitors {
            self.add_monitor(monitor).await;
        }
    }

    /// Add a monitor to be checked. A monitor already running is left as is.
    pub async fn add_monitor(&self, monitor: Monitor) {
        let mut stop_chans = self.stop_chans.write().await;

        if stop_chans.contains_key(&monitor.id) {
            return;
        }

        let (stop_tx, _) = broadcast::channel(1);
        stop_chans.insert(monitor.id, stop_tx.clone());
        drop(stop_chans);

        tracing::info!("Scheduler: Adding monitor {} ({})", monitor.name, monitor.monitor_type);

        let runner = self.runner.clone();
        let raw_check_tx = self.raw_check_tx.clone();
        let stop_rx = stop_tx.subscribe();

        tokio::spawn(async move {
            run_check_loop(monitor, runner, raw_check_tx, stop_rx).await;
        });
    }

    /// Stop checking a monitor.
    pub async fn remove_monitor(&self, id: i64) -> bool {
        let mut stop_chans = self.stop_chans.write().await;

        match stop_chans.remove(&id) {
            Some(stop_tx) => {
                let _ = stop_tx.send(());
                tracing::info!("Scheduler: Removed monitor {}", id);
                true
            }
            None => false,
        }
    }

    /// IDs of the monitors currently scheduled.
    pub async fn monitor_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.stop_chans.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop every monitor loop.
    pub async fn stop(&self) {
        let mut stop_chans = self.stop_chans.write().await;
        for (_, stop_tx) in stop_chans.drain() {
            let _ = stop_tx.send(());
        }
    }

    /// Stop every monitor loop and wait for buffered checks to be written.
    /// Loops finish their in-flight check first.
    pub async fn shutdown(self) {
        self.stop().await;

        let Scheduler {
            raw_check_tx,
            writer,
            ..
        } = self;
        drop(raw_check_tx);

        if let Err(e) = writer.await {
            tracing::error!("Scheduler: batch writer ended abnormally: {}", e);
        }
    }
}

/// Run the check loop for a single monitor. The first check happens one
/// interval after the loop starts; startup checks are done by the caller.
async fn run_check_loop(
    monitor: Monitor,
    runner: Arc<MonitorRunner>,
    tx: mpsc::Sender<RawCheck>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let period = monitor.interval_duration();
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                let result = runner.run_check(&monitor).await;
                if !result.success {
                    tracing::debug!(
                        "Scheduler: {} failed: {}",
                        monitor.name,
                        result.error.as_deref().unwrap_or("conditions not met")
                    );
                }

                if tx.send(RawCheck::from(&result)).await.is_err() {
                    tracing::error!("Scheduler: Failed to send result for {}", monitor.name);
                    break;
                }
            }
        }
    }
}

/// Run the batch writer that accumulates and flushes raw checks.
async fn run_batch_writer(mut rx: mpsc::Receiver<RawCheck>, store: Arc<Store>) {
    let mut buffer: Vec<RawCheck> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Some(check) => {
                        buffer.push(check);
                        if buffer.len() >= FLUSH_BATCH {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<RawCheck>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.add_checks(buffer) {
        tracing::error!("Scheduler: Failed to flush {} checks: {}", buffer.len(), e);
    }

    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{CheckResult, Checker, CheckerRegistry};
    use crate::monitor::MonitorType;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};

    struct AlwaysUp;

    #[async_trait]
    impl Checker for AlwaysUp {
        async fn check(&self, _address: &str, _timeout: Option<Duration>) -> CheckResult {
            CheckResult::success(3)
        }

        fn default_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
    }

    fn scheduler(store: Arc<Store>) -> Scheduler {
        let mut registry = CheckerRegistry::empty();
        registry.register(MonitorType::Tcp, Arc::new(AlwaysUp));
        Scheduler::new(Arc::new(MonitorRunner::new(registry)), store)
    }

    #[tokio::test]
    async fn test_checks_are_persisted() {
        let store = Arc::new(Store::in_memory().unwrap());
        let scheduler = scheduler(store.clone());
        let start = Utc::now() - ChronoDuration::seconds(1);

        let mut monitor = Monitor::new(9, "db", MonitorType::Tcp, "tcp://db:5432");
        monitor.interval = 1;
        scheduler.start(vec![monitor]).await;
        tokio::time::sleep(Duration::from_secs(1) + FLUSH_INTERVAL + Duration::from_millis(500)).await;

        let checks = store.get_checks(9, start, Utc::now()).unwrap();
        assert!(!checks.is_empty());
        assert!(checks[0].success);
        assert_eq!(checks[0].response_time_ms, 3);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_buffered_checks() {
        let store = Arc::new(Store::in_memory().unwrap());
        let scheduler = scheduler(store.clone());
        let start = Utc::now() - ChronoDuration::seconds(1);

        let mut monitor = Monitor::new(4, "cache", MonitorType::Tcp, "tcp://cache:6379");
        monitor.interval = 1;
        scheduler.start(vec![monitor]).await;

        // One check is sent at 1s; the next periodic flush is not due until 2s
        tokio::time::sleep(Duration::from_millis(1300)).await;
        scheduler.shutdown().await;

        let checks = store.get_checks(4, start, Utc::now()).unwrap();
        assert_eq!(checks.len(), 1);
    }

    #[tokio::test]
    async fn test_add_and_remove_monitor() {
        let store = Arc::new(Store::in_memory().unwrap());
        let scheduler = scheduler(store);

        let monitor = Monitor::new(1, "a", MonitorType::Tcp, "tcp://a:1");
        scheduler.add_monitor(monitor.clone()).await;
        scheduler.add_monitor(monitor).await;
        scheduler.add_monitor(Monitor::new(2, "b", MonitorType::Tcp, "tcp://b:1")).await;
        assert_eq!(scheduler.monitor_ids().await, vec![1, 2]);

        assert!(scheduler.remove_monitor(1).await);
        assert!(!scheduler.remove_monitor(1).await);
        assert_eq!(scheduler.monitor_ids().await, vec![2]);

        scheduler.stop().await;
        assert!(scheduler.monitor_ids().await.is_empty());
    }
}
