//! uptrail daemon entry point.

use uptrail::config::{load_monitors, ServerConfig};
use uptrail::db::{RawCheck, Store};
use uptrail::monitor::MonitorRunner;
use uptrail::scheduler::{
    AggregationScheduler, Clock, RetentionPolicy, RetentionScheduler, Scheduler, SystemClock,
};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("uptrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load()?;
    tracing::info!("Starting uptrail...");
    tracing::info!("Using database at {}", cfg.db_path);

    let monitors = load_monitors(&cfg.monitors_path)?;
    tracing::info!("Loaded {} monitors from {}", monitors.len(), cfg.monitors_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let runner = Arc::new(MonitorRunner::default());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Startup sweep
    let results = runner.run_checks(&monitors).await;
    let up = results.iter().filter(|r| r.success).count();
    for r in results.iter().filter(|r| !r.success) {
        tracing::warn!(
            "{} is down: {}",
            r.monitor_name,
            r.error.as_deref().unwrap_or("conditions not met")
        );
    }
    tracing::info!("Initial sweep: {}/{} monitors up", up, results.len());
    let checks: Vec<RawCheck> = results.iter().map(RawCheck::from).collect();
    store.add_checks(&checks)?;

    // Start background jobs
    let mut jobs = AggregationScheduler::new(store.clone(), clock.clone(), cfg.backfill_days).start()?;
    jobs.push(RetentionScheduler::new(store.clone(), clock, RetentionPolicy::from(&cfg)).start()?);

    let scheduler = Scheduler::new(runner, store);
    scheduler.start(monitors).await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    scheduler.shutdown().await;
    for job in jobs {
        job.shutdown().await;
    }

    Ok(())
}
