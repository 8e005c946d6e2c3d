//! SQLite database store implementation.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("database lock poisoned")]
    LockPoisoned,
}

/// Thread-safe database store.
///
/// Raw checks are append-only; daily aggregates are only ever upserted, so
/// the sweep loop and the scheduled jobs can write concurrently.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create a store backed by a private in-memory database.
    pub fn in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    /// Run raw SQL against the connection, for tests that need a damaged schema.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), DbError> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    // --- Raw Checks ---

    /// Append raw checks in batch.
    pub fn add_checks(&self, checks: &[RawCheck]) -> Result<(), DbError> {
        if checks.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO checks (monitor_id, time, success, response_time_ms, error) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for c in checks {
                stmt.execute(params![
                    c.monitor_id,
                    format_time(c.time),
                    c.success,
                    c.response_time_ms,
                    c.error,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Raw checks for a monitor within `[start, end)`.
    pub fn get_checks(
        &self,
        monitor_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawCheck>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT monitor_id, time, success, response_time_ms, error FROM checks
             WHERE monitor_id = ?1 AND time >= ?2 AND time < ?3 ORDER BY time ASC",
        )?;

        let checks = stmt
            .query_map(params![monitor_id, format_time(start), format_time(end)], |row| {
                let time_str: String = row.get(1)?;
                Ok(RawCheck {
                    monitor_id: row.get(0)?,
                    time: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                    success: row.get(2)?,
                    response_time_ms: row.get(3)?,
                    error: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(checks)
    }

    /// Per-monitor totals for all checks within `[start, end)`.
    pub fn summarize_checks(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CheckSummary>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT monitor_id, COUNT(*), SUM(success), AVG(response_time_ms),
                    MIN(response_time_ms), MAX(response_time_ms)
             FROM checks WHERE time >= ?1 AND time < ?2
             GROUP BY monitor_id ORDER BY monitor_id",
        )?;

        let summaries = stmt
            .query_map(params![format_time(start), format_time(end)], |row| {
                Ok(CheckSummary {
                    monitor_id: row.get(0)?,
                    total_checks: row.get(1)?,
                    successful_checks: row.get(2)?,
                    avg_response_time: row.get(3)?,
                    min_response_time: row.get(4)?,
                    max_response_time: row.get(5)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(summaries)
    }

    /// Delete raw checks before a cutoff. Returns the number removed.
    pub fn delete_checks_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM checks WHERE time < ?1", params![format_time(cutoff)])?;
        Ok(deleted)
    }

    // --- Daily Aggregates ---

    /// Insert or replace daily aggregates in batch, keyed by (monitor, date).
    pub fn upsert_daily_aggregates(&self, aggregates: &[DailyAggregate]) -> Result<(), DbError> {
        if aggregates.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO daily_aggregates (monitor_id, date, total_checks, successful_checks,
                    uptime_percentage, avg_response_time, min_response_time, max_response_time, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(monitor_id, date) DO UPDATE SET
                 total_checks=excluded.total_checks, successful_checks=excluded.successful_checks,
                 uptime_percentage=excluded.uptime_percentage, avg_response_time=excluded.avg_response_time,
                 min_response_time=excluded.min_response_time, max_response_time=excluded.max_response_time,
                 updated_at=excluded.updated_at",
            )?;
            let now = format_time(Utc::now());
            for a in aggregates {
                stmt.execute(params![
                    a.monitor_id,
                    a.date.format(DATE_FORMAT).to_string(),
                    a.total_checks,
                    a.successful_checks,
                    a.uptime_percentage,
                    a.avg_response_time,
                    a.min_response_time,
                    a.max_response_time,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Daily aggregates for a monitor within `[start, end]`, oldest first.
    pub fn get_daily_aggregates(
        &self,
        monitor_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyAggregate>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT monitor_id, date, total_checks, successful_checks, uptime_percentage,
                    avg_response_time, min_response_time, max_response_time
             FROM daily_aggregates
             WHERE monitor_id = ?1 AND date >= ?2 AND date <= ?3
             ORDER BY date ASC",
        )?;

        let aggregates = stmt
            .query_map(
                params![
                    monitor_id,
                    start.format(DATE_FORMAT).to_string(),
                    end.format(DATE_FORMAT).to_string(),
                ],
                |row| {
                    let date_str: String = row.get(1)?;
                    Ok(DailyAggregate {
                        monitor_id: row.get(0)?,
                        date: NaiveDate::parse_from_str(&date_str, DATE_FORMAT).unwrap_or_default(),
                        total_checks: row.get(2)?,
                        successful_checks: row.get(3)?,
                        uptime_percentage: row.get(4)?,
                        avg_response_time: row.get(5)?,
                        min_response_time: row.get(6)?,
                        max_response_time: row.get(7)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(aggregates)
    }

    /// Monitors that already have an aggregate row for `date`.
    pub fn aggregated_monitor_ids(&self, date: NaiveDate) -> Result<HashSet<i64>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT monitor_id FROM daily_aggregates WHERE date = ?1")?;
        let ids = stmt
            .query_map(params![date.format(DATE_FORMAT).to_string()], |row| row.get(0))?
            .collect::<SqlResult<HashSet<i64>>>()?;
        Ok(ids)
    }

    /// Total number of aggregate rows.
    pub fn count_daily_aggregates(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM daily_aggregates", [], |r| r.get(0))?)
    }

    /// Oldest aggregate date, if any.
    pub fn earliest_aggregate_date(&self) -> Result<Option<NaiveDate>, DbError> {
        let conn = self.conn()?;
        let result: Option<String> =
            conn.query_row("SELECT MIN(date) FROM daily_aggregates", [], |row| row.get(0))?;
        Ok(result.and_then(|s| NaiveDate::parse_from_str(&s, DATE_FORMAT).ok()))
    }

    // --- Incidents ---

    /// Record a newly opened incident and return its ID.
    pub fn open_incident(
        &self,
        monitor_id: i64,
        started_at: DateTime<Utc>,
        description: &str,
    ) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO incidents (monitor_id, started_at, description) VALUES (?1, ?2, ?3)",
            params![monitor_id, format_time(started_at), description],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Mark an incident resolved.
    pub fn resolve_incident(&self, id: i64, resolved_at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE incidents SET resolved_at = ?1 WHERE id = ?2",
            params![format_time(resolved_at), id],
        )?;
        Ok(())
    }

    /// Get an incident by ID.
    pub fn get_incident(&self, id: i64) -> Result<Option<Incident>, DbError> {
        let conn = self.conn()?;
        let incident = conn
            .query_row(
                "SELECT id, monitor_id, started_at, resolved_at, description FROM incidents WHERE id = ?1",
                params![id],
                |row| {
                    let started: String = row.get(2)?;
                    let resolved: Option<String> = row.get(3)?;
                    Ok(Incident {
                        id: row.get(0)?,
                        monitor_id: row.get(1)?,
                        started_at: parse_db_time(&started).unwrap_or_else(Utc::now),
                        resolved_at: resolved.as_deref().and_then(parse_db_time),
                        description: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(incident)
    }

    /// Delete resolved incidents whose resolution predates the cutoff.
    /// Open incidents are never touched.
    pub fn delete_resolved_incidents_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM incidents WHERE resolved_at IS NOT NULL AND resolved_at < ?1",
            params![format_time(cutoff)],
        )?;
        Ok(deleted)
    }
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.fZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
