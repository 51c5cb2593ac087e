//! Durable job registry.
//!
//! [`JobStore`] is the only place job state lives; every other component
//! reads and writes through it. Each call is atomic: read-modify-write
//! operations run inside a single SQLite transaction behind the connection
//! mutex, so a concurrent `list` never observes a half-written job.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::schedule::{next_run_after, validate};
use crate::types::{Job, JobPatch, JobState, NewJob, RunOutcome, RunRecord};

/// Persistence interface for jobs and their run history.
///
/// Mutating calls take the caller's notion of `now` so the store stays
/// deterministic; the scheduler passes wall-clock time.
pub trait JobStore: Send + Sync {
    /// Validate and insert a new job, computing its first `nextRunAt`.
    fn create(&self, new: NewJob, now: DateTime<Utc>) -> Result<Job>;

    fn get(&self, id: &str) -> Result<Job>;

    /// All jobs ordered by creation time. Rows that fail to decode are
    /// skipped with a warning.
    fn list(&self) -> Result<Vec<Job>>;

    /// Replace the fields present in `patch`. `nextRunAt` is recomputed from
    /// `now` when the schedule changes or the job becomes enabled.
    fn update(&self, id: &str, patch: JobPatch, now: DateTime<Utc>) -> Result<Job>;

    /// Enable (re-arming from `now`) or disable (clearing `nextRunAt`).
    /// Setting the current value again is a no-op.
    fn set_enabled(&self, id: &str, enabled: bool, now: DateTime<Utc>) -> Result<Job>;

    /// Remove a job and its history. Returns `false` if it did not exist.
    fn delete(&self, id: &str) -> Result<bool>;

    /// Write back a completed run. Returns `None` when the job was removed
    /// because of `deleteAfterRun`.
    fn record_run(&self, id: &str, outcome: &RunOutcome) -> Result<Option<Job>>;

    /// Recompute `nextRunAt` from `now`, dropping any missed occurrence.
    fn rearm(&self, id: &str, now: DateTime<Utc>) -> Result<Job>;

    /// Most recent runs of a job, newest first.
    fn list_runs(&self, id: &str, limit: usize) -> Result<Vec<RunRecord>>;
}

/// Default number of run records kept per job.
pub const DEFAULT_RUN_HISTORY_LIMIT: usize = 50;

const JOB_COLUMNS: &str = "id, name, enabled, schedule, payload, delete_after_run,
     next_run_at, last_run_at, last_status, last_error, last_duration_ms,
     created_at, updated_at";

/// SQLite-backed [`JobStore`].
///
/// Wraps a single connection in a `Mutex`; SQLite serialises writers anyway
/// and job traffic is light.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
    run_history_limit: usize,
}

impl SqliteJobStore {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            run_history_limit: DEFAULT_RUN_HISTORY_LIMIT,
        })
    }

    /// Open (or create) a database file in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    pub fn with_run_history_limit(mut self, limit: usize) -> Self {
        self.run_history_limit = limit.max(1);
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::Internal("job store lock poisoned".to_string()))
    }
}

impl JobStore for SqliteJobStore {
    #[instrument(skip(self, new), fields(name = %new.name))]
    fn create(&self, new: NewJob, now: DateTime<Utc>) -> Result<Job> {
        validate(&new.schedule)?;
        let payload = new.payload.normalized();
        payload.validate()?;

        let next_run_at = if new.enabled {
            next_run_after(&new.schedule, now, now)?
        } else {
            None
        };

        let job = Job {
            id: Uuid::now_v7().to_string(),
            name: new.name,
            enabled: new.enabled,
            schedule: new.schedule,
            payload,
            delete_after_run: new.delete_after_run,
            state: JobState {
                next_run_at,
                ..JobState::default()
            },
            created_at: now,
            updated_at: now,
        };

        let conn = self.conn()?;
        conn.execute(
            &format!("INSERT INTO cron_jobs ({JOB_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)"),
            rusqlite::params![
                job.id,
                job.name,
                job.enabled,
                serde_json::to_string(&job.schedule)?,
                serde_json::to_string(&job.payload)?,
                job.delete_after_run,
                job.state.next_run_at.map(|t| t.timestamp_millis()),
                None::<i64>,
                job.state.last_status.to_string(),
                None::<String>,
                None::<i64>,
                job.created_at.timestamp_millis(),
                job.updated_at.timestamp_millis(),
            ],
        )?;

        info!(job_id = %job.id, kind = job.schedule.kind(), next_run_at = ?job.state.next_run_at, "job created");
        Ok(job)
    }

    fn get(&self, id: &str) -> Result<Job> {
        let conn = self.conn()?;
        fetch(&conn, id)
    }

    fn list(&self) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM cron_jobs ORDER BY created_at, id"
        ))?;
        let mut jobs = Vec::new();
        for row in stmt.query_map([], row_to_job)? {
            match row {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(error = %e, "skipping unreadable job row"),
            }
        }
        Ok(jobs)
    }

    #[instrument(skip(self, patch))]
    fn update(&self, id: &str, patch: JobPatch, now: DateTime<Utc>) -> Result<Job> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut job = fetch(&tx, id)?;
        if patch.is_empty() {
            return Ok(job);
        }

        let mut rearm = false;
        if let Some(schedule) = patch.schedule {
            validate(&schedule)?;
            rearm |= schedule != job.schedule;
            job.schedule = schedule;
        }
        if let Some(payload) = patch.payload {
            let payload = payload.normalized();
            payload.validate()?;
            job.payload = payload;
        }
        if let Some(name) = patch.name {
            job.name = name;
        }
        if let Some(delete_after_run) = patch.delete_after_run {
            job.delete_after_run = delete_after_run;
        }
        if let Some(enabled) = patch.enabled {
            rearm |= enabled && !job.enabled;
            job.enabled = enabled;
        }

        if !job.enabled {
            job.state.next_run_at = None;
        } else if rearm {
            job.state.next_run_at = next_run_after(&job.schedule, now, now)?;
        }
        job.updated_at = job.updated_at.max(now);

        write_job(&tx, &job)?;
        tx.commit()?;
        info!(job_id = %job.id, next_run_at = ?job.state.next_run_at, "job updated");
        Ok(job)
    }

    #[instrument(skip(self))]
    fn set_enabled(&self, id: &str, enabled: bool, now: DateTime<Utc>) -> Result<Job> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut job = fetch(&tx, id)?;
        if job.enabled == enabled {
            return Ok(job);
        }

        job.enabled = enabled;
        job.state.next_run_at = if enabled {
            next_run_after(&job.schedule, now, now)?
        } else {
            None
        };
        job.updated_at = job.updated_at.max(now);

        write_job(&tx, &job)?;
        tx.commit()?;
        info!(job_id = %job.id, enabled, next_run_at = ?job.state.next_run_at, "job toggled");
        Ok(job)
    }

    #[instrument(skip(self))]
    fn delete(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = delete_rows(&tx, id)?;
        tx.commit()?;
        if removed {
            info!(job_id = %id, "job deleted");
        } else {
            debug!(job_id = %id, "delete of unknown job ignored");
        }
        Ok(removed)
    }

    #[instrument(skip(self, outcome), fields(status = outcome.status.as_str()))]
    fn record_run(&self, id: &str, outcome: &RunOutcome) -> Result<Option<Job>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut job = fetch(&tx, id)?;

        if job.delete_after_run {
            delete_rows(&tx, id)?;
            tx.commit()?;
            info!(job_id = %id, status = outcome.status.as_str(), "job removed after run");
            return Ok(None);
        }

        let now = outcome.finished_at;
        job.state.last_run_at = Some(now);
        job.state.last_status = outcome.status.into();
        job.state.last_error = outcome.error.clone();
        job.state.last_duration_ms = Some(outcome.duration_ms());
        job.state.next_run_at = if job.enabled {
            match next_run_after(&job.schedule, outcome.anchor(), now) {
                Ok(next) => next,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "could not compute next run; job left idle");
                    None
                }
            }
        } else {
            None
        };
        job.updated_at = job.updated_at.max(now);
        write_job(&tx, &job)?;

        tx.execute(
            "INSERT INTO cron_runs (job_id, trigger_kind, status, error, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                id,
                outcome.trigger.as_str(),
                outcome.status.as_str(),
                outcome.error,
                outcome.started_at.timestamp_millis(),
                outcome.finished_at.timestamp_millis(),
            ],
        )?;
        tx.execute(
            "DELETE FROM cron_runs WHERE job_id = ?1 AND id NOT IN
               (SELECT id FROM cron_runs WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2)",
            rusqlite::params![id, self.run_history_limit as i64],
        )?;
        tx.commit()?;

        debug!(job_id = %id, next_run_at = ?job.state.next_run_at, "run recorded");
        Ok(Some(job))
    }

    #[instrument(skip(self))]
    fn rearm(&self, id: &str, now: DateTime<Utc>) -> Result<Job> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut job = fetch(&tx, id)?;
        job.state.next_run_at = if job.enabled {
            next_run_after(&job.schedule, now, now)?
        } else {
            None
        };
        job.updated_at = job.updated_at.max(now);
        write_job(&tx, &job)?;
        tx.commit()?;
        Ok(job)
    }

    fn list_runs(&self, id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        fetch(&conn, id)?;
        let mut stmt = conn.prepare(
            "SELECT job_id, trigger_kind, status, error, started_at, finished_at
             FROM cron_runs WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(rusqlite::params![id, limit as i64], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }
}

// --- private helpers -------------------------------------------------------

fn fetch(conn: &Connection, id: &str) -> Result<Job> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM cron_jobs WHERE id = ?1"),
        [id],
        row_to_job,
    )
    .optional()?
    .ok_or_else(|| SchedulerError::not_found(id))
}

fn write_job(conn: &Connection, job: &Job) -> Result<()> {
    conn.execute(
        "UPDATE cron_jobs SET
            name = ?2, enabled = ?3, schedule = ?4, payload = ?5, delete_after_run = ?6,
            next_run_at = ?7, last_run_at = ?8, last_status = ?9, last_error = ?10,
            last_duration_ms = ?11, updated_at = ?12
         WHERE id = ?1",
        rusqlite::params![
            job.id,
            job.name,
            job.enabled,
            serde_json::to_string(&job.schedule)?,
            serde_json::to_string(&job.payload)?,
            job.delete_after_run,
            job.state.next_run_at.map(|t| t.timestamp_millis()),
            job.state.last_run_at.map(|t| t.timestamp_millis()),
            job.state.last_status.to_string(),
            job.state.last_error,
            job.state.last_duration_ms.map(|ms| ms as i64),
            job.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn delete_rows(conn: &Connection, id: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM cron_jobs WHERE id = ?1", [id])?;
    conn.execute("DELETE FROM cron_runs WHERE job_id = ?1", [id])?;
    Ok(n > 0)
}

fn millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn opt_millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(ms) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms)),
        None => Ok(None),
    }
}

fn json_at<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parsed_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        enabled: row.get(2)?,
        schedule: json_at(row, 3)?,
        payload: json_at(row, 4)?,
        delete_after_run: row.get(5)?,
        state: JobState {
            next_run_at: opt_millis_at(row, 6)?,
            last_run_at: opt_millis_at(row, 7)?,
            last_status: parsed_at(row, 8)?,
            last_error: row.get(9)?,
            last_duration_ms: row.get::<_, Option<i64>>(10)?.map(|ms| ms.max(0) as u64),
        },
        created_at: millis_at(row, 11)?,
        updated_at: millis_at(row, 12)?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        job_id: row.get(0)?,
        trigger: row.get(1)?,
        status: parsed_at(row, 2)?,
        error: row.get(3)?,
        started_at: millis_at(row, 4)?,
        finished_at: millis_at(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LastStatus, Payload, RunStatus, Schedule, Trigger};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn store() -> SqliteJobStore {
        SqliteJobStore::open_in_memory().unwrap()
    }

    fn hourly(name: &str) -> NewJob {
        NewJob::new(name, Schedule::Every { every_ms: 3_600_000 }, Payload::message("ping"))
    }

    fn outcome(trigger: Trigger, status: RunStatus, at: DateTime<Utc>) -> RunOutcome {
        RunOutcome {
            trigger,
            status,
            error: (status == RunStatus::Error).then(|| "boom".to_string()),
            started_at: at,
            finished_at: at + Duration::seconds(2),
        }
    }

    #[test]
    fn create_every_arms_one_interval_out() {
        let store = store();
        let job = store.create(hourly("digest"), t0()).unwrap();
        assert!(job.enabled);
        assert_eq!(job.state.next_run_at, Some(t0() + Duration::hours(1)));
        assert_eq!(job.state.last_status, LastStatus::None);
        assert_eq!(job.created_at, job.updated_at);
        assert_eq!(store.get(&job.id).unwrap(), job);
    }

    #[test]
    fn create_cron_computes_next_midnight() {
        let store = store();
        let job = store
            .create(
                NewJob::new(
                    "nightly",
                    Schedule::Cron { expr: "0 0 * * *".to_string(), tz: Some("UTC".to_string()) },
                    Payload::message("report"),
                ),
                t0(),
            )
            .unwrap();
        assert_eq!(
            job.state.next_run_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn past_at_job_is_created_idle() {
        let store = store();
        let job = store
            .create(
                NewJob::new(
                    "late",
                    Schedule::At { at: t0() - Duration::seconds(1) },
                    Payload::message("too late"),
                ),
                t0(),
            )
            .unwrap();
        assert!(job.enabled);
        assert_eq!(job.state.next_run_at, None);
        assert!(job.is_spent());
    }

    #[test]
    fn disabled_create_has_no_next_run() {
        let store = store();
        let job = store.create(hourly("off").enabled(false), t0()).unwrap();
        assert_eq!(job.state.next_run_at, None);
    }

    #[test]
    fn create_rejects_bad_input() {
        let store = store();
        let err = store
            .create(NewJob::new("x", Schedule::Every { every_ms: 3_600_000 }, Payload::message(" ")), t0())
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PAYLOAD");

        let err = store
            .create(
                NewJob::new("x", Schedule::Cron { expr: "nope".to_string(), tz: None }, Payload::message("hi")),
                t0(),
            )
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEDULE");
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn list_is_ordered_by_creation() {
        let store = store();
        let a = store.create(hourly("a"), t0()).unwrap();
        let b = store.create(hourly("b"), t0() + Duration::seconds(1)).unwrap();
        let ids: Vec<_> = store.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[test]
    fn list_skips_unreadable_rows() {
        let store = store();
        let good = store.create(hourly("good"), t0()).unwrap();
        let bad = store.create(hourly("bad"), t0()).unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "UPDATE cron_jobs SET schedule = 'not json' WHERE id = ?1",
                [&bad.id],
            )
            .unwrap();

        let jobs = store.list().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, good.id);
        assert!(store.get(&bad.id).is_err());
    }

    #[test]
    fn disable_clears_and_enable_rearms() {
        let store = store();
        let job = store.create(hourly("toggle"), t0()).unwrap();

        let off = store.set_enabled(&job.id, false, t0() + Duration::minutes(5)).unwrap();
        assert!(!off.enabled);
        assert_eq!(off.state.next_run_at, None);

        let enable_at = t0() + Duration::minutes(10);
        let on = store.set_enabled(&job.id, true, enable_at).unwrap();
        assert!(on.state.next_run_at.unwrap() > enable_at);
        assert_eq!(on.state.next_run_at, Some(enable_at + Duration::hours(1)));
    }

    #[test]
    fn set_enabled_is_idempotent() {
        let store = store();
        let job = store.create(hourly("same"), t0()).unwrap();
        let again = store.set_enabled(&job.id, true, t0() + Duration::minutes(30)).unwrap();
        assert_eq!(again, job);
    }

    #[test]
    fn update_switching_kind_recomputes_immediately() {
        let store = store();
        let job = store.create(hourly("switch"), t0()).unwrap();
        let edit_at = t0() + Duration::minutes(1);
        let updated = store
            .update(
                &job.id,
                JobPatch {
                    schedule: Some(Schedule::Cron { expr: "30 12 * * *".to_string(), tz: None }),
                    ..JobPatch::default()
                },
                edit_at,
            )
            .unwrap();
        assert_eq!(updated.state.next_run_at, Some(t0() + Duration::minutes(30)));
        assert_eq!(updated.updated_at, edit_at);
        assert_eq!(updated.created_at, job.created_at);
    }

    #[test]
    fn update_without_schedule_change_keeps_next_run() {
        let store = store();
        let job = store.create(hourly("rename"), t0()).unwrap();
        let updated = store
            .update(
                &job.id,
                JobPatch { name: Some("renamed".to_string()), ..JobPatch::default() },
                t0() + Duration::minutes(20),
            )
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.state.next_run_at, job.state.next_run_at);
    }

    #[test]
    fn invalid_update_leaves_job_untouched() {
        let store = store();
        let job = store.create(hourly("keep"), t0()).unwrap();
        let err = store
            .update(
                &job.id,
                JobPatch {
                    name: Some("changed".to_string()),
                    payload: Some(Payload::message("")),
                    ..JobPatch::default()
                },
                t0() + Duration::minutes(1),
            )
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(store.get(&job.id).unwrap(), job);
    }

    #[test]
    fn updated_at_never_goes_backwards() {
        let store = store();
        let job = store.create(hourly("clock"), t0()).unwrap();
        let updated = store
            .update(
                &job.id,
                JobPatch { name: Some("skewed".to_string()), ..JobPatch::default() },
                t0() - Duration::minutes(5),
            )
            .unwrap();
        assert_eq!(updated.updated_at, t0());
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let store = store();
        assert_eq!(store.get("missing").unwrap_err().code(), "NOT_FOUND");
        assert_eq!(store.set_enabled("missing", true, t0()).unwrap_err().code(), "NOT_FOUND");
        assert_eq!(
            store.update("missing", JobPatch::default(), t0()).unwrap_err().code(),
            "NOT_FOUND"
        );
        let late = outcome(Trigger::Manual, RunStatus::Ok, t0());
        assert_eq!(store.record_run("missing", &late).unwrap_err().code(), "NOT_FOUND");
    }

    #[test]
    fn delete_is_idempotent() {
        let store = store();
        let job = store.create(hourly("gone"), t0()).unwrap();
        assert!(store.delete(&job.id).unwrap());
        assert!(!store.delete(&job.id).unwrap());
        assert!(!store.delete("never-existed").unwrap());
    }

    #[test]
    fn record_run_advances_from_intended_time() {
        let store = store();
        let job = store.create(hourly("steady"), t0()).unwrap();
        let mut previous = job.state.next_run_at.unwrap();

        for _ in 0..3 {
            // each run finishes 2s after it was due
            let ran = store
                .record_run(&job.id, &outcome(Trigger::Scheduled { due_at: previous }, RunStatus::Ok, previous))
                .unwrap()
                .unwrap();
            let next = ran.state.next_run_at.unwrap();
            assert_eq!(next, previous + Duration::hours(1));
            assert_eq!(ran.state.last_run_at, Some(previous + Duration::seconds(2)));
            assert_eq!(ran.state.last_status, LastStatus::Ok);
            previous = next;
        }
    }

    #[test]
    fn failed_run_records_error_and_reschedules() {
        let store = store();
        let job = store.create(hourly("flaky"), t0()).unwrap();
        let due = job.state.next_run_at.unwrap();
        let ran = store
            .record_run(&job.id, &outcome(Trigger::Scheduled { due_at: due }, RunStatus::Error, due))
            .unwrap()
            .unwrap();
        assert!(ran.enabled);
        assert_eq!(ran.state.last_status, LastStatus::Error);
        assert_eq!(ran.state.last_error.as_deref(), Some("boom"));
        assert_eq!(ran.state.last_duration_ms, Some(2_000));
        assert_eq!(ran.state.next_run_at, Some(due + Duration::hours(1)));

        // a later success clears the error
        let due = ran.state.next_run_at.unwrap();
        let ran = store
            .record_run(&job.id, &outcome(Trigger::Scheduled { due_at: due }, RunStatus::Ok, due))
            .unwrap()
            .unwrap();
        assert_eq!(ran.state.last_error, None);
    }

    #[test]
    fn delete_after_run_removes_job_on_any_outcome() {
        let store = store();
        for status in [RunStatus::Ok, RunStatus::Error] {
            let job = store.create(hourly("once").delete_after_run(true), t0()).unwrap();
            let due = job.state.next_run_at.unwrap();
            let result = store
                .record_run(&job.id, &outcome(Trigger::Scheduled { due_at: due }, status, due))
                .unwrap();
            assert!(result.is_none());
            assert_eq!(store.get(&job.id).unwrap_err().code(), "NOT_FOUND");
        }
    }

    #[test]
    fn at_job_is_spent_after_its_run() {
        let store = store();
        let at = t0() + Duration::minutes(5);
        let job = store
            .create(NewJob::new("once", Schedule::At { at }, Payload::message("hi")), t0())
            .unwrap();
        assert_eq!(job.state.next_run_at, Some(at));
        let ran = store
            .record_run(&job.id, &outcome(Trigger::Scheduled { due_at: at }, RunStatus::Ok, at))
            .unwrap()
            .unwrap();
        assert!(ran.enabled);
        assert!(ran.is_spent());
    }

    #[test]
    fn manual_run_nudges_interval_forward() {
        let store = store();
        let job = store.create(hourly("test-me"), t0()).unwrap();
        let test_at = t0() + Duration::minutes(10);
        let ran = store
            .record_run(&job.id, &outcome(Trigger::Manual, RunStatus::Ok, test_at))
            .unwrap()
            .unwrap();
        assert_eq!(ran.state.next_run_at, Some(test_at + Duration::hours(1)));
    }

    #[test]
    fn run_on_disabled_job_stays_unarmed() {
        let store = store();
        let job = store.create(hourly("paused"), t0()).unwrap();
        let due = job.state.next_run_at.unwrap();
        store.set_enabled(&job.id, false, t0() + Duration::minutes(1)).unwrap();
        let ran = store
            .record_run(&job.id, &outcome(Trigger::Scheduled { due_at: due }, RunStatus::Ok, due))
            .unwrap()
            .unwrap();
        assert_eq!(ran.state.next_run_at, None);
        assert_eq!(ran.state.last_status, LastStatus::Ok);
    }

    #[test]
    fn rearm_drops_missed_occurrences() {
        let store = store();
        let job = store.create(hourly("missed"), t0()).unwrap();
        let restart = t0() + Duration::hours(5) + Duration::minutes(3);
        let rearmed = store.rearm(&job.id, restart).unwrap();
        assert_eq!(rearmed.state.next_run_at, Some(restart + Duration::hours(1)));
    }

    #[test]
    fn run_history_is_pruned_newest_first() {
        let store = store().with_run_history_limit(3);
        let job = store.create(hourly("history"), t0()).unwrap();
        for i in 0..5 {
            let at = t0() + Duration::minutes(i);
            store
                .record_run(&job.id, &outcome(Trigger::Manual, RunStatus::Ok, at))
                .unwrap();
        }
        let runs = store.list_runs(&job.id, 10).unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].started_at, t0() + Duration::minutes(4));
        assert_eq!(runs[2].started_at, t0() + Duration::minutes(2));
        assert_eq!(runs[0].trigger, "manual");

        assert_eq!(store.list_runs(&job.id, 1).unwrap().len(), 1);
        assert_eq!(store.list_runs("missing", 10).unwrap_err().code(), "NOT_FOUND");
    }

    #[test]
    fn reopened_file_keeps_jobs() {
        let dir = std::env::temp_dir().join(format!("cadence-store-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("jobs.db");

        let id = {
            let store = SqliteJobStore::open(&path).unwrap();
            store.create(hourly("durable"), t0()).unwrap().id
        };
        let store = SqliteJobStore::open(&path).unwrap();
        let job = store.get(&id).unwrap();
        assert_eq!(job.name, "durable");
        assert_eq!(job.state.next_run_at, Some(t0() + Duration::hours(1)));

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
