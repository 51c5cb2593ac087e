use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `cron_jobs` and `cron_runs` tables (idempotent). Instants are
/// stored as epoch milliseconds so ordering and range queries stay numeric.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cron_jobs (
            id                TEXT    NOT NULL PRIMARY KEY,
            name              TEXT    NOT NULL,
            enabled           INTEGER NOT NULL DEFAULT 1,
            schedule          TEXT    NOT NULL,   -- JSON-encoded Schedule enum
            payload           TEXT    NOT NULL,   -- JSON-encoded Payload
            delete_after_run  INTEGER NOT NULL DEFAULT 0,
            next_run_at       INTEGER,            -- epoch ms or NULL
            last_run_at       INTEGER,
            last_status       TEXT    NOT NULL DEFAULT 'none',
            last_error        TEXT,
            last_duration_ms  INTEGER,
            created_at        INTEGER NOT NULL,
            updated_at        INTEGER NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_cron_jobs_next_run ON cron_jobs (next_run_at);

        CREATE TABLE IF NOT EXISTS cron_runs (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id       TEXT    NOT NULL,
            trigger_kind TEXT    NOT NULL,      -- 'scheduled' | 'manual'
            status       TEXT    NOT NULL,      -- 'ok' | 'error'
            error        TEXT,
            started_at   INTEGER NOT NULL,
            finished_at  INTEGER NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_cron_runs_job ON cron_runs (job_id, id);
        ",
    )?;
    Ok(())
}
