//! Test run persistence.
//!
//! Every non-terminal status write is guarded with `status NOT IN (terminal)`
//! so an operator cancellation landing mid-phase is never overwritten.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use super::{col_opt_ts, col_parse, col_ts, now_ts, Pool};
use crate::model::{RunStatus, RunType, TestRun, Trigger};

const RUN_COLUMNS: &str = "id, run_type, status, environment_id, suite_id, triggered_by, test_filter,
     send_notifications, current_test_name, total_tests, completed_tests, process_pid,
     output_file_path, error_message, output, notification_sent_at, created_at, started_at,
     completed_at, updated_at";

const TERMINAL_SQL: &str = "('completed', 'failed', 'cancelled')";

/// Parameters for a freshly created run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub environment_id: i64,
    pub run_type: RunType,
    pub suite_id: Option<i64>,
    pub trigger: Trigger,
    pub test_filter: Option<String>,
    pub send_notifications: bool,
}

fn read_run(row: &Row<'_>) -> rusqlite::Result<TestRun> {
    Ok(TestRun {
        id: row.get(0)?,
        run_type: col_parse(row, 1)?,
        status: col_parse(row, 2)?,
        environment_id: row.get(3)?,
        suite_id: row.get(4)?,
        trigger: col_parse(row, 5)?,
        test_filter: row.get(6)?,
        send_notifications: row.get::<_, i64>(7)? != 0,
        current_test_name: row.get(8)?,
        total_tests: row.get(9)?,
        completed_tests: row.get(10)?,
        process_pid: row.get(11)?,
        output_file_path: row.get(12)?,
        error_message: row.get(13)?,
        output: row.get(14)?,
        notification_sent_at: col_opt_ts(row, 15)?,
        created_at: col_ts(row, 16)?,
        started_at: col_opt_ts(row, 17)?,
        completed_at: col_opt_ts(row, 18)?,
        updated_at: col_ts(row, 19)?,
    })
}

/// Insert a run in `pending` and return it.
pub fn create(pool: &Pool, new: &NewRun) -> Result<TestRun> {
    let conn = pool.get()?;
    let now = now_ts();
    conn.execute(
        "INSERT INTO test_runs (run_type, status, environment_id, suite_id, triggered_by,
             test_filter, send_notifications, created_at, updated_at)
         VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            new.run_type.as_str(),
            new.environment_id,
            new.suite_id,
            new.trigger.as_str(),
            new.test_filter,
            new.send_notifications as i64,
            now,
        ],
    )
    .context("Failed to insert test run")?;
    let id = conn.last_insert_rowid();
    drop(conn);

    find(pool, id)?.with_context(|| format!("test run {id} vanished after insert"))
}

pub fn find(pool: &Pool, id: i64) -> Result<Option<TestRun>> {
    let conn = pool.get()?;
    let run = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM test_runs WHERE id = ?1"),
            params![id],
            read_run,
        )
        .optional()?;
    Ok(run)
}

/// Most recent runs first.
pub fn list_recent(pool: &Pool, limit: usize) -> Result<Vec<TestRun>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM test_runs ORDER BY id DESC LIMIT ?1"
    ))?;
    let runs = stmt
        .query_map(params![limit as i64], read_run)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(runs)
}

pub fn status(pool: &Pool, id: i64) -> Result<Option<RunStatus>> {
    let conn = pool.get()?;
    let raw: Option<String> = conn
        .query_row("SELECT status FROM test_runs WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    raw.map(|s| s.parse::<RunStatus>().map_err(anyhow::Error::from))
        .transpose()
}

/// Move a live run to a non-terminal status. Returns false when the run is
/// already terminal (e.g. cancelled underneath us) or missing.
pub fn advance(pool: &Pool, id: i64, status: RunStatus) -> Result<bool> {
    debug_assert!(!status.is_terminal());
    let conn = pool.get()?;
    let changed = conn.execute(
        &format!(
            "UPDATE test_runs SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status NOT IN {TERMINAL_SQL}"
        ),
        params![status.as_str(), now_ts(), id],
    )?;
    Ok(changed > 0)
}

/// Set `running` and stamp `started_at`.
pub fn mark_execution_started(pool: &Pool, id: i64) -> Result<bool> {
    let conn = pool.get()?;
    let now = now_ts();
    let changed = conn.execute(
        &format!(
            "UPDATE test_runs SET status = 'running', started_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status NOT IN {TERMINAL_SQL}"
        ),
        params![now, id],
    )?;
    Ok(changed > 0)
}

pub fn mark_completed(pool: &Pool, id: i64) -> Result<bool> {
    finish(pool, id, RunStatus::Completed, None)
}

pub fn mark_failed(pool: &Pool, id: i64, error: &str) -> Result<bool> {
    finish(pool, id, RunStatus::Failed, Some(error))
}

pub fn mark_cancelled(pool: &Pool, id: i64) -> Result<bool> {
    finish(pool, id, RunStatus::Cancelled, None)
}

fn finish(pool: &Pool, id: i64, status: RunStatus, error: Option<&str>) -> Result<bool> {
    let conn = pool.get()?;
    let now = now_ts();
    let changed = conn.execute(
        &format!(
            "UPDATE test_runs
             SET status = ?1, completed_at = ?2, updated_at = ?2,
                 error_message = COALESCE(?3, error_message)
             WHERE id = ?4 AND status NOT IN {TERMINAL_SQL}"
        ),
        params![status.as_str(), now, error, id],
    )?;
    Ok(changed > 0)
}

/// Record the external process while EXECUTE is active.
pub fn set_process(pool: &Pool, id: i64, pid: Option<u32>, output_file: Option<&str>) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE test_runs SET process_pid = ?1, output_file_path = COALESCE(?2, output_file_path),
             updated_at = ?3
         WHERE id = ?4",
        params![pid.map(i64::from), output_file, now_ts(), id],
    )?;
    Ok(())
}

pub fn clear_process(pool: &Pool, id: i64) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE test_runs SET process_pid = NULL, updated_at = ?1 WHERE id = ?2",
        params![now_ts(), id],
    )?;
    Ok(())
}

pub fn set_progress(
    pool: &Pool,
    id: i64,
    current_test: Option<&str>,
    completed: i64,
    total: i64,
) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE test_runs SET current_test_name = ?1, completed_tests = ?2, total_tests = ?3,
             updated_at = ?4
         WHERE id = ?5",
        params![current_test, completed, total, now_ts(), id],
    )?;
    Ok(())
}

/// Append captured output, separated by a blank line.
pub fn append_output(pool: &Pool, id: i64, text: &str) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE test_runs
         SET output = CASE WHEN output IS NULL OR output = '' THEN ?1 ELSE output || char(10) || char(10) || ?1 END,
             updated_at = ?2
         WHERE id = ?3",
        params![text, now_ts(), id],
    )?;
    Ok(())
}

/// Heartbeat: bump `updated_at` so stalled runs are distinguishable.
pub fn touch(pool: &Pool, id: i64) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE test_runs SET updated_at = ?1 WHERE id = ?2",
        params![now_ts(), id],
    )?;
    Ok(())
}

/// True when the environment has a run in any non-terminal status,
/// including `pending` runs still waiting in the queue.
pub fn has_active_for_environment(pool: &Pool, environment_id: i64) -> Result<bool> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM test_runs
             WHERE environment_id = ?1 AND status NOT IN {TERMINAL_SQL}"
        ),
        params![environment_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Atomically claim the right to notify for a run. Exactly one caller ever
/// gets `true` for a given run.
pub fn claim_notification(pool: &Pool, id: i64) -> Result<bool> {
    let conn = pool.get()?;
    let changed = conn.execute(
        "UPDATE test_runs SET notification_sent_at = ?1
         WHERE id = ?2 AND notification_sent_at IS NULL",
        params![now_ts(), id],
    )?;
    Ok(changed > 0)
}
