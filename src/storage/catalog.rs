//! Environments, suites, cron jobs and notification subscribers.
//!
//! The orchestration core only reads these; the insert helpers back the
//! import command and tests.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::Deserialize;

use super::{col_opt_ts, col_parse, now_ts, Pool};
use crate::model::{CronJob, CronStatus, NotificationTrigger, Subscriber, TestEnvironment, TestSuite};

// ---------------------------------------------------------------------------
// Environments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct NewEnvironment {
    pub name: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl NewEnvironment {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            code: name.to_string(),
            region: String::new(),
            base_url: format!("https://{name}.example.test"),
            active: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn read_environment(row: &Row<'_>) -> rusqlite::Result<TestEnvironment> {
    Ok(TestEnvironment {
        id: row.get(0)?,
        name: row.get(1)?,
        code: row.get(2)?,
        region: row.get(3)?,
        base_url: row.get(4)?,
        active: row.get::<_, i64>(5)? != 0,
    })
}

pub fn insert_environment(pool: &Pool, env: &NewEnvironment) -> Result<TestEnvironment> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO test_environments (name, code, region, base_url, active)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(name) DO UPDATE SET code = ?2, region = ?3, base_url = ?4, active = ?5",
        params![env.name, env.code, env.region, env.base_url, env.active],
    )
    .with_context(|| format!("Failed to upsert environment '{}'", env.name))?;
    drop(conn);
    find_environment_by_name(pool, &env.name)?
        .with_context(|| format!("environment '{}' vanished after insert", env.name))
}

pub fn find_environment(pool: &Pool, id: i64) -> Result<Option<TestEnvironment>> {
    let conn = pool.get()?;
    let env = conn
        .query_row(
            "SELECT id, name, code, region, base_url, active FROM test_environments WHERE id = ?1",
            params![id],
            read_environment,
        )
        .optional()?;
    Ok(env)
}

pub fn find_environment_by_name(pool: &Pool, name: &str) -> Result<Option<TestEnvironment>> {
    let conn = pool.get()?;
    let env = conn
        .query_row(
            "SELECT id, name, code, region, base_url, active FROM test_environments WHERE name = ?1",
            params![name],
            read_environment,
        )
        .optional()?;
    Ok(env)
}

pub fn list_environments(pool: &Pool) -> Result<Vec<TestEnvironment>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, name, code, region, base_url, active FROM test_environments ORDER BY id",
    )?;
    let envs = stmt
        .query_map([], read_environment)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(envs)
}

pub fn set_environment_active(pool: &Pool, id: i64, active: bool) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE test_environments SET active = ?1 WHERE id = ?2",
        params![active, id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Suites
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct NewSuite {
    pub name: String,
    pub suite_type: String,
    #[serde(default)]
    pub test_pattern: Option<String>,
    #[serde(default)]
    pub excluded_tests: Option<String>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Environment names the suite fans out to.
    #[serde(default)]
    pub environments: Vec<String>,
}

pub fn insert_suite(pool: &Pool, suite: &NewSuite) -> Result<TestSuite> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO test_suites (name, suite_type, test_pattern, excluded_tests, cron_expression, active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(name) DO UPDATE SET suite_type = ?2, test_pattern = ?3, excluded_tests = ?4,
             cron_expression = ?5, active = ?6",
        params![
            suite.name,
            suite.suite_type,
            suite.test_pattern,
            suite.excluded_tests,
            suite.cron_expression,
            suite.active,
        ],
    )
    .with_context(|| format!("Failed to upsert suite '{}'", suite.name))?;
    let suite_id: i64 = tx.query_row(
        "SELECT id FROM test_suites WHERE name = ?1",
        params![suite.name],
        |row| row.get(0),
    )?;

    tx.execute(
        "DELETE FROM test_suite_environments WHERE suite_id = ?1",
        params![suite_id],
    )?;
    for env_name in &suite.environments {
        let changed = tx.execute(
            "INSERT INTO test_suite_environments (suite_id, environment_id)
             SELECT ?1, id FROM test_environments WHERE name = ?2",
            params![suite_id, env_name],
        )?;
        if changed == 0 {
            anyhow::bail!("suite '{}' references unknown environment '{}'", suite.name, env_name);
        }
    }
    tx.commit()?;
    drop(conn);

    find_suite(pool, suite_id)?.with_context(|| format!("suite {suite_id} vanished after insert"))
}

pub fn find_suite(pool: &Pool, id: i64) -> Result<Option<TestSuite>> {
    let conn = pool.get()?;
    let suite = conn
        .query_row(
            "SELECT id, name, suite_type, test_pattern, excluded_tests, cron_expression, active
             FROM test_suites WHERE id = ?1",
            params![id],
            |row| {
                Ok(TestSuite {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    suite_type: row.get(2)?,
                    test_pattern: row.get(3)?,
                    excluded_tests: row.get(4)?,
                    cron_expression: row.get(5)?,
                    active: row.get::<_, i64>(6)? != 0,
                    environment_ids: Vec::new(),
                })
            },
        )
        .optional()?;

    let Some(mut suite) = suite else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT environment_id FROM test_suite_environments WHERE suite_id = ?1 ORDER BY environment_id",
    )?;
    suite.environment_ids = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(Some(suite))
}

/// Active environments assigned to a suite.
pub fn active_suite_environments(pool: &Pool, suite_id: i64) -> Result<Vec<TestEnvironment>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT e.id, e.name, e.code, e.region, e.base_url, e.active
         FROM test_environments e
         JOIN test_suite_environments se ON se.environment_id = e.id
         WHERE se.suite_id = ?1 AND e.active = 1
         ORDER BY e.id",
    )?;
    let envs = stmt
        .query_map(params![suite_id], read_environment)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(envs)
}

/// Active suites carrying a cron expression: `(id, name, cron_expression)`.
pub fn scheduled_suites(pool: &Pool) -> Result<Vec<(i64, String, String)>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, name, cron_expression FROM test_suites
         WHERE active = 1 AND cron_expression IS NOT NULL AND cron_expression != ''
         ORDER BY id",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Cron jobs
// ---------------------------------------------------------------------------

const CRON_COLUMNS: &str =
    "id, name, command, cron_expression, active, last_run_at, last_status, last_output";

fn read_cron_job(row: &Row<'_>) -> rusqlite::Result<CronJob> {
    let last_status: Option<String> = row.get(6)?;
    Ok(CronJob {
        id: row.get(0)?,
        name: row.get(1)?,
        command: row.get(2)?,
        cron_expression: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        last_run_at: col_opt_ts(row, 5)?,
        last_status: match last_status {
            Some(_) => Some(col_parse(row, 6)?),
            None => None,
        },
        last_output: row.get(7)?,
    })
}

pub fn insert_cron_job(pool: &Pool, name: &str, command: &str, cron_expression: &str) -> Result<CronJob> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO cron_jobs (name, command, cron_expression, active) VALUES (?1, ?2, ?3, 1)",
        params![name, command, cron_expression],
    )
    .context("Failed to insert cron job")?;
    let id = conn.last_insert_rowid();
    drop(conn);
    find_cron_job(pool, id)?.with_context(|| format!("cron job {id} vanished after insert"))
}

pub fn find_cron_job(pool: &Pool, id: i64) -> Result<Option<CronJob>> {
    let conn = pool.get()?;
    let job = conn
        .query_row(
            &format!("SELECT {CRON_COLUMNS} FROM cron_jobs WHERE id = ?1"),
            params![id],
            read_cron_job,
        )
        .optional()?;
    Ok(job)
}

pub fn find_cron_job_by_name(pool: &Pool, name: &str) -> Result<Option<CronJob>> {
    let conn = pool.get()?;
    let job = conn
        .query_row(
            &format!("SELECT {CRON_COLUMNS} FROM cron_jobs WHERE name = ?1"),
            params![name],
            read_cron_job,
        )
        .optional()?;
    Ok(job)
}

pub fn list_cron_jobs(pool: &Pool) -> Result<Vec<CronJob>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!("SELECT {CRON_COLUMNS} FROM cron_jobs ORDER BY id"))?;
    let jobs = stmt
        .query_map([], read_cron_job)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(jobs)
}

pub fn remove_cron_job(pool: &Pool, name: &str) -> Result<()> {
    let conn = pool.get()?;
    let changed = conn.execute("DELETE FROM cron_jobs WHERE name = ?1", params![name])?;
    if changed == 0 {
        anyhow::bail!("Cron job '{}' not found", name);
    }
    Ok(())
}

pub fn set_cron_job_active(pool: &Pool, id: i64, active: bool) -> Result<()> {
    let conn = pool.get()?;
    conn.execute("UPDATE cron_jobs SET active = ?1 WHERE id = ?2", params![active, id])?;
    Ok(())
}

/// Mark a job as started: `running` + `last_run_at = now`.
pub fn mark_cron_started(pool: &Pool, id: i64) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE cron_jobs SET last_status = 'running', last_run_at = ?1 WHERE id = ?2",
        params![now_ts(), id],
    )?;
    Ok(())
}

pub fn set_cron_status(pool: &Pool, id: i64, status: CronStatus, output: Option<&str>) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE cron_jobs SET last_status = ?1, last_output = COALESCE(?2, last_output) WHERE id = ?3",
        params![status.as_str(), output, id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Users / subscribers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub email: String,
    #[serde(default)]
    pub notifications_enabled: bool,
    #[serde(default = "default_trigger")]
    pub notification_trigger: NotificationTrigger,
    #[serde(default = "default_true")]
    pub notify_by_email: bool,
    #[serde(default = "default_true")]
    pub notify_by_slack: bool,
    /// Environment names the user subscribes to.
    #[serde(default)]
    pub environments: Vec<String>,
}

fn default_trigger() -> NotificationTrigger {
    NotificationTrigger::Failures
}

pub fn insert_user(pool: &Pool, user: &NewUser) -> Result<i64> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO users (email, notifications_enabled, notification_trigger, notify_by_email, notify_by_slack)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(email) DO UPDATE SET notifications_enabled = ?2, notification_trigger = ?3,
             notify_by_email = ?4, notify_by_slack = ?5",
        params![
            user.email,
            user.notifications_enabled,
            user.notification_trigger.as_str(),
            user.notify_by_email,
            user.notify_by_slack,
        ],
    )
    .with_context(|| format!("Failed to upsert user '{}'", user.email))?;
    let user_id: i64 = tx.query_row(
        "SELECT id FROM users WHERE email = ?1",
        params![user.email],
        |row| row.get(0),
    )?;

    tx.execute(
        "DELETE FROM user_notification_environments WHERE user_id = ?1",
        params![user_id],
    )?;
    for env_name in &user.environments {
        let changed = tx.execute(
            "INSERT INTO user_notification_environments (user_id, environment_id)
             SELECT ?1, id FROM test_environments WHERE name = ?2",
            params![user_id, env_name],
        )?;
        if changed == 0 {
            anyhow::bail!("user '{}' subscribes to unknown environment '{}'", user.email, env_name);
        }
    }
    tx.commit()?;
    Ok(user_id)
}

/// Users with notifications enabled who subscribe to the environment.
pub fn subscribers_for_environment(pool: &Pool, environment_id: i64) -> Result<Vec<Subscriber>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT u.id, u.email, u.notification_trigger, u.notify_by_email, u.notify_by_slack
         FROM users u
         JOIN user_notification_environments une ON une.user_id = u.id
         WHERE une.environment_id = ?1 AND u.notifications_enabled = 1
         ORDER BY u.id",
    )?;
    let subscribers = stmt
        .query_map(params![environment_id], |row| {
            Ok(Subscriber {
                user_id: row.get(0)?,
                email: row.get(1)?,
                trigger: col_parse(row, 2)?,
                notify_by_email: row.get::<_, i64>(3)? != 0,
                notify_by_slack: row.get::<_, i64>(4)? != 0,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(subscribers)
}
