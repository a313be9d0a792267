//! Operator actions shared by the CLI and the HTTP API.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::lease::{env_processing_key, LeaseError};
use crate::model::{RunStatus, RunType, TestRun, Trigger};
use crate::notify::{self, DispatchReport, Notifier};
use crate::pipeline::enqueue_prepare;
use crate::queue::{Message, QueueError, QueueStats, Transport};
use crate::scheduler::parse_schedule;
use crate::storage::catalog::{self, NewEnvironment, NewSuite, NewUser};
use crate::storage::runs::{self, NewRun};
use crate::storage::Pool;

#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{0}")]
    InvalidState(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error("{0:#}")]
    Store(#[from] anyhow::Error),
}

fn not_found(kind: &'static str, id: impl ToString) -> OpsError {
    OpsError::NotFound {
        kind,
        id: id.to_string(),
    }
}

/// Manual "start run" request.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRun {
    pub environment_id: i64,
    #[serde(default)]
    pub suite_id: Option<i64>,
    /// Defaults to the suite's framework, or both.
    #[serde(default)]
    pub run_type: Option<RunType>,
    #[serde(default)]
    pub test_filter: Option<String>,
    #[serde(default = "default_true")]
    pub send_notifications: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone)]
pub struct Ops {
    pool: Pool,
    transport: Transport,
}

impl Ops {
    pub fn new(pool: Pool, transport: Transport) -> Self {
        Self { pool, transport }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn get_run(&self, id: i64) -> Result<TestRun, OpsError> {
        runs::find(&self.pool, id)?.ok_or_else(|| not_found("run", id))
    }

    /// Create a manual run and enqueue its PREPARE.
    pub fn start_run(&self, req: &StartRun) -> Result<TestRun, OpsError> {
        let env = catalog::find_environment(&self.pool, req.environment_id)?
            .ok_or_else(|| not_found("environment", req.environment_id))?;
        if !env.active {
            return Err(OpsError::InvalidState(format!(
                "environment '{}' is inactive",
                env.name
            )));
        }

        let suite = match req.suite_id {
            Some(id) => Some(catalog::find_suite(&self.pool, id)?.ok_or_else(|| not_found("suite", id))?),
            None => None,
        };
        let run_type = req
            .run_type
            .or_else(|| suite.as_ref().map(|s| RunType::from_suite_type(&s.suite_type)))
            .unwrap_or(RunType::Both);

        let run = runs::create(
            &self.pool,
            &NewRun {
                environment_id: env.id,
                run_type,
                suite_id: req.suite_id,
                trigger: Trigger::Manual,
                test_filter: req.test_filter.clone(),
                send_notifications: req.send_notifications,
            },
        )?;
        enqueue_prepare(&self.transport, &run)?;
        info!(run_id = run.id, env_id = env.id, run_type = %run_type, "manual run started");
        Ok(run)
    }

    /// Mark a live run cancelled. The pipeline notices at its next phase.
    pub fn cancel_run(&self, id: i64) -> Result<TestRun, OpsError> {
        let run = self.get_run(id)?;
        if run.status.is_terminal() || !runs::mark_cancelled(&self.pool, id)? {
            return Err(OpsError::InvalidState(format!(
                "run {id} is already {} and cannot be cancelled",
                run.status
            )));
        }
        info!(run_id = id, "run cancelled");
        self.get_run(id)
    }

    /// Clone a failed or cancelled run into a new one.
    pub fn retry_run(&self, id: i64) -> Result<TestRun, OpsError> {
        let old = self.get_run(id)?;
        if !matches!(old.status, RunStatus::Failed | RunStatus::Cancelled) {
            return Err(OpsError::InvalidState(format!(
                "only failed or cancelled runs can be retried (run {id} is {})",
                old.status
            )));
        }

        let run = runs::create(
            &self.pool,
            &NewRun {
                environment_id: old.environment_id,
                run_type: old.run_type,
                suite_id: old.suite_id,
                trigger: Trigger::Manual,
                test_filter: old.test_filter.clone(),
                send_notifications: old.send_notifications,
            },
        )?;
        enqueue_prepare(&self.transport, &run)?;
        info!(run_id = run.id, retry_of = id, "run retried");
        Ok(run)
    }

    /// Enqueue an out-of-schedule cron job invocation.
    pub fn run_cron_now(&self, job_id: i64) -> Result<i64, OpsError> {
        let job = catalog::find_cron_job(&self.pool, job_id)?
            .ok_or_else(|| not_found("cron job", job_id))?;
        let message_id = self.transport.dispatch(&Message::CronJob { cron_job_id: job.id })?;
        info!(job_id, name = %job.name, message_id, "cron job enqueued");
        Ok(message_id)
    }

    /// Send a finished run's notifications again, ignoring the sent marker.
    pub async fn resend_notification(
        &self,
        notifier: &dyn Notifier,
        base_url: &str,
        run_id: i64,
        force_slack: bool,
    ) -> Result<DispatchReport, OpsError> {
        let run = self.get_run(run_id)?;
        if !run.status.is_terminal() {
            return Err(OpsError::InvalidState(format!(
                "run {run_id} is still {}",
                run.status
            )));
        }
        let report = notify::notify_run(&self.pool, notifier, &run, base_url, force_slack).await?;
        // Mark as sent if it never was.
        runs::claim_notification(&self.pool, run_id)?;
        Ok(report)
    }

    /// Force-release environment partition leases. Returns the keys that
    /// were (or, for a dry run, would be) released.
    pub fn clear_env_locks(&self, environment_id: Option<i64>, dry_run: bool) -> Result<Vec<String>, OpsError> {
        let leases = self.transport.leases();
        let keys = match environment_id {
            Some(env) => {
                let key = env_processing_key(self.transport.prefix(), env);
                if leases.is_held(&key)? {
                    vec![key]
                } else {
                    Vec::new()
                }
            }
            None => leases.held_keys(&format!("{}_env_processing_", self.transport.prefix()))?,
        };

        if !dry_run {
            for key in &keys {
                leases.force_release(key)?;
                warn!(key = %key, "environment lock force-released");
            }
        }
        Ok(keys)
    }

    pub fn queue_stats(&self) -> Result<Vec<QueueStats>, OpsError> {
        Ok(self.transport.stats()?)
    }
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ImportFile {
    #[serde(default)]
    environments: Vec<NewEnvironment>,
    #[serde(default)]
    suites: Vec<NewSuite>,
    #[serde(default)]
    users: Vec<NewUser>,
    #[serde(default)]
    cron_jobs: Vec<ImportCronJob>,
}

#[derive(Debug, Deserialize)]
struct ImportCronJob {
    name: String,
    command: String,
    cron_expression: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ImportSummary {
    pub environments: usize,
    pub suites: usize,
    pub users: usize,
    pub cron_jobs: usize,
}

/// Load environments, suites, users and cron jobs from a TOML file.
/// Environments, suites and users are upserted by name; existing cron jobs
/// are left alone.
pub fn import(pool: &Pool, path: &Path) -> anyhow::Result<ImportSummary> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read import file: {}", path.display()))?;
    let file: ImportFile = toml::from_str(&content)
        .with_context(|| format!("failed to parse import file: {}", path.display()))?;

    let mut summary = ImportSummary::default();
    for env in &file.environments {
        catalog::insert_environment(pool, env)?;
        summary.environments += 1;
    }
    for suite in &file.suites {
        if let Some(expr) = &suite.cron_expression {
            parse_schedule(expr).with_context(|| format!("suite '{}'", suite.name))?;
        }
        catalog::insert_suite(pool, suite)?;
        summary.suites += 1;
    }
    for user in &file.users {
        catalog::insert_user(pool, user)?;
        summary.users += 1;
    }
    for job in &file.cron_jobs {
        parse_schedule(&job.cron_expression).with_context(|| format!("cron job '{}'", job.name))?;
        if catalog::find_cron_job_by_name(pool, &job.name)?.is_some() {
            continue;
        }
        catalog::insert_cron_job(pool, &job.name, &job.command, &job.cron_expression)?;
        summary.cron_jobs += 1;
    }
    info!(?summary, path = %path.display(), "import finished");
    Ok(summary)
}
