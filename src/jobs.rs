//! Cron job executor: run one operator-defined command under a job lease.

use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::RunnerConfig;
use crate::lease::{job_key, LeaseManager};
use crate::model::CronStatus;
use crate::storage::{catalog, Pool};

/// What happened to one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Job missing or inactive.
    Skipped,
    /// Another invocation holds the job lease.
    Locked,
    Succeeded,
    Failed,
}

#[derive(Clone)]
pub struct CronExecutor {
    pool: Pool,
    leases: LeaseManager,
    prefix: String,
    lease_ttl: Duration,
    shell: String,
}

impl CronExecutor {
    pub fn new(pool: Pool, config: &RunnerConfig) -> Self {
        Self {
            leases: LeaseManager::new(pool.clone()),
            pool,
            prefix: config.queue.prefix.clone(),
            lease_ttl: config.cron.lease_ttl(),
            shell: config.cron.shell.clone(),
        }
    }

    /// Run the job now. Command failures are recorded on the job and
    /// reported as [`JobOutcome::Failed`]; only store errors are returned.
    pub async fn run(&self, job_id: i64) -> Result<JobOutcome> {
        let Some(job) = catalog::find_cron_job(&self.pool, job_id)? else {
            warn!(job_id, "cron job not found");
            return Ok(JobOutcome::Skipped);
        };
        if !job.active {
            info!(job_id, name = %job.name, "cron job inactive, skipping");
            return Ok(JobOutcome::Skipped);
        }

        let key = job_key(&self.prefix, job.id);
        let Some(lease) = self.leases.acquire(&key, self.lease_ttl)? else {
            warn!(job_id, name = %job.name, "cron job already running, marking locked");
            catalog::set_cron_status(&self.pool, job.id, CronStatus::Locked, None)?;
            return Ok(JobOutcome::Locked);
        };
        let _guard = self.leases.guard(lease);

        catalog::mark_cron_started(&self.pool, job.id)?;
        info!(job_id, name = %job.name, command = %job.command, "cron job started");

        let (status, output) = self.execute(&job.command).await;
        catalog::set_cron_status(&self.pool, job.id, status, Some(&output))?;

        if status == CronStatus::Success {
            info!(job_id, name = %job.name, "cron job succeeded");
            Ok(JobOutcome::Succeeded)
        } else {
            error!(job_id, name = %job.name, output = %output, "cron job failed");
            Ok(JobOutcome::Failed)
        }
    }

    /// Run through the shell, capped at the lease TTL. Output is stdout
    /// followed by stderr.
    async fn execute(&self, command: &str) -> (CronStatus, String) {
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => return (CronStatus::Failed, format!("failed to start command: {e}")),
        };

        match tokio::time::timeout(self.lease_ttl, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                if output.status.success() {
                    (CronStatus::Success, text)
                } else {
                    if text.is_empty() {
                        text = format!("command exited with {}", output.status);
                    }
                    (CronStatus::Failed, text)
                }
            }
            Ok(Err(e)) => (CronStatus::Failed, format!("failed to wait for command: {e}")),
            Err(_) => (
                CronStatus::Failed,
                format!("command timed out after {}s", self.lease_ttl.as_secs()),
            ),
        }
    }
}
