//! Phase work: what PREPARE/EXECUTE/REPORT/CLEANUP actually do to a run.
//!
//! The pipeline only depends on [`RunStages`]; [`CommandStages`] is the
//! shell-command implementation used by the binary.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::model::{split_list, RunStatus, RunType, TestEnvironment, TestRun};
use crate::queue::{Heartbeat, QueueError};
use crate::storage::{catalog, runs, Pool};

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The delivery could not be kept alive. Fatal for the attempt.
    #[error("heartbeat failed: {0}")]
    Heartbeat(#[from] QueueError),
    #[error("{0:#}")]
    Failed(#[from] anyhow::Error),
}

#[async_trait::async_trait]
pub trait RunStages: Send + Sync {
    async fn prepare(&self, run: &TestRun) -> anyhow::Result<()>;

    /// Run the tests. Long work must call `heartbeat.beat()` regularly and
    /// give up as soon as it fails.
    async fn execute(&self, run: &TestRun, heartbeat: &dyn Heartbeat) -> Result<(), StageError>;

    async fn report(&self, run: &TestRun) -> anyhow::Result<()>;

    async fn cleanup(&self, run: &TestRun) -> anyhow::Result<()>;
}

/// Runs the configured MFTF / Playwright command templates through a shell.
pub struct CommandStages {
    pool: Pool,
    shell: String,
    mftf_command: String,
    playwright_command: String,
    work_dir: PathBuf,
    report_dir: PathBuf,
    heartbeat_interval: Duration,
}

struct CommandResult {
    success: bool,
    code: Option<i32>,
}

impl CommandStages {
    pub fn new(pool: Pool, config: &RunnerConfig) -> Self {
        Self {
            pool,
            shell: config.pipeline.shell.clone(),
            mftf_command: config.pipeline.mftf_command.clone(),
            playwright_command: config.pipeline.playwright_command.clone(),
            work_dir: config.pipeline.work_dir.clone(),
            report_dir: config.pipeline.report_dir.clone(),
            heartbeat_interval: config.worker.heartbeat_interval(),
        }
    }

    fn run_dir(&self, run_id: i64) -> PathBuf {
        self.work_dir.join(format!("run-{run_id}"))
    }

    pub fn report_path(&self, run_id: i64) -> PathBuf {
        self.report_dir.join(format!("run-{run_id}.json"))
    }

    fn templates(&self, run_type: RunType) -> Vec<&str> {
        match run_type {
            RunType::Mftf => vec![self.mftf_command.as_str()],
            RunType::Playwright => vec![self.playwright_command.as_str()],
            RunType::Both => vec![self.mftf_command.as_str(), self.playwright_command.as_str()],
        }
    }

    fn environment(&self, run: &TestRun) -> anyhow::Result<TestEnvironment> {
        catalog::find_environment(&self.pool, run.environment_id)?
            .with_context(|| format!("environment {} not found", run.environment_id))
    }

    /// Filter from the run, falling back to the suite's pattern, plus the
    /// suite's exclusions.
    fn filter_and_exclusions(&self, run: &TestRun) -> anyhow::Result<(String, Vec<String>)> {
        let suite = match run.suite_id {
            Some(id) => catalog::find_suite(&self.pool, id)?,
            None => None,
        };
        let filter = run
            .test_filter
            .clone()
            .filter(|f| !f.trim().is_empty())
            .or_else(|| suite.as_ref().and_then(|s| s.test_pattern.clone()))
            .unwrap_or_default();
        let excluded = suite.map(|s| s.excluded()).unwrap_or_default();
        Ok((filter, excluded))
    }

    async fn run_command(
        &self,
        run: &TestRun,
        env: &TestEnvironment,
        command: &str,
        heartbeat: &dyn Heartbeat,
    ) -> Result<CommandResult, StageError> {
        let output_path = self.run_dir(run.id).join("output.log");
        info!(run_id = run.id, command, "running test command");

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .env("BASE_URL", &env.base_url)
            .env("TEST_RUN_ID", run.id.to_string())
            .env("TEST_ENVIRONMENT", &env.name)
            .env("TEST_WORK_DIR", self.run_dir(run.id))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn '{command}'"))?;

        runs::set_process(
            &self.pool,
            run.id,
            child.id(),
            Some(output_path.to_string_lossy().as_ref()),
        )?;

        let wait = child.wait_with_output();
        tokio::pin!(wait);
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.tick().await;

        let output = loop {
            tokio::select! {
                res = &mut wait => break res.context("failed to wait for test command")?,
                _ = ticker.tick() => {
                    debug!(run_id = run.id, "execution heartbeat");
                    heartbeat.beat()?;
                }
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let section = format!("$ {command}\n{}", text.trim_end());

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&output_path)
            .await
            .with_context(|| format!("failed to open {}", output_path.display()))?;
        file.write_all(section.as_bytes()).await.context("failed to write output log")?;
        file.write_all(b"\n\n").await.context("failed to write output log")?;
        runs::append_output(&self.pool, run.id, &section)?;
        runs::set_process(&self.pool, run.id, None, None)?;

        Ok(CommandResult {
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

#[async_trait::async_trait]
impl RunStages for CommandStages {
    async fn prepare(&self, run: &TestRun) -> anyhow::Result<()> {
        let env = self.environment(run)?;
        if !env.active {
            bail!("environment '{}' is inactive", env.name);
        }
        let dir = self.run_dir(run.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        info!(run_id = run.id, env = %env.name, dir = %dir.display(), "run prepared");
        Ok(())
    }

    async fn execute(&self, run: &TestRun, heartbeat: &dyn Heartbeat) -> Result<(), StageError> {
        let env = self.environment(run)?;
        let (filter, excluded) = self.filter_and_exclusions(run)?;
        tokio::fs::create_dir_all(self.run_dir(run.id))
            .await
            .context("failed to create run directory")?;

        let tests: Vec<String> = if filter.contains(',') {
            split_list(&filter)
                .into_iter()
                .filter(|t| !excluded.contains(t))
                .collect()
        } else {
            Vec::new()
        };

        let mut failures = Vec::new();
        for template in self.templates(run.run_type) {
            if tests.is_empty() {
                let command = template.replace("{filter}", &filter);
                let result = self.run_command(run, &env, &command, heartbeat).await?;
                if !result.success {
                    failures.push(format!("'{command}' exited with {:?}", result.code));
                }
                continue;
            }

            // Group mode: one command per test so progress is visible and a
            // cancellation takes effect between tests.
            let total = tests.len() as i64;
            for (done, test) in tests.iter().enumerate() {
                if runs::status(&self.pool, run.id)? == Some(RunStatus::Cancelled) {
                    warn!(run_id = run.id, test = %test, "run cancelled, stopping group");
                    return Err(anyhow!("run cancelled after {done} of {total} tests").into());
                }
                runs::set_progress(&self.pool, run.id, Some(test), done as i64, total)?;
                heartbeat.beat()?;

                let command = template.replace("{filter}", test);
                let result = self.run_command(run, &env, &command, heartbeat).await?;
                if !result.success {
                    failures.push(format!("{test} exited with {:?}", result.code));
                }
            }
            runs::set_progress(&self.pool, run.id, None, total, total)?;
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} test command(s) failed: {}", failures.len(), failures.join("; ")).into())
        }
    }

    async fn report(&self, run: &TestRun) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.report_dir)
            .await
            .with_context(|| format!("failed to create {}", self.report_dir.display()))?;

        let summary = serde_json::json!({
            "run_id": run.id,
            "run_type": run.run_type,
            "status": run.status,
            "environment_id": run.environment_id,
            "suite_id": run.suite_id,
            "trigger": run.trigger,
            "test_filter": run.test_filter,
            "completed_tests": run.completed_tests,
            "total_tests": run.total_tests,
            "error_message": run.error_message,
            "started_at": run.started_at,
            "duration": run.duration_formatted(),
            "output_file_path": run.output_file_path,
        });
        let path = self.report_path(run.id);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&summary)?)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(run_id = run.id, path = %path.display(), "report written");
        Ok(())
    }

    async fn cleanup(&self, run: &TestRun) -> anyhow::Result<()> {
        let dir = self.run_dir(run.id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", dir.display())),
        }
    }
}
