//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use testpilot::config::RunnerConfig;
use testpilot::jobs::CronExecutor;
use testpilot::model::{NotificationTrigger, RunType, TestRun, Trigger};
use testpilot::notify::{Notifier, RunNotice};
use testpilot::pipeline::{Pipeline, RunStages, StageError};
use testpilot::queue::{Heartbeat, Transport};
use testpilot::scheduler::Fanout;
use testpilot::storage::catalog::{self, NewEnvironment, NewUser};
use testpilot::storage::runs::{self, NewRun};
use testpilot::storage::{open_pool, Pool};
use testpilot::worker::Worker;

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: RunnerConfig,
    pub pool: Pool,
    pub transport: Transport,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RunnerConfig::default();
        config.database.path = dir.path().join("testpilot.db");
        config.pipeline.work_dir = dir.path().join("work");
        config.pipeline.report_dir = dir.path().join("reports");
        config.queue.poll_interval_ms = 10;
        config.queue.retry_delay_secs = 0;

        let pool = open_pool(&config.database.path, 8).unwrap();
        let transport = Transport::new(pool.clone(), &config.queue);
        Self {
            dir,
            config,
            pool,
            transport,
        }
    }

    pub fn environment(&self, name: &str) -> i64 {
        catalog::insert_environment(&self.pool, &NewEnvironment::named(name))
            .unwrap()
            .id
    }

    /// Subscribe a user with email and Slack to every run on `env_name`.
    pub fn subscriber(&self, email: &str, env_name: &str) {
        catalog::insert_user(
            &self.pool,
            &NewUser {
                email: email.to_string(),
                notifications_enabled: true,
                notification_trigger: NotificationTrigger::All,
                notify_by_email: true,
                notify_by_slack: true,
                environments: vec![env_name.to_string()],
            },
        )
        .unwrap();
    }

    pub fn run(&self, environment_id: i64) -> TestRun {
        runs::create(
            &self.pool,
            &NewRun {
                environment_id,
                run_type: RunType::Mftf,
                suite_id: None,
                trigger: Trigger::Manual,
                test_filter: Some("AdminLoginTest".to_string()),
                send_notifications: true,
            },
        )
        .unwrap()
    }

    pub fn pipeline(&self, stages: Arc<dyn RunStages>, notifier: Arc<dyn Notifier>) -> Pipeline {
        Pipeline::new(
            self.pool.clone(),
            self.transport.clone(),
            stages,
            notifier,
            &self.config,
        )
    }

    pub fn worker(&self, stages: Arc<dyn RunStages>, notifier: Arc<dyn Notifier>) -> Worker {
        Worker::new(
            self.transport.clone(),
            self.pipeline(stages, notifier),
            CronExecutor::new(self.pool.clone(), &self.config),
            Fanout::new(self.pool.clone(), self.transport.clone()),
            self.config.queue.poll_interval(),
            self.config.queue.retry_delay(),
        )
    }
}

/// Poll until a cycle handles nothing. Bounded so a stuck queue fails the
/// test instead of hanging it.
pub async fn drain(worker: &Worker) -> usize {
    let mut total = 0;
    for _ in 0..200 {
        let handled = worker.poll_once().await.unwrap();
        if handled == 0 {
            return total;
        }
        total += handled;
    }
    panic!("queue did not drain after 200 cycles ({total} messages handled)");
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Stages that record each call and fail where told to.
#[derive(Default)]
pub struct ScriptedStages {
    pub fail_prepare: bool,
    pub fail_execute: bool,
    pub fail_report: bool,
    pub fail_cleanup: bool,
    pub calls: Mutex<Vec<(&'static str, i64)>>,
}

impl ScriptedStages {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_prepare: true,
            fail_execute: true,
            fail_report: true,
            fail_cleanup: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(&'static str, i64)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, stage: &'static str, run: &TestRun, fail: bool) -> Result<()> {
        self.calls.lock().unwrap().push((stage, run.id));
        if fail {
            bail!("{stage} exploded");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RunStages for ScriptedStages {
    async fn prepare(&self, run: &TestRun) -> Result<()> {
        self.record("prepare", run, self.fail_prepare)
    }

    async fn execute(&self, run: &TestRun, heartbeat: &dyn Heartbeat) -> Result<(), StageError> {
        heartbeat.beat()?;
        self.record("execute", run, self.fail_execute)?;
        Ok(())
    }

    async fn report(&self, run: &TestRun) -> Result<()> {
        self.record("report", run, self.fail_report)
    }

    async fn cleanup(&self, run: &TestRun) -> Result<()> {
        self.record("cleanup", run, self.fail_cleanup)
    }
}

// ---------------------------------------------------------------------------
// Notifiers
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    pub fail: bool,
    pub sent: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send_slack(&self, notice: &RunNotice) -> Result<()> {
        if self.fail {
            bail!("slack is down");
        }
        self.sent.lock().unwrap().push(format!("slack:{}", notice.run_id));
        Ok(())
    }

    async fn send_email(&self, to: &str, notice: &RunNotice) -> Result<()> {
        if self.fail {
            bail!("smtp is down");
        }
        self.sent.lock().unwrap().push(format!("email:{}:{}", to, notice.run_id));
        Ok(())
    }
}
