//! Run notifications: who hears about a finished run, and how.

pub mod webhook;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::model::{RunStatus, Subscriber, TestEnvironment, TestRun};
use crate::storage::{catalog, Pool};

pub use webhook::WebhookNotifier;

/// Outcome of the recipient policy for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchPlan {
    /// One shared Slack message.
    pub slack: bool,
    /// One individually addressed email per entry.
    pub emails: Vec<String>,
}

impl DispatchPlan {
    pub fn is_empty(&self) -> bool {
        !self.slack && self.emails.is_empty()
    }
}

/// Slack goes out once if any matching subscriber wants Slack; every
/// matching subscriber who wants email gets their own.
pub fn plan_dispatch(status: RunStatus, subscribers: &[Subscriber]) -> DispatchPlan {
    let matching = subscribers.iter().filter(|s| s.trigger.matches(status));

    let mut plan = DispatchPlan::default();
    for sub in matching {
        plan.slack |= sub.notify_by_slack;
        if sub.notify_by_email && !plan.emails.contains(&sub.email) {
            plan.emails.push(sub.email.clone());
        }
    }
    plan
}

/// Everything a message about a run needs to say.
#[derive(Debug, Clone, Serialize)]
pub struct RunNotice {
    pub run_id: i64,
    pub environment: String,
    pub status: RunStatus,
    pub run_type: String,
    pub trigger: String,
    pub test_filter: Option<String>,
    pub duration: Option<String>,
    pub error_message: Option<String>,
    pub completed_tests: Option<i64>,
    pub total_tests: Option<i64>,
    pub link: String,
}

impl RunNotice {
    pub fn new(run: &TestRun, env: &TestEnvironment, base_url: &str) -> Self {
        Self {
            run_id: run.id,
            environment: env.name.clone(),
            status: run.status,
            run_type: run.run_type.to_string(),
            trigger: run.trigger.to_string(),
            test_filter: run.test_filter.clone(),
            duration: run.duration_formatted(),
            error_message: run.error_message.clone(),
            completed_tests: run.completed_tests,
            total_tests: run.total_tests,
            link: format!("{}/api/v1/runs/{}", base_url.trim_end_matches('/'), run.id),
        }
    }

    pub fn subject(&self) -> String {
        format!(
            "[testpilot] Run #{} {} on {}",
            self.run_id, self.status, self.environment
        )
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send_slack(&self, notice: &RunNotice) -> Result<()>;
    async fn send_email(&self, to: &str, notice: &RunNotice) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub slack_sent: bool,
    pub emails_sent: usize,
    pub failures: usize,
}

/// Send everything in the plan. A failed send is logged and counted; it
/// does not stop the remaining recipients.
pub async fn dispatch(notifier: &dyn Notifier, plan: &DispatchPlan, notice: &RunNotice) -> DispatchReport {
    let mut report = DispatchReport::default();

    if plan.slack {
        match notifier.send_slack(notice).await {
            Ok(()) => report.slack_sent = true,
            Err(e) => {
                warn!(run_id = notice.run_id, error = %format!("{e:#}"), "slack notification failed");
                report.failures += 1;
            }
        }
    }

    for email in &plan.emails {
        match notifier.send_email(email, notice).await {
            Ok(()) => report.emails_sent += 1,
            Err(e) => {
                warn!(run_id = notice.run_id, to = %email, error = %format!("{e:#}"), "email notification failed");
                report.failures += 1;
            }
        }
    }
    report
}

/// Resolve subscribers for the run's environment and dispatch.
/// `force_slack` sends the Slack message even when no subscriber asked.
pub async fn notify_run(
    pool: &Pool,
    notifier: &dyn Notifier,
    run: &TestRun,
    base_url: &str,
    force_slack: bool,
) -> Result<DispatchReport> {
    let env = catalog::find_environment(pool, run.environment_id)?
        .with_context(|| format!("environment {} not found", run.environment_id))?;
    let subscribers = catalog::subscribers_for_environment(pool, env.id)?;

    let mut plan = plan_dispatch(run.status, &subscribers);
    plan.slack |= force_slack;
    if plan.is_empty() {
        info!(run_id = run.id, status = %run.status, "no matching subscribers");
        return Ok(DispatchReport::default());
    }

    let notice = RunNotice::new(run, &env, base_url);
    Ok(dispatch(notifier, &plan, &notice).await)
}
