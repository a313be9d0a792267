//! Test-run phase pipeline.
//!
//! A run moves PREPARE -> EXECUTE -> REPORT -> NOTIFY -> CLEANUP, one queue
//! message per phase. Each handler returns a [`PhaseOutcome`]; the next
//! phase is chosen by [`next_phase`] from that outcome alone, so a failing
//! handler can never stop the run short of NOTIFY.

pub mod stages;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::RunnerConfig;
use crate::lease::{run_key, LeaseError, LeaseManager};
use crate::model::{RunStatus, TestRun};
use crate::notify::{self, Notifier};
use crate::queue::{Heartbeat, Message, QueueError, RunMessage, Transport};
use crate::storage::{runs, Pool};

pub use stages::{CommandStages, RunStages, StageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Prepare,
    Execute,
    Report,
    Notify,
    Cleanup,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::Execute => "execute",
            Phase::Report => "report",
            Phase::Notify => "notify",
            Phase::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one phase handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Success,
    Failure(String),
    /// The handler had nothing to do (run already terminal, notifications
    /// disabled or already sent).
    Skipped,
}

/// Transition table. Only PREPARE success leads to EXECUTE; everything
/// else moves forward unconditionally until CLEANUP ends the run.
pub fn next_phase(phase: Phase, outcome: &PhaseOutcome) -> Option<Phase> {
    match (phase, outcome) {
        (Phase::Prepare, PhaseOutcome::Success) => Some(Phase::Execute),
        (Phase::Prepare, _) => Some(Phase::Report),
        (Phase::Execute, _) => Some(Phase::Report),
        (Phase::Report, _) => Some(Phase::Notify),
        (Phase::Notify, _) => Some(Phase::Cleanup),
        (Phase::Cleanup, _) => None,
    }
}

/// Failures that abort the current processing attempt. The message is
/// not forwarded; the caller is expected to retry it.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("run store error: {0:#}")]
    Store(#[from] anyhow::Error),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

/// Submit the PREPARE message for a freshly created run.
pub fn enqueue_prepare(transport: &Transport, run: &TestRun) -> Result<i64, QueueError> {
    transport.dispatch(&Message::TestRun(RunMessage::new(
        run.id,
        run.environment_id,
        Phase::Prepare,
    )))
}

pub struct Pipeline {
    pool: Pool,
    transport: Transport,
    leases: LeaseManager,
    stages: Arc<dyn RunStages>,
    notifier: Arc<dyn Notifier>,
    run_lease_ttl: Duration,
    run_lease_wait: Duration,
    base_url: String,
}

impl Pipeline {
    pub fn new(
        pool: Pool,
        transport: Transport,
        stages: Arc<dyn RunStages>,
        notifier: Arc<dyn Notifier>,
        config: &RunnerConfig,
    ) -> Self {
        Self {
            leases: transport.leases().clone(),
            pool,
            transport,
            stages,
            notifier,
            run_lease_ttl: config.pipeline.run_lease_ttl(),
            run_lease_wait: config.pipeline.run_lease_wait(),
            base_url: config.notification.base_url.clone(),
        }
    }

    /// Handle one phase message. Returns the phase that was enqueued next,
    /// or `None` when the run ended or the message was dropped.
    pub async fn process(
        &self,
        msg: &RunMessage,
        heartbeat: &dyn Heartbeat,
    ) -> Result<Option<Phase>, PipelineError> {
        let Some(run) = runs::find(&self.pool, msg.run_id)? else {
            warn!(run_id = msg.run_id, phase = %msg.phase, "test run not found, dropping message");
            return Ok(None);
        };

        if matches!(run.status, RunStatus::Cancelled | RunStatus::Failed)
            && matches!(msg.phase, Phase::Prepare | Phase::Execute)
        {
            info!(
                run_id = run.id,
                phase = %msg.phase,
                status = %run.status,
                "run already finished, skipping to report"
            );
            self.forward(msg, Phase::Report)?;
            return Ok(Some(Phase::Report));
        }

        let key = run_key(self.transport.prefix(), run.id);
        let Some(lease) = self
            .leases
            .acquire_within(&key, self.run_lease_ttl, self.run_lease_wait)
            .await?
        else {
            warn!(run_id = run.id, phase = %msg.phase, "run is locked by another worker, dropping message");
            return Ok(None);
        };
        let _guard = self.leases.guard(lease);

        info!(run_id = run.id, env_id = run.environment_id, phase = %msg.phase, "phase started");
        let outcome = match msg.phase {
            Phase::Prepare => self.prepare(&run).await?,
            Phase::Execute => self.execute(&run, heartbeat).await?,
            Phase::Report => self.report(run.id).await?,
            Phase::Notify => self.notify(run.id).await?,
            Phase::Cleanup => self.cleanup(&run).await,
        };
        match &outcome {
            PhaseOutcome::Success => info!(run_id = run.id, phase = %msg.phase, "phase succeeded"),
            PhaseOutcome::Skipped => info!(run_id = run.id, phase = %msg.phase, "phase skipped"),
            PhaseOutcome::Failure(reason) => {
                warn!(run_id = run.id, phase = %msg.phase, reason = %reason, "phase failed")
            }
        }

        let next = next_phase(msg.phase, &outcome);
        if let Some(next) = next {
            self.forward(msg, next)?;
        }
        Ok(next)
    }

    fn forward(&self, msg: &RunMessage, next: Phase) -> Result<(), QueueError> {
        self.transport
            .dispatch(&Message::TestRun(msg.with_phase(next)))?;
        Ok(())
    }

    async fn prepare(&self, run: &TestRun) -> Result<PhaseOutcome, PipelineError> {
        if !runs::advance(&self.pool, run.id, RunStatus::Preparing)? {
            return Ok(PhaseOutcome::Skipped);
        }
        match self.stages.prepare(run).await {
            Ok(()) => Ok(PhaseOutcome::Success),
            Err(e) => {
                error!(run_id = run.id, error = %format!("{e:#}"), "preparation failed");
                let reason = format!("Preparation failed: {e:#}");
                runs::mark_failed(&self.pool, run.id, &reason)?;
                Ok(PhaseOutcome::Failure(reason))
            }
        }
    }

    async fn execute(
        &self,
        run: &TestRun,
        heartbeat: &dyn Heartbeat,
    ) -> Result<PhaseOutcome, PipelineError> {
        if !runs::mark_execution_started(&self.pool, run.id)? {
            return Ok(PhaseOutcome::Skipped);
        }
        let beat = RunHeartbeat {
            inner: heartbeat,
            pool: &self.pool,
            run_id: run.id,
        };

        match self.stages.execute(run, &beat).await {
            Ok(()) => Ok(PhaseOutcome::Success),
            Err(StageError::Heartbeat(e)) => {
                error!(run_id = run.id, error = %e, "heartbeat failed during execution");
                Err(e.into())
            }
            Err(StageError::Failed(e)) => {
                let reason = format!("{e:#}");
                error!(run_id = run.id, error = %reason, "execution failed");
                if runs::status(&self.pool, run.id)? == Some(RunStatus::Cancelled) {
                    runs::append_output(&self.pool, run.id, "CANCELLED: execution stopped after cancellation")?;
                } else {
                    runs::mark_failed(&self.pool, run.id, &reason)?;
                }
                Ok(PhaseOutcome::Failure(reason))
            }
        }
    }

    async fn report(&self, run_id: i64) -> Result<PhaseOutcome, PipelineError> {
        let Some(run) = runs::find(&self.pool, run_id)? else {
            return Ok(PhaseOutcome::Skipped);
        };
        if run.status == RunStatus::Cancelled {
            return Ok(PhaseOutcome::Skipped);
        }

        let was_failed = run.status == RunStatus::Failed;
        if !was_failed {
            runs::advance(&self.pool, run.id, RunStatus::Reporting)?;
        }

        match self.stages.report(&run).await {
            Ok(()) => {
                if !was_failed {
                    runs::mark_completed(&self.pool, run.id)?;
                }
                Ok(PhaseOutcome::Success)
            }
            Err(e) => {
                let reason = format!("Report generation failed: {e:#}");
                error!(run_id = run.id, error = %reason, "report failed");
                if !was_failed {
                    runs::mark_failed(&self.pool, run.id, &reason)?;
                }
                Ok(PhaseOutcome::Failure(reason))
            }
        }
    }

    async fn notify(&self, run_id: i64) -> Result<PhaseOutcome, PipelineError> {
        let Some(run) = runs::find(&self.pool, run_id)? else {
            return Ok(PhaseOutcome::Skipped);
        };
        if !run.send_notifications {
            info!(run_id, "notifications disabled for run");
            return Ok(PhaseOutcome::Skipped);
        }
        if !runs::claim_notification(&self.pool, run_id)? {
            info!(run_id, "notification already sent");
            return Ok(PhaseOutcome::Skipped);
        }

        match notify::notify_run(&self.pool, self.notifier.as_ref(), &run, &self.base_url, false).await {
            Ok(report) => {
                info!(
                    run_id,
                    slack = report.slack_sent,
                    emails = report.emails_sent,
                    failures = report.failures,
                    "notifications dispatched"
                );
                Ok(PhaseOutcome::Success)
            }
            Err(e) => {
                error!(run_id, error = %format!("{e:#}"), "notification dispatch failed");
                Ok(PhaseOutcome::Failure(format!("{e:#}")))
            }
        }
    }

    async fn cleanup(&self, run: &TestRun) -> PhaseOutcome {
        let mut outcome = PhaseOutcome::Success;
        if let Err(e) = self.stages.cleanup(run).await {
            warn!(run_id = run.id, error = %format!("{e:#}"), "cleanup failed");
            outcome = PhaseOutcome::Failure(format!("{e:#}"));
        }
        if let Err(e) = runs::clear_process(&self.pool, run.id) {
            warn!(run_id = run.id, error = %format!("{e:#}"), "failed to clear process handle");
            outcome = PhaseOutcome::Failure(format!("{e:#}"));
        }
        outcome
    }
}

/// Delivery heartbeat that also bumps the run's `updated_at`.
struct RunHeartbeat<'a> {
    inner: &'a dyn Heartbeat,
    pool: &'a Pool,
    run_id: i64,
}

impl Heartbeat for RunHeartbeat<'_> {
    fn beat(&self) -> Result<(), QueueError> {
        self.inner.beat()?;
        if let Err(e) = runs::touch(self.pool, self.run_id) {
            warn!(run_id = self.run_id, error = %format!("{e:#}"), "failed to touch run");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_success_goes_to_execute() {
        assert_eq!(next_phase(Phase::Prepare, &PhaseOutcome::Success), Some(Phase::Execute));
    }

    #[test]
    fn test_prepare_failure_skips_execute() {
        let failed = PhaseOutcome::Failure("boom".into());
        assert_eq!(next_phase(Phase::Prepare, &failed), Some(Phase::Report));
        assert_eq!(next_phase(Phase::Prepare, &PhaseOutcome::Skipped), Some(Phase::Report));
    }

    #[test]
    fn test_every_phase_but_cleanup_forwards_on_failure() {
        let failed = PhaseOutcome::Failure("boom".into());
        assert_eq!(next_phase(Phase::Execute, &failed), Some(Phase::Report));
        assert_eq!(next_phase(Phase::Report, &failed), Some(Phase::Notify));
        assert_eq!(next_phase(Phase::Notify, &failed), Some(Phase::Cleanup));
        assert_eq!(next_phase(Phase::Cleanup, &failed), None);
        assert_eq!(next_phase(Phase::Cleanup, &PhaseOutcome::Success), None);
    }

    #[test]
    fn test_phase_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Phase::Notify).unwrap(), "\"notify\"");
        assert_eq!(Phase::Cleanup.to_string(), "cleanup");
    }
}
