//! Environment-partitioned message queue on top of the SQLite store.
//!
//! Messages are rows in `queue_messages`; a partition is a `queue_name`.
//! Environment partitions are served by at most one consumer at a time,
//! enforced by a lease held from claim until ack/reject.

pub mod transport;

use serde::{Deserialize, Serialize};

use crate::lease::LeaseError;
use crate::pipeline::Phase;

pub use transport::{Delivery, DeliveryHeartbeat, QueueStats, Receive, Transport};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue store error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("queue store unavailable: {0}")]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("header type '{header}' does not match payload type '{payload}'")]
    TypeMismatch { header: String, payload: String },
    #[error("partition lease {0} was lost")]
    LeaseLost(String),
}

/// One pipeline step for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMessage {
    pub run_id: i64,
    pub environment_id: i64,
    pub phase: Phase,
}

impl RunMessage {
    pub fn new(run_id: i64, environment_id: i64, phase: Phase) -> Self {
        Self {
            run_id,
            environment_id,
            phase,
        }
    }

    /// Same run, next phase.
    pub fn with_phase(&self, phase: Phase) -> Self {
        Self { phase, ..*self }
    }
}

/// Everything that travels through the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    TestRun(RunMessage),
    #[serde(rename_all = "camelCase")]
    CronJob { cron_job_id: i64 },
    #[serde(rename_all = "camelCase")]
    ScheduledSuite { suite_id: i64 },
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::TestRun(_) => "test_run",
            Message::CronJob { .. } => "cron_job",
            Message::ScheduledSuite { .. } => "scheduled_suite",
        }
    }

    /// Environment partition the message belongs to, if any. Cron jobs and
    /// suite triggers carry their own job leases and use the default queue.
    pub fn partition(&self) -> Option<i64> {
        match self {
            Message::TestRun(run) => Some(run.environment_id),
            Message::CronJob { .. } | Message::ScheduledSuite { .. } => None,
        }
    }
}

/// Row metadata stored alongside the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Headers {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
}

pub(crate) fn encode(message: &Message, partition: Option<i64>) -> Result<(String, String), QueueError> {
    let body = serde_json::to_string(message)?;
    let headers = serde_json::to_string(&Headers {
        kind: message.type_name().to_string(),
        partition_key: partition.map(|p| p.to_string()),
    })?;
    Ok((body, headers))
}

pub(crate) fn decode(body: &str, headers: &str) -> Result<Message, QueueError> {
    let headers: Headers = serde_json::from_str(headers)?;
    let message: Message = serde_json::from_str(body)?;
    if headers.kind != message.type_name() {
        return Err(QueueError::TypeMismatch {
            header: headers.kind,
            payload: message.type_name().to_string(),
        });
    }
    Ok(message)
}

/// Liveness signal for long-running work.
///
/// Failing to beat means the store is unreachable or the partition lease
/// is gone; the caller must abandon the attempt.
pub trait Heartbeat: Send + Sync {
    fn beat(&self) -> Result<(), QueueError>;
}

/// Heartbeat for work that is not tied to a delivery (CLI, tests).
pub struct NoopHeartbeat;

impl Heartbeat for NoopHeartbeat {
    fn beat(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
