//! Queue consumers.
//!
//! Each worker task polls the transport, handles what it is given and
//! settles it: ack on success, requeue after a delay on error. Any number
//! of tasks (and processes) can share one database.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::jobs::CronExecutor;
use crate::pipeline::Pipeline;
use crate::queue::{Delivery, Message, Transport};
use crate::scheduler::Fanout;

pub struct Worker {
    transport: Transport,
    pipeline: Pipeline,
    executor: CronExecutor,
    fanout: Fanout,
    poll_interval: Duration,
    retry_delay: Duration,
}

impl Worker {
    pub fn new(
        transport: Transport,
        pipeline: Pipeline,
        executor: CronExecutor,
        fanout: Fanout,
        poll_interval: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            transport,
            pipeline,
            executor,
            fanout,
            poll_interval,
            retry_delay,
        }
    }

    /// Route one delivery to its handler.
    pub async fn handle(&self, delivery: &Delivery) -> Result<()> {
        match &delivery.message {
            Message::TestRun(msg) => {
                let heartbeat = self.transport.heartbeat(delivery);
                self.pipeline.process(msg, &heartbeat).await?;
            }
            Message::CronJob { cron_job_id } => {
                let outcome = self.executor.run(*cron_job_id).await?;
                debug!(job_id = cron_job_id, ?outcome, "cron job handled");
            }
            Message::ScheduledSuite { suite_id } => {
                let report = self.fanout.fan_out(*suite_id)?;
                info!(
                    suite_id,
                    created = report.created.len(),
                    skipped = report.skipped.len(),
                    "suite fanned out"
                );
            }
        }
        Ok(())
    }

    async fn settle(&self, delivery: &Delivery) {
        let result = match self.handle(delivery).await {
            Ok(()) => self.transport.ack(delivery),
            Err(e) => {
                error!(
                    id = delivery.id,
                    queue = %delivery.queue_name,
                    kind = delivery.message.type_name(),
                    error = %format!("{e:#}"),
                    "message processing failed, requeueing"
                );
                self.transport.requeue(delivery, self.retry_delay)
            }
        };
        if let Err(e) = result {
            warn!(id = delivery.id, error = %e, "failed to settle message");
        }
    }

    /// One receive cycle. Returns how many messages were handled.
    pub async fn poll_once(&self) -> Result<usize> {
        let mut handled = 0;
        for delivery in self.transport.receive()? {
            let delivery = delivery?;
            self.settle(&delivery).await;
            handled += 1;
        }
        Ok(handled)
    }

    /// Poll until `shutdown` fires. In-flight work finishes first.
    pub async fn run(&self, worker_id: usize, shutdown: CancellationToken) {
        info!(worker_id, "worker started");
        while !shutdown.is_cancelled() {
            let handled = match self.poll_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!(worker_id, error = %format!("{e:#}"), "poll cycle failed");
                    0
                }
            };
            if handled == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        info!(worker_id, "worker stopped");
    }
}

/// Run `count` workers sharing one [`Worker`] until shutdown.
pub async fn run_worker_pool(worker: Arc<Worker>, count: usize, shutdown: CancellationToken) {
    let mut set = JoinSet::new();
    for worker_id in 0..count.max(1) {
        let worker = Arc::clone(&worker);
        let shutdown = shutdown.clone();
        set.spawn(async move { worker.run(worker_id, shutdown).await });
    }
    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "worker task aborted");
        }
    }
}
