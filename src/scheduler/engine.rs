use crate::queue::Transport;
use crate::scheduler::Scheduler;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Enqueue everything that fell due in `(from, to]`. Returns how many
/// messages were sent.
pub async fn tick_once(
    scheduler: &Scheduler,
    transport: &Transport,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<usize> {
    let mut sent = 0;
    for item in scheduler.due_between(from, to).await? {
        match transport.dispatch(&item.message()) {
            Ok(id) => {
                info!(item = %item.name(), message_id = id, "Scheduled item due, enqueued");
                sent += 1;
            }
            Err(e) => error!(item = %item.name(), error = %e, "Failed to enqueue scheduled item"),
        }
    }
    Ok(sent)
}

/// Main scheduler loop.
/// Every `tick`, enqueues cron jobs and suites that fell due since the
/// previous tick. Workers pick them up from the default queue.
pub async fn run_scheduler_loop(
    scheduler: Scheduler,
    transport: Transport,
    tick: Duration,
    shutdown: CancellationToken,
) {
    info!(tick_secs = tick.as_secs(), "Scheduler engine started");

    let mut interval = tokio::time::interval(tick);
    let mut last = Utc::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Scheduler engine stopping");
                break;
            }
            _ = interval.tick() => {}
        }

        let now = Utc::now();
        if let Err(e) = tick_once(&scheduler, &transport, last, now).await {
            error!(error = %format!("{e:#}"), "Failed to check due items");
        }
        last = now;
    }
}
