//! Send / receive / ack over the `queue_messages` table.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::{decode, encode, Heartbeat, Message, QueueError};
use crate::config::QueueConfig;
use crate::lease::{env_processing_key, Lease, LeaseManager};
use crate::storage::{ts, Pool};

/// A claimed message plus what is needed to settle it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub queue_name: String,
    pub message: Message,
    /// Set when the row was claimed before and its claim went stale.
    pub redelivered: bool,
    lease: Option<Lease>,
}

impl Delivery {
    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub pending: i64,
    pub in_flight: i64,
}

#[derive(Clone)]
pub struct Transport {
    pool: Pool,
    leases: LeaseManager,
    prefix: String,
    lease_ttl: Duration,
    redeliver_after: Duration,
}

impl Transport {
    pub fn new(pool: Pool, config: &QueueConfig) -> Self {
        Self {
            leases: LeaseManager::new(pool.clone()),
            pool,
            prefix: config.prefix.clone(),
            lease_ttl: config.env_lease_ttl(),
            redeliver_after: config.redeliver_after(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// `<prefix>_env_<id>` for an environment, `<prefix>` otherwise.
    pub fn queue_name(&self, partition: Option<i64>) -> String {
        match partition {
            Some(env) => format!("{}_env_{}", self.prefix, env),
            None => self.prefix.clone(),
        }
    }

    fn partition_of(&self, queue_name: &str) -> Option<i64> {
        queue_name
            .strip_prefix(&self.prefix)?
            .strip_prefix("_env_")?
            .parse()
            .ok()
    }

    /// Write one message to the partition's queue. Returns the row id.
    pub fn send(&self, message: &Message, partition: Option<i64>) -> Result<i64, QueueError> {
        let (body, headers) = encode(message, partition)?;
        let queue_name = self.queue_name(partition);
        let now = ts(Utc::now());

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO queue_messages (body, headers, queue_name, created_at, available_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![body, headers, queue_name, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, queue = %queue_name, kind = message.type_name(), "message sent");
        Ok(id)
    }

    /// Send to the partition the message itself names.
    pub fn dispatch(&self, message: &Message) -> Result<i64, QueueError> {
        self.send(message, message.partition())
    }

    /// Start a poll cycle. Partitions with eligible rows are discovered up
    /// front; each is tried once, lazily, as the iterator is advanced.
    pub fn receive(&self) -> Result<Receive<'_>, QueueError> {
        let now = Utc::now();
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT queue_name FROM queue_messages
             WHERE available_at <= ?1 AND (delivered_at IS NULL OR delivered_at < ?2)
             GROUP BY queue_name
             ORDER BY MIN(created_at)",
        )?;
        let partitions = stmt
            .query_map(params![ts(now), self.stale_before(now)], |row| row.get(0))?
            .collect::<rusqlite::Result<VecDeque<String>>>()?;

        Ok(Receive {
            transport: self,
            partitions,
        })
    }

    fn stale_before(&self, now: DateTime<Utc>) -> String {
        let window = chrono::Duration::from_std(self.redeliver_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        ts(now - window)
    }

    /// Lease the partition (environment queues only), then claim its oldest
    /// eligible row in one short IMMEDIATE transaction.
    fn claim(&self, queue_name: &str) -> Result<Option<Delivery>, QueueError> {
        let lease = match self.partition_of(queue_name) {
            Some(env) => {
                let key = env_processing_key(&self.prefix, env);
                match self.leases.acquire(&key, self.lease_ttl)? {
                    Some(lease) => Some(lease),
                    None => {
                        debug!(queue = %queue_name, "partition busy, skipping");
                        return Ok(None);
                    }
                }
            }
            None => None,
        };

        let claimed = match self.claim_row(queue_name) {
            Ok(claimed) => claimed,
            Err(e) => {
                self.release_lease(lease.as_ref());
                return Err(e);
            }
        };

        let Some((id, body, headers, previous)) = claimed else {
            self.release_lease(lease.as_ref());
            return Ok(None);
        };

        match decode(&body, &headers) {
            Ok(message) => {
                let redelivered = previous.is_some();
                if redelivered {
                    warn!(
                        id,
                        queue = %queue_name,
                        last_heartbeat = previous.as_deref().unwrap_or_default(),
                        "redelivering message with stale claim"
                    );
                }
                Ok(Some(Delivery {
                    id,
                    queue_name: queue_name.to_string(),
                    message,
                    redelivered,
                    lease,
                }))
            }
            Err(e) => {
                error!(id, queue = %queue_name, error = %e, body = %body, "dropping undecodable message");
                self.delete(id)?;
                self.release_lease(lease.as_ref());
                Ok(None)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn claim_row(
        &self,
        queue_name: &str,
    ) -> Result<Option<(i64, String, String, Option<String>)>, QueueError> {
        let now = Utc::now();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = tx
            .query_row(
                "SELECT id, body, headers, delivered_at FROM queue_messages
                 WHERE queue_name = ?1 AND available_at <= ?2
                   AND (delivered_at IS NULL OR delivered_at < ?3)
                 ORDER BY created_at, id
                 LIMIT 1",
                params![queue_name, ts(now), self.stale_before(now)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        if let Some((id, ..)) = &row {
            tx.execute(
                "UPDATE queue_messages SET delivered_at = ?1 WHERE id = ?2",
                params![ts(now), id],
            )?;
        }
        tx.commit()?;
        Ok(row)
    }

    fn delete(&self, id: i64) -> Result<bool, QueueError> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM queue_messages WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    fn release_lease(&self, lease: Option<&Lease>) {
        if let Some(lease) = lease {
            if let Err(e) = self.leases.release(lease) {
                warn!(key = %lease.key, error = %e, "failed to release partition lease");
            }
        }
    }

    /// Remove a processed message and free its partition. Idempotent.
    pub fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let deleted = self.delete(delivery.id);
        self.release_lease(delivery.lease.as_ref());
        if !deleted? {
            debug!(id = delivery.id, "ack of already removed message");
        }
        Ok(())
    }

    /// Same effect as [`ack`](Self::ack); logged as a rejection.
    pub fn reject(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let deleted = self.delete(delivery.id);
        self.release_lease(delivery.lease.as_ref());
        if deleted? {
            warn!(id = delivery.id, queue = %delivery.queue_name, kind = delivery.message.type_name(), "message rejected");
        }
        Ok(())
    }

    /// Un-claim a message so it is served again after `delay`.
    pub fn requeue(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let available = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE queue_messages SET delivered_at = NULL, available_at = ?1 WHERE id = ?2",
            params![ts(available), delivery.id],
        )?;
        drop(conn);
        info!(id = delivery.id, queue = %delivery.queue_name, "message requeued");
        self.release_lease(delivery.lease.as_ref());
        Ok(())
    }

    /// Heartbeat: extend the partition lease and stamp `delivered_at`.
    ///
    /// A lost lease or a store failure is returned to the caller. A row that
    /// no longer exists (already settled) is a no-op.
    pub fn renew(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if let Some(lease) = &delivery.lease {
            match self.leases.refresh(lease) {
                Ok(true) => {}
                Ok(false) => {
                    error!(id = delivery.id, key = %lease.key, "partition lease lost during processing");
                    return Err(QueueError::LeaseLost(lease.key.clone()));
                }
                Err(e) => {
                    error!(id = delivery.id, error = %e, "failed to refresh partition lease");
                    return Err(e.into());
                }
            }
        }

        let updated = self.pool.get().map_err(QueueError::from).and_then(|conn| {
            conn.execute(
                "UPDATE queue_messages SET delivered_at = ?1 WHERE id = ?2",
                params![ts(Utc::now()), delivery.id],
            )
            .map_err(QueueError::from)
        });
        match updated {
            Ok(0) => {
                debug!(id = delivery.id, "heartbeat for settled message ignored");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                error!(id = delivery.id, error = %e, "failed to update heartbeat");
                Err(e)
            }
        }
    }

    pub fn heartbeat<'a>(&'a self, delivery: &'a Delivery) -> DeliveryHeartbeat<'a> {
        DeliveryHeartbeat {
            transport: self,
            delivery,
        }
    }

    /// Pending and in-flight counts per queue.
    pub fn stats(&self) -> Result<Vec<QueueStats>, QueueError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT queue_name,
                    SUM(CASE WHEN delivered_at IS NULL THEN 1 ELSE 0 END),
                    SUM(CASE WHEN delivered_at IS NULL THEN 0 ELSE 1 END)
             FROM queue_messages
             GROUP BY queue_name
             ORDER BY queue_name",
        )?;
        let stats = stmt
            .query_map([], |row| {
                Ok(QueueStats {
                    queue_name: row.get(0)?,
                    pending: row.get(1)?,
                    in_flight: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stats)
    }

    /// Unclaimed messages of one partition, oldest first, without claiming.
    pub fn pending(&self, partition: Option<i64>) -> Result<Vec<Message>, QueueError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT body, headers FROM queue_messages
             WHERE queue_name = ?1 AND delivered_at IS NULL
             ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![self.queue_name(partition)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter()
            .map(|(body, headers)| decode(body, headers))
            .collect()
    }
}

/// One poll cycle. Yields at most one delivery per partition and ends once
/// every discovered partition has been tried.
pub struct Receive<'a> {
    transport: &'a Transport,
    partitions: VecDeque<String>,
}

impl Iterator for Receive<'_> {
    type Item = Result<Delivery, QueueError>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(queue_name) = self.partitions.pop_front() {
            match self.transport.claim(&queue_name) {
                Ok(Some(delivery)) => return Some(Ok(delivery)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

/// Heartbeat bound to one delivery.
pub struct DeliveryHeartbeat<'a> {
    transport: &'a Transport,
    delivery: &'a Delivery,
}

impl Heartbeat for DeliveryHeartbeat<'_> {
    fn beat(&self) -> Result<(), QueueError> {
        self.transport.renew(self.delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Phase;
    use crate::queue::RunMessage;
    use crate::storage::open_pool;

    fn transport() -> (tempfile::TempDir, Transport) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("queue.db"), 4).unwrap();
        (dir, Transport::new(pool, &QueueConfig::default()))
    }

    fn run_msg(run: i64, env: i64) -> Message {
        Message::TestRun(RunMessage::new(run, env, Phase::Prepare))
    }

    #[test]
    fn test_queue_names() {
        let (_dir, t) = transport();
        assert_eq!(t.queue_name(Some(4)), "test_runner_env_4");
        assert_eq!(t.queue_name(None), "test_runner");
        assert_eq!(t.partition_of("test_runner_env_4"), Some(4));
        assert_eq!(t.partition_of("test_runner"), None);
        assert_eq!(t.partition_of("other_env_4"), None);
    }

    #[test]
    fn test_empty_table_yields_nothing() {
        let (_dir, t) = transport();
        assert_eq!(t.receive().unwrap().count(), 0);
    }

    #[test]
    fn test_one_delivery_per_partition_per_cycle() {
        let (_dir, t) = transport();
        t.dispatch(&run_msg(1, 1)).unwrap();
        t.dispatch(&run_msg(2, 1)).unwrap();
        t.dispatch(&run_msg(3, 2)).unwrap();

        let deliveries: Vec<_> = t.receive().unwrap().map(Result::unwrap).collect();
        assert_eq!(deliveries.len(), 2);
        let mut queues: Vec<_> = deliveries.iter().map(|d| d.queue_name.clone()).collect();
        queues.sort();
        assert_eq!(queues, vec!["test_runner_env_1", "test_runner_env_2"]);
    }

    #[test]
    fn test_held_partition_is_skipped_until_ack() {
        let (_dir, t) = transport();
        t.dispatch(&run_msg(1, 7)).unwrap();
        t.dispatch(&run_msg(2, 7)).unwrap();

        let first = t.receive().unwrap().next().unwrap().unwrap();
        assert!(t.receive().unwrap().next().is_none());

        t.ack(&first).unwrap();
        let second = t.receive().unwrap().next().unwrap().unwrap();
        assert_eq!(second.message, run_msg(2, 7));
    }

    #[test]
    fn test_default_queue_takes_no_lease() {
        let (_dir, t) = transport();
        t.dispatch(&Message::CronJob { cron_job_id: 1 }).unwrap();
        t.dispatch(&Message::CronJob { cron_job_id: 2 }).unwrap();

        let a = t.receive().unwrap().next().unwrap().unwrap();
        let b = t.receive().unwrap().next().unwrap().unwrap();
        assert!(a.lease().is_none());
        assert_eq!(a.message, Message::CronJob { cron_job_id: 1 });
        assert_eq!(b.message, Message::CronJob { cron_job_id: 2 });
    }

    #[test]
    fn test_poison_message_is_dropped() {
        let (_dir, t) = transport();
        let conn = t.pool.get().unwrap();
        conn.execute(
            "INSERT INTO queue_messages (body, headers, queue_name, created_at, available_at)
             VALUES ('not json', '{\"type\":\"test_run\"}', 'test_runner_env_1', ?1, ?1)",
            params![ts(Utc::now())],
        )
        .unwrap();
        drop(conn);

        assert!(t.receive().unwrap().next().is_none());
        assert!(t.stats().unwrap().is_empty());
        assert!(!t.leases().is_held("test_runner_env_processing_1").unwrap());
    }

    #[test]
    fn test_failed_settle_still_frees_partition() {
        let (_dir, t) = transport();
        t.dispatch(&run_msg(1, 1)).unwrap();
        t.dispatch(&run_msg(2, 2)).unwrap();
        let mut deliveries: Vec<_> = t.receive().unwrap().map(Result::unwrap).collect();
        deliveries.sort_by_key(|d| d.id);
        assert_eq!(deliveries.len(), 2);

        t.pool
            .get()
            .unwrap()
            .execute_batch("ALTER TABLE queue_messages RENAME TO queue_messages_parked")
            .unwrap();

        assert!(t.ack(&deliveries[0]).is_err());
        assert!(t.reject(&deliveries[1]).is_err());
        assert!(!t.leases().is_held("test_runner_env_processing_1").unwrap());
        assert!(!t.leases().is_held("test_runner_env_processing_2").unwrap());
    }

    #[test]
    fn test_requeue_makes_message_available_again() {
        let (_dir, t) = transport();
        t.dispatch(&run_msg(1, 1)).unwrap();
        let d = t.receive().unwrap().next().unwrap().unwrap();
        t.requeue(&d, Duration::ZERO).unwrap();

        let again = t.receive().unwrap().next().unwrap().unwrap();
        assert_eq!(again.id, d.id);
        assert!(!again.redelivered);
    }

    #[test]
    fn test_renew_after_ack_is_noop() {
        let (_dir, t) = transport();
        t.dispatch(&Message::ScheduledSuite { suite_id: 1 }).unwrap();
        let d = t.receive().unwrap().next().unwrap().unwrap();
        t.ack(&d).unwrap();
        t.renew(&d).unwrap();
    }

    #[test]
    fn test_renew_reports_lost_partition_lease() {
        let (_dir, t) = transport();
        t.dispatch(&run_msg(1, 3)).unwrap();
        let d = t.receive().unwrap().next().unwrap().unwrap();
        t.heartbeat(&d).beat().unwrap();

        t.leases().force_release("test_runner_env_processing_3").unwrap();
        let err = t.heartbeat(&d).beat().unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost(_)));
    }

    #[test]
    fn test_stats_counts_pending_and_in_flight() {
        let (_dir, t) = transport();
        t.dispatch(&run_msg(1, 1)).unwrap();
        t.dispatch(&run_msg(2, 1)).unwrap();
        let _claimed = t.receive().unwrap().next().unwrap().unwrap();

        let stats = t.stats().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].queue_name, "test_runner_env_1");
        assert_eq!(stats[0].pending, 1);
        assert_eq!(stats[0].in_flight, 1);
    }
}
