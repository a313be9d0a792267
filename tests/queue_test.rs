//! Transport behaviour under concurrent consumers.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::Harness;
use testpilot::config::QueueConfig;
use testpilot::pipeline::Phase;
use testpilot::queue::{Message, RunMessage, Transport};

fn run_msg(run: i64, env: i64) -> Message {
    Message::TestRun(RunMessage::new(run, env, Phase::Prepare))
}

#[test]
fn test_one_consumer_per_environment_across_threads() {
    let h = Harness::new();
    const TOTAL: usize = 24;
    for run in 1..=TOTAL as i64 {
        h.transport.dispatch(&run_msg(run, 1)).unwrap();
    }

    let busy = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let transport = h.transport.clone();
            let busy = Arc::clone(&busy);
            let done = Arc::clone(&done);
            let order = Arc::clone(&order);
            std::thread::spawn(move || {
                while done.load(Ordering::SeqCst) < TOTAL {
                    let next = transport.receive().unwrap().next();
                    let Some(delivery) = next else {
                        std::thread::sleep(Duration::from_millis(1));
                        continue;
                    };
                    let delivery = delivery.unwrap();
                    assert!(
                        !busy.swap(true, Ordering::SeqCst),
                        "two consumers held environment 1 at once"
                    );
                    std::thread::sleep(Duration::from_millis(2));
                    order.lock().unwrap().push(delivery.id);
                    busy.store(false, Ordering::SeqCst);
                    transport.ack(&delivery).unwrap();
                    done.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let order = order.lock().unwrap().clone();
    assert_eq!(order.len(), TOTAL);
    let mut sorted = order.clone();
    sorted.sort();
    assert_eq!(order, sorted, "messages were not consumed in send order");
}

#[test]
fn test_busy_environment_does_not_block_others() {
    let h = Harness::new();
    h.transport.dispatch(&run_msg(1, 1)).unwrap();
    h.transport.dispatch(&run_msg(2, 1)).unwrap();
    h.transport.dispatch(&run_msg(3, 2)).unwrap();

    let first = h.transport.receive().unwrap().next().unwrap().unwrap();
    assert_eq!(first.message, run_msg(1, 1));

    let others: Vec<_> = h.transport.receive().unwrap().map(Result::unwrap).collect();
    assert_eq!(others.len(), 1);
    assert_eq!(others[0].message, run_msg(3, 2));
}

#[test]
fn test_ack_and_reject_are_idempotent() {
    let h = Harness::new();
    h.transport.dispatch(&run_msg(1, 1)).unwrap();
    h.transport.dispatch(&run_msg(2, 1)).unwrap();

    let first = h.transport.receive().unwrap().next().unwrap().unwrap();
    h.transport.ack(&first).unwrap();

    let other = Transport::new(h.pool.clone(), &QueueConfig::default());
    let second = other.receive().unwrap().next().unwrap().unwrap();
    assert_eq!(second.message, run_msg(2, 1));

    // Settling the first delivery again must not touch the second holder.
    h.transport.ack(&first).unwrap();
    h.transport.reject(&first).unwrap();

    let stats = h.transport.stats().unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].queue_name, "test_runner_env_1");
    assert_eq!(stats[0].pending, 0);
    assert_eq!(stats[0].in_flight, 1);
    assert!(h
        .transport
        .leases()
        .is_held("test_runner_env_processing_1")
        .unwrap());

    other.ack(&second).unwrap();
    assert!(h.transport.stats().unwrap().is_empty());
    assert!(!h
        .transport
        .leases()
        .is_held("test_runner_env_processing_1")
        .unwrap());
}

#[test]
fn test_reject_drops_message_and_frees_partition() {
    let h = Harness::new();
    h.transport.dispatch(&run_msg(1, 4)).unwrap();
    h.transport.dispatch(&run_msg(2, 4)).unwrap();

    let first = h.transport.receive().unwrap().next().unwrap().unwrap();
    h.transport.reject(&first).unwrap();

    let second = h.transport.receive().unwrap().next().unwrap().unwrap();
    assert_eq!(second.message, run_msg(2, 4));
}

#[test]
fn test_stale_claim_is_redelivered() {
    let h = Harness::new();
    let transport = Transport::new(
        h.pool.clone(),
        &QueueConfig {
            redeliver_after_secs: 0,
            ..QueueConfig::default()
        },
    );
    transport.dispatch(&Message::CronJob { cron_job_id: 9 }).unwrap();

    let first = transport.receive().unwrap().next().unwrap().unwrap();
    assert!(!first.redelivered);
    std::thread::sleep(Duration::from_millis(5));

    let again = transport.receive().unwrap().next().unwrap().unwrap();
    assert_eq!(again.id, first.id);
    assert!(again.redelivered);
}

#[test]
fn test_stale_partition_waits_for_lease_expiry() {
    let h = Harness::new();
    let transport = Transport::new(
        h.pool.clone(),
        &QueueConfig {
            redeliver_after_secs: 0,
            ..QueueConfig::default()
        },
    );
    transport.dispatch(&run_msg(1, 5)).unwrap();

    let first = transport.receive().unwrap().next().unwrap().unwrap();
    std::thread::sleep(Duration::from_millis(5));
    // Lease still held by the first consumer.
    assert!(transport.receive().unwrap().next().is_none());

    transport
        .leases()
        .force_release("test_runner_env_processing_5")
        .unwrap();
    let again = transport.receive().unwrap().next().unwrap().unwrap();
    assert_eq!(again.id, first.id);
    assert!(again.redelivered);
}

#[test]
fn test_pending_lists_messages_in_order() {
    let h = Harness::new();
    h.transport.dispatch(&run_msg(1, 3)).unwrap();
    h.transport
        .dispatch(&Message::TestRun(RunMessage::new(1, 3, Phase::Execute)))
        .unwrap();
    h.transport.dispatch(&Message::ScheduledSuite { suite_id: 2 }).unwrap();

    let env3 = h.transport.pending(Some(3)).unwrap();
    assert_eq!(
        env3,
        vec![
            run_msg(1, 3),
            Message::TestRun(RunMessage::new(1, 3, Phase::Execute))
        ]
    );
    assert_eq!(
        h.transport.pending(None).unwrap(),
        vec![Message::ScheduledSuite { suite_id: 2 }]
    );
}
