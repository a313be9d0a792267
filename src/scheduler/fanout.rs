//! Scheduled suite fan-out: one run per active, idle environment.

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::lease::LeaseManager;
use crate::model::{RunType, Trigger};
use crate::pipeline::enqueue_prepare;
use crate::queue::Transport;
use crate::storage::runs::{self, NewRun};
use crate::storage::{catalog, Pool};

const SUITE_LEASE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Default, Serialize)]
pub struct FanoutReport {
    pub suite_id: i64,
    /// Run ids created.
    pub created: Vec<i64>,
    /// Environment ids skipped because a run was already in progress.
    pub skipped: Vec<i64>,
}

#[derive(Clone)]
pub struct Fanout {
    pool: Pool,
    transport: Transport,
    leases: LeaseManager,
}

impl Fanout {
    pub fn new(pool: Pool, transport: Transport) -> Self {
        Self {
            leases: transport.leases().clone(),
            pool,
            transport,
        }
    }

    pub fn fan_out(&self, suite_id: i64) -> Result<FanoutReport> {
        let mut report = FanoutReport {
            suite_id,
            ..FanoutReport::default()
        };

        let Some(suite) = catalog::find_suite(&self.pool, suite_id)? else {
            warn!(suite_id, "suite not found");
            return Ok(report);
        };
        if !suite.active {
            info!(suite_id, name = %suite.name, "suite inactive, skipping");
            return Ok(report);
        }

        let environments = catalog::active_suite_environments(&self.pool, suite.id)?;
        if environments.is_empty() {
            warn!(suite_id, name = %suite.name, "suite has no active environments");
            return Ok(report);
        }

        // Serialize concurrent fan-outs of the same suite so the idle check
        // and the insert are not interleaved.
        let key = format!("{}_suite_{}", self.transport.prefix(), suite.id);
        let Some(lease) = self.leases.acquire(&key, SUITE_LEASE_TTL)? else {
            warn!(suite_id, "fan-out already in progress for suite");
            return Ok(report);
        };
        let _guard = self.leases.guard(lease);

        for env in environments {
            if runs::has_active_for_environment(&self.pool, env.id)? {
                info!(suite_id, env_id = env.id, env = %env.name, "environment busy, skipping");
                report.skipped.push(env.id);
                continue;
            }

            let run = runs::create(
                &self.pool,
                &NewRun {
                    environment_id: env.id,
                    run_type: RunType::from_suite_type(&suite.suite_type),
                    suite_id: Some(suite.id),
                    trigger: Trigger::Scheduler,
                    test_filter: suite.test_pattern.clone(),
                    send_notifications: true,
                },
            )?;
            enqueue_prepare(&self.transport, &run)?;
            info!(suite_id, run_id = run.id, env_id = env.id, env = %env.name, "scheduled run created");
            report.created.push(run.id);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::storage::catalog::{NewEnvironment, NewSuite};
    use crate::storage::open_pool;

    fn setup() -> (tempfile::TempDir, Pool, Fanout) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("fanout.db"), 4).unwrap();
        let transport = Transport::new(pool.clone(), &QueueConfig::default());
        let fanout = Fanout::new(pool.clone(), transport);
        (dir, pool, fanout)
    }

    fn suite(pool: &Pool, active: bool, envs: &[&str]) -> i64 {
        catalog::insert_suite(
            pool,
            &NewSuite {
                name: "smoke".to_string(),
                suite_type: "mftf_group".to_string(),
                test_pattern: Some("SmokeGroup".to_string()),
                excluded_tests: None,
                cron_expression: Some("0 * * * *".to_string()),
                active,
                environments: envs.iter().map(|s| s.to_string()).collect(),
            },
        )
        .unwrap()
        .id
    }

    #[test]
    fn test_missing_or_inactive_suite_is_noop() {
        let (_dir, pool, fanout) = setup();
        assert!(fanout.fan_out(42).unwrap().created.is_empty());

        catalog::insert_environment(&pool, &NewEnvironment::named("eu")).unwrap();
        let id = suite(&pool, false, &["eu"]);
        assert!(fanout.fan_out(id).unwrap().created.is_empty());
    }

    #[test]
    fn test_runs_created_with_scheduler_trigger() {
        let (_dir, pool, fanout) = setup();
        catalog::insert_environment(&pool, &NewEnvironment::named("eu")).unwrap();
        let id = suite(&pool, true, &["eu"]);

        let report = fanout.fan_out(id).unwrap();
        assert_eq!(report.created.len(), 1);

        let run = runs::find(&pool, report.created[0]).unwrap().unwrap();
        assert_eq!(run.trigger, Trigger::Scheduler);
        assert_eq!(run.run_type, RunType::Mftf);
        assert_eq!(run.suite_id, Some(id));
        assert_eq!(run.test_filter.as_deref(), Some("SmokeGroup"));

        // Pending run blocks the next fan-out.
        let again = fanout.fan_out(id).unwrap();
        assert!(again.created.is_empty());
        assert_eq!(again.skipped, vec![run.environment_id]);
    }
}
