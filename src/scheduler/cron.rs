use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use serde::Serialize;
use std::str::FromStr;
use tracing::warn;

use crate::model::CronJob;
use crate::queue::Message;
use crate::storage::{catalog, Pool};

/// Parse a cron expression. Classic 5-field crontab lines get a leading
/// seconds field; 6/7-field expressions are taken as-is.
pub fn parse_schedule(expr: &str) -> Result<CronSchedule> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    CronSchedule::from_str(&normalized)
        .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expr, e))
}

/// Something the scheduler can fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduledItem {
    CronJob { id: i64, name: String },
    Suite { id: i64, name: String },
}

impl ScheduledItem {
    /// Queue message that triggers the item.
    pub fn message(&self) -> Message {
        match self {
            ScheduledItem::CronJob { id, .. } => Message::CronJob { cron_job_id: *id },
            ScheduledItem::Suite { id, .. } => Message::ScheduledSuite { suite_id: *id },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ScheduledItem::CronJob { name, .. } | ScheduledItem::Suite { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Upcoming {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub item: ScheduledItem,
}

/// Reads cron jobs and scheduled suites from SQLite and works out what is due.
#[derive(Clone)]
pub struct Scheduler {
    pool: Pool,
}

impl Scheduler {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Add a cron job after validating its expression.
    pub async fn add_job(&self, name: &str, command: &str, cron_expr: &str) -> Result<CronJob> {
        parse_schedule(cron_expr)?;
        catalog::insert_cron_job(&self.pool, name, command, cron_expr)
            .with_context(|| format!("Failed to add cron job '{name}'"))
    }

    pub async fn list_jobs(&self) -> Result<Vec<CronJob>> {
        catalog::list_cron_jobs(&self.pool)
    }

    pub async fn remove_job(&self, name: &str) -> Result<()> {
        catalog::remove_cron_job(&self.pool, name)
    }

    /// Every active cron job and scheduled suite with its parsed schedule.
    /// Rows with an unparseable expression are logged and left out.
    fn schedules(&self) -> Result<Vec<(ScheduledItem, CronSchedule)>> {
        let mut out = Vec::new();

        for job in catalog::list_cron_jobs(&self.pool)? {
            if !job.active {
                continue;
            }
            match parse_schedule(&job.cron_expression) {
                Ok(schedule) => out.push((
                    ScheduledItem::CronJob {
                        id: job.id,
                        name: job.name,
                    },
                    schedule,
                )),
                Err(e) => warn!(job_id = job.id, error = %e, "skipping cron job"),
            }
        }

        for (id, name, expr) in catalog::scheduled_suites(&self.pool)? {
            match parse_schedule(&expr) {
                Ok(schedule) => out.push((ScheduledItem::Suite { id, name }, schedule)),
                Err(e) => warn!(suite_id = id, error = %e, "skipping scheduled suite"),
            }
        }
        Ok(out)
    }

    /// Items with a fire time in `(from, to]`. An item that fired several
    /// times in the window is returned once.
    pub async fn due_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<ScheduledItem>> {
        let due = self
            .schedules()?
            .into_iter()
            .filter(|(_, schedule)| schedule.after(&from).next().is_some_and(|t| t <= to))
            .map(|(item, _)| item)
            .collect();
        Ok(due)
    }

    /// Calculate next run times for everything scheduled.
    /// This is strictly a dry-run preview, not the execution loop.
    pub async fn preview_next_runs(&self, hours: u64) -> Result<Vec<Upcoming>> {
        let now = Utc::now();
        let end = now + chrono::Duration::hours(hours as i64);
        let mut preview = Vec::new();

        for (item, schedule) in self.schedules()? {
            for at in schedule.after(&now) {
                if at > end {
                    break;
                }
                preview.push(Upcoming {
                    at,
                    item: item.clone(),
                });
            }
        }

        // Sort by time
        preview.sort_by(|a, b| a.at.cmp(&b.at));
        Ok(preview)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::catalog::{NewEnvironment, NewSuite};
    use crate::storage::open_pool;
    use chrono::TimeZone;

    fn scheduler() -> (tempfile::TempDir, Scheduler) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("sched.db"), 4).unwrap();
        (dir, Scheduler::new(pool))
    }

    #[test]
    fn test_five_field_expressions_are_normalized() {
        let schedule = parse_schedule("*/15 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 10, 1, 0).unwrap();
        let next = schedule.after(&from).next().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 10, 15, 0).unwrap());
    }

    #[test]
    fn test_six_field_expressions_pass_through() {
        assert!(parse_schedule("30 0 2 * * *").is_ok());
        assert!(parse_schedule("not a cron").is_err());
    }

    #[tokio::test]
    async fn test_add_job_validates_expression() {
        let (_dir, s) = scheduler();
        assert!(s.add_job("bad", "true", "every tuesday").await.is_err());
        s.add_job("ok", "true", "0 3 * * *").await.unwrap();
        assert_eq!(s.list_jobs().await.unwrap().len(), 1);
        s.remove_job("ok").await.unwrap();
        assert!(s.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_due_between_covers_jobs_and_suites() {
        let (_dir, s) = scheduler();
        s.add_job("hourly", "true", "0 * * * *").await.unwrap();
        s.add_job("daily", "true", "0 3 * * *").await.unwrap();
        catalog::insert_environment(s.pool(), &NewEnvironment::named("eu")).unwrap();
        catalog::insert_suite(
            s.pool(),
            &NewSuite {
                name: "nightly".to_string(),
                suite_type: "playwright".to_string(),
                test_pattern: None,
                excluded_tests: None,
                cron_expression: Some("30 * * * *".to_string()),
                active: true,
                environments: vec!["eu".to_string()],
            },
        )
        .unwrap();

        let from = Utc.with_ymd_and_hms(2026, 1, 1, 9, 59, 50).unwrap();
        let to = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let due = s.due_between(from, to).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name(), "hourly");

        let from = Utc.with_ymd_and_hms(2026, 1, 1, 10, 29, 55).unwrap();
        let to = Utc.with_ymd_and_hms(2026, 1, 1, 10, 30, 5).unwrap();
        let due = s.due_between(from, to).await.unwrap();
        assert!(matches!(due.as_slice(), [ScheduledItem::Suite { .. }]));
        assert_eq!(due[0].message(), Message::ScheduledSuite { suite_id: 1 });
    }

    #[tokio::test]
    async fn test_preview_is_sorted() {
        let (_dir, s) = scheduler();
        s.add_job("a", "true", "*/30 * * * *").await.unwrap();
        s.add_job("b", "true", "*/20 * * * *").await.unwrap();

        let preview = s.preview_next_runs(2).await.unwrap();
        assert!(preview.len() >= 8);
        assert!(preview.windows(2).all(|w| w[0].at <= w[1].at));
    }
}
