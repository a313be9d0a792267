//! Records the orchestration core reads and writes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raised when a stored enum column holds an unknown value.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ParseEnumError { kind: $kind, value: s.to_string() }),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Test runs
// ---------------------------------------------------------------------------

/// Which test framework(s) a run drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Mftf,
    Playwright,
    Both,
}

string_enum!(RunType, "run type", {
    Mftf => "mftf",
    Playwright => "playwright",
    Both => "both",
});

impl RunType {
    /// Derive the run type from a suite's declared type (`mftf_group`,
    /// `playwright_test`, ...). Anything else runs both frameworks.
    pub fn from_suite_type(suite_type: &str) -> Self {
        if suite_type.starts_with("mftf") {
            RunType::Mftf
        } else if suite_type.starts_with("playwright") {
            RunType::Playwright
        } else {
            RunType::Both
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Preparing,
    Running,
    Reporting,
    Completed,
    Failed,
    Cancelled,
}

string_enum!(RunStatus, "run status", {
    Pending => "pending",
    Preparing => "preparing",
    Running => "running",
    Reporting => "reporting",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl RunStatus {
    pub const TERMINAL: [RunStatus; 3] =
        [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Scheduler,
}

string_enum!(Trigger, "trigger", {
    Manual => "manual",
    Scheduler => "scheduler",
});

/// One execution attempt of a suite/filter against one environment.
#[derive(Debug, Clone, Serialize)]
pub struct TestRun {
    pub id: i64,
    pub run_type: RunType,
    pub status: RunStatus,
    pub environment_id: i64,
    pub suite_id: Option<i64>,
    pub trigger: Trigger,
    pub test_filter: Option<String>,
    pub send_notifications: bool,
    pub current_test_name: Option<String>,
    pub total_tests: Option<i64>,
    pub completed_tests: Option<i64>,
    pub process_pid: Option<i64>,
    pub output_file_path: Option<String>,
    pub error_message: Option<String>,
    pub output: Option<String>,
    pub notification_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TestRun {
    /// Wall-clock duration from execution start to completion (or now).
    pub fn duration(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end - started)
    }

    /// `1h 2m 3s` / `2m 3s` / `3s`.
    pub fn duration_formatted(&self) -> Option<String> {
        let secs = self.duration()?.num_seconds().max(0);
        let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        Some(if h > 0 {
            format!("{h}h {m}m {s}s")
        } else if m > 0 {
            format!("{m}m {s}s")
        } else {
            format!("{s}s")
        })
    }
}

// ---------------------------------------------------------------------------
// Catalog (read-only to the core)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestEnvironment {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub region: String,
    pub base_url: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    pub id: i64,
    pub name: String,
    pub suite_type: String,
    pub test_pattern: Option<String>,
    pub excluded_tests: Option<String>,
    pub cron_expression: Option<String>,
    pub active: bool,
    pub environment_ids: Vec<i64>,
}

impl TestSuite {
    /// Excluded test names, one per comma or newline.
    pub fn excluded(&self) -> Vec<String> {
        split_list(self.excluded_tests.as_deref().unwrap_or_default())
    }
}

/// Split a comma/newline separated list, trimming blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Cron jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronStatus {
    Running,
    Success,
    Failed,
    Locked,
}

string_enum!(CronStatus, "cron status", {
    Running => "running",
    Success => "success",
    Failed => "failed",
    Locked => "locked",
});

#[derive(Debug, Clone, Serialize)]
pub struct CronJob {
    pub id: i64,
    pub name: String,
    pub command: String,
    pub cron_expression: String,
    pub active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<CronStatus>,
    pub last_output: Option<String>,
}

// ---------------------------------------------------------------------------
// Notification subscribers
// ---------------------------------------------------------------------------

/// When a user wants to hear about runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTrigger {
    All,
    Failures,
}

string_enum!(NotificationTrigger, "notification trigger", {
    All => "all",
    Failures => "failures",
});

impl NotificationTrigger {
    pub fn matches(&self, status: RunStatus) -> bool {
        match self {
            NotificationTrigger::All => true,
            NotificationTrigger::Failures => status == RunStatus::Failed,
        }
    }
}

/// A user with notifications enabled for a given environment.
#[derive(Debug, Clone, Serialize)]
pub struct Subscriber {
    pub user_id: i64,
    pub email: String,
    pub trigger: NotificationTrigger,
    pub notify_by_email: bool,
    pub notify_by_slack: bool,
}
