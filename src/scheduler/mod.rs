//! Time-based triggers: cron jobs and scheduled suites.

pub mod cron;
pub mod engine;
pub mod fanout;

// Re-export common types
pub use self::cron::{parse_schedule, ScheduledItem, Scheduler, Upcoming};
pub use self::engine::run_scheduler_loop;
pub use self::fanout::{Fanout, FanoutReport};
