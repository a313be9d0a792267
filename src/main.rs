use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use testpilot::config::{LogFormat, LoggingConfig, RunnerConfig};
use testpilot::model::RunType;
use testpilot::ops::{Ops, StartRun};
use testpilot::queue::Transport;
use testpilot::scheduler::{Fanout, Scheduler};

#[derive(Parser)]
#[command(
    name = "testpilot",
    about = "End-to-end test run orchestration: queue, pipeline, cron and fan-out",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $TESTPILOT_CONFIG, then /etc/testpilot/testpilot.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler + workers)
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run queue workers only
    Worker {
        /// Number of concurrent workers (overrides config)
        #[arg(long)]
        count: Option<usize>,
    },

    /// Manage test runs
    Run {
        #[command(subcommand)]
        action: RunAction,
    },

    /// Manage cron jobs
    Cron {
        #[command(subcommand)]
        action: CronAction,
    },

    /// Scheduled suites
    Suite {
        #[command(subcommand)]
        action: SuiteAction,
    },

    /// Notifications
    Notify {
        #[command(subcommand)]
        action: NotifyAction,
    },

    /// Environment partition locks
    Locks {
        #[command(subcommand)]
        action: LocksAction,
    },

    /// Import environments, suites, users and cron jobs from a TOML file
    Import {
        /// File to import
        #[arg(long)]
        file: PathBuf,
    },

    /// Inspect or drain the message queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// Create a manual run and enqueue it
    Start {
        /// Environment id
        #[arg(long)]
        env: i64,

        /// Suite id
        #[arg(long)]
        suite: Option<i64>,

        /// mftf, playwright or both
        #[arg(long = "type")]
        run_type: Option<RunType>,

        /// Test filter; a comma-separated list runs tests one by one
        #[arg(long)]
        filter: Option<String>,

        /// Do not notify subscribers about this run
        #[arg(long)]
        no_notify: bool,
    },

    /// Cancel a pending or running run
    Cancel { id: i64 },

    /// Retry a failed or cancelled run as a new run
    Retry { id: i64 },

    /// Show one run
    Show {
        id: i64,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List recent runs
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum CronAction {
    /// List all cron jobs
    List,

    /// Add a new cron job
    Add {
        /// Job name
        #[arg(long)]
        name: String,

        /// Shell command to run
        #[arg(long)]
        command: String,

        /// Cron expression (5-field, or 6-field with seconds)
        #[arg(long)]
        cron: String,
    },

    /// Remove a cron job
    Remove {
        /// Job name
        #[arg(long)]
        name: String,
    },

    /// Run a job now
    Run {
        /// Job id
        id: i64,

        /// Execute in this process instead of enqueueing
        #[arg(long)]
        sync: bool,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

#[derive(Subcommand)]
enum SuiteAction {
    /// Create one run per idle, active environment of the suite
    FanOut { id: i64 },
}

#[derive(Subcommand)]
enum NotifyAction {
    /// Send a finished run's notifications again
    Resend {
        /// Run id
        id: i64,

        /// Send the Slack message even if no subscriber asked for it
        #[arg(long)]
        force_slack: bool,
    },
}

#[derive(Subcommand)]
enum LocksAction {
    /// Release environment partition locks
    Clear {
        /// Only this environment (default: all)
        #[arg(long)]
        env: Option<i64>,

        /// Show what would be released
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Pending / in-flight messages per queue
    Status,

    /// Process messages in the foreground until the queue is idle
    Drain,
}

fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::load_or_default(),
    };
    init_logging(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting testpilot daemon");
            testpilot::serve(config).await?;
        }
        Commands::Worker { count } => {
            if let Some(count) = count {
                config.worker.count = count;
            }
            tracing::info!(count = config.worker.count, "Starting workers");
            testpilot::run_workers(config).await?;
        }
        Commands::Run { action } => {
            let ops = ops(&config)?;
            match action {
                RunAction::Start {
                    env,
                    suite,
                    run_type,
                    filter,
                    no_notify,
                } => {
                    let run = ops.start_run(&StartRun {
                        environment_id: env,
                        suite_id: suite,
                        run_type,
                        test_filter: filter,
                        send_notifications: !no_notify,
                    })?;
                    println!("Run #{} created ({}), PREPARE enqueued.", run.id, run.run_type);
                }
                RunAction::Cancel { id } => {
                    ops.cancel_run(id)?;
                    println!("Run #{} cancelled.", id);
                }
                RunAction::Retry { id } => {
                    let run = ops.retry_run(id)?;
                    println!("Run #{} retried as run #{}.", id, run.id);
                }
                RunAction::Show { id, json } => {
                    let run = ops.get_run(id)?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&run)?);
                    } else {
                        println!("Run #{}", run.id);
                        println!("  status:      {}", run.status);
                        println!("  type:        {}", run.run_type);
                        println!("  environment: {}", run.environment_id);
                        println!("  trigger:     {}", run.trigger);
                        if let Some(filter) = &run.test_filter {
                            println!("  filter:      {}", filter);
                        }
                        if let Some(duration) = run.duration_formatted() {
                            println!("  duration:    {}", duration);
                        }
                        if let Some(err) = &run.error_message {
                            println!("  error:       {}", err);
                        }
                    }
                }
                RunAction::List { limit } => {
                    let runs = testpilot::storage::runs::list_recent(ops.pool(), limit)?;
                    if runs.is_empty() {
                        println!("No runs found.");
                    } else {
                        println!("{:<6} | {:<10} | {:<10} | {:<5} | Created", "Id", "Status", "Type", "Env");
                        println!("{:-<6}-|-{:-<10}-|-{:-<10}-|-{:-<5}-|-{:-<25}", "", "", "", "", "");
                        for run in runs {
                            println!(
                                "{:<6} | {:<10} | {:<10} | {:<5} | {}",
                                run.id,
                                run.status,
                                run.run_type,
                                run.environment_id,
                                run.created_at.to_rfc3339()
                            );
                        }
                    }
                }
            }
        }
        Commands::Cron { action } => {
            let pool = testpilot::open_store(&config)?;
            let scheduler = Scheduler::new(pool.clone());

            match action {
                CronAction::List => {
                    let list = scheduler.list_jobs().await?;
                    if list.is_empty() {
                        println!("No cron jobs found.");
                    } else {
                        println!("{:<4} | {:<20} | {:<15} | {:<8} | Last status", "Id", "Name", "Cron", "Active");
                        println!("{:-<4}-|-{:-<20}-|-{:-<15}-|-{:-<8}-|-{:-<11}", "", "", "", "", "");
                        for job in list {
                            let last = job.last_status.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
                            println!(
                                "{:<4} | {:<20} | {:<15} | {:<8} | {}",
                                job.id, job.name, job.cron_expression, job.active, last
                            );
                        }
                    }
                }
                CronAction::Add { name, command, cron } => {
                    let job = scheduler.add_job(&name, &command, &cron).await?;
                    println!("Cron job '{}' added (id {}).", job.name, job.id);
                }
                CronAction::Remove { name } => {
                    scheduler.remove_job(&name).await?;
                    println!("Cron job '{}' removed.", name);
                }
                CronAction::Run { id, sync } => {
                    if sync {
                        let executor = testpilot::jobs::CronExecutor::new(pool, &config);
                        let outcome = executor.run(id).await?;
                        println!("Cron job {} finished: {:?}", id, outcome);
                    } else {
                        let ops = Ops::new(pool.clone(), Transport::new(pool, &config.queue));
                        let message_id = ops.run_cron_now(id)?;
                        println!("Cron job {} enqueued (message {}).", id, message_id);
                    }
                }
                CronAction::DryRun { hours } => {
                    let preview = scheduler.preview_next_runs(hours).await?;
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for upcoming in preview {
                            println!("{} : {}", upcoming.at.to_rfc3339(), upcoming.item.name());
                        }
                    }
                }
            }
        }
        Commands::Suite { action } => match action {
            SuiteAction::FanOut { id } => {
                let pool = testpilot::open_store(&config)?;
                let fanout = Fanout::new(pool.clone(), Transport::new(pool, &config.queue));
                let report = fanout.fan_out(id)?;
                println!(
                    "Suite {}: {} run(s) created {:?}, {} environment(s) busy {:?}.",
                    id,
                    report.created.len(),
                    report.created,
                    report.skipped.len(),
                    report.skipped
                );
            }
        },
        Commands::Notify { action } => match action {
            NotifyAction::Resend { id, force_slack } => {
                let ops = ops(&config)?;
                let notifier = testpilot::notify::WebhookNotifier::new(&config.notification)?;
                let report = ops
                    .resend_notification(&notifier, &config.notification.base_url, id, force_slack)
                    .await?;
                println!(
                    "Run #{}: slack sent = {}, emails sent = {}, failures = {}.",
                    id, report.slack_sent, report.emails_sent, report.failures
                );
            }
        },
        Commands::Locks { action } => match action {
            LocksAction::Clear { env, dry_run } => {
                let ops = ops(&config)?;
                let keys = ops.clear_env_locks(env, dry_run)?;
                if keys.is_empty() {
                    println!("No environment locks held.");
                }
                for key in keys {
                    if dry_run {
                        println!("would release {}", key);
                    } else {
                        println!("released {}", key);
                    }
                }
            }
        },
        Commands::Import { file } => {
            let pool = testpilot::open_store(&config)?;
            let summary = testpilot::ops::import(&pool, &file)?;
            println!(
                "Imported {} environment(s), {} suite(s), {} user(s), {} cron job(s).",
                summary.environments, summary.suites, summary.users, summary.cron_jobs
            );
        }
        Commands::Queue { action } => match action {
            QueueAction::Status => {
                let stats = ops(&config)?.queue_stats()?;
                if stats.is_empty() {
                    println!("Queue is empty.");
                } else {
                    println!("{:<30} | {:<8} | In flight", "Queue", "Pending");
                    println!("{:-<30}-|-{:-<8}-|-{:-<9}", "", "", "");
                    for s in stats {
                        println!("{:<30} | {:<8} | {}", s.queue_name, s.pending, s.in_flight);
                    }
                }
            }
            QueueAction::Drain => {
                let pool = testpilot::open_store(&config)?;
                let transport = Transport::new(pool.clone(), &config.queue);
                let worker = Arc::new(testpilot::build_worker(&config, pool, transport)?);
                let mut total = 0;
                loop {
                    let handled = worker.poll_once().await?;
                    if handled == 0 {
                        break;
                    }
                    total += handled;
                }
                println!("Processed {} message(s).", total);
            }
        },
    }

    Ok(())
}

fn ops(config: &RunnerConfig) -> Result<Ops> {
    let pool = testpilot::open_store(config)?;
    let transport = Transport::new(pool.clone(), &config.queue);
    Ok(Ops::new(pool, transport))
}
