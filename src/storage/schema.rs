//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS test_environments (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            code TEXT NOT NULL DEFAULT '',
            region TEXT NOT NULL DEFAULT '',
            base_url TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS test_suites (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            suite_type TEXT NOT NULL,
            test_pattern TEXT,
            excluded_tests TEXT,
            cron_expression TEXT,
            active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS test_suite_environments (
            suite_id INTEGER NOT NULL REFERENCES test_suites(id) ON DELETE CASCADE,
            environment_id INTEGER NOT NULL REFERENCES test_environments(id) ON DELETE CASCADE,
            PRIMARY KEY (suite_id, environment_id)
        );

        CREATE TABLE IF NOT EXISTS test_runs (
            id INTEGER PRIMARY KEY,
            run_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            environment_id INTEGER NOT NULL REFERENCES test_environments(id),
            suite_id INTEGER REFERENCES test_suites(id) ON DELETE SET NULL,
            triggered_by TEXT NOT NULL,
            test_filter TEXT,
            send_notifications INTEGER NOT NULL DEFAULT 1,
            current_test_name TEXT,
            total_tests INTEGER,
            completed_tests INTEGER,
            process_pid INTEGER,
            output_file_path TEXT,
            error_message TEXT,
            output TEXT,
            notification_sent_at TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cron_jobs (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            command TEXT NOT NULL,
            cron_expression TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            last_run_at TEXT,
            last_status TEXT,
            last_output TEXT
        );

        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            notifications_enabled INTEGER NOT NULL DEFAULT 0,
            notification_trigger TEXT NOT NULL DEFAULT 'failures',
            notify_by_email INTEGER NOT NULL DEFAULT 1,
            notify_by_slack INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS user_notification_environments (
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            environment_id INTEGER NOT NULL REFERENCES test_environments(id) ON DELETE CASCADE,
            PRIMARY KEY (user_id, environment_id)
        );

        CREATE TABLE IF NOT EXISTS queue_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            body TEXT NOT NULL,
            headers TEXT NOT NULL,
            queue_name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            available_at TEXT NOT NULL,
            delivered_at TEXT
        );

        CREATE TABLE IF NOT EXISTS leases (
            lease_key TEXT PRIMARY KEY,
            token TEXT NOT NULL,
            expires_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_test_runs_env_status ON test_runs(environment_id, status);
        CREATE INDEX IF NOT EXISTS idx_queue_messages_queue_name ON queue_messages(queue_name);
        CREATE INDEX IF NOT EXISTS idx_queue_messages_available_at ON queue_messages(available_at);
        CREATE INDEX IF NOT EXISTS idx_queue_messages_delivered_at ON queue_messages(delivered_at);",
    )?;

    Ok(())
}
