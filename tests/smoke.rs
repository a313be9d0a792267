//! Smoke tests -- verify the binary runs and key subcommands work.

use assert_cmd::Command;
use predicates::str::contains;

fn testpilot() -> Command {
    let mut cmd = Command::cargo_bin("testpilot").unwrap();
    cmd.env_remove("TESTPILOT_CONFIG").env("RUST_LOG", "warn");
    cmd
}

/// Config pointing every path into `dir`.
fn write_config(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("testpilot.toml");
    std::fs::write(
        &path,
        format!(
            r#"
[database]
path = "{db}"

[queue]
retry_delay_secs = 0

[pipeline]
mftf_command = "echo mftf {{filter}}"
playwright_command = "echo playwright {{filter}}"
work_dir = "{work}"
report_dir = "{reports}"
"#,
            db = dir.join("testpilot.db").display(),
            work = dir.join("work").display(),
            reports = dir.join("reports").display(),
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_cli_help() {
    testpilot()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("End-to-end test run orchestration"));
}

#[test]
fn test_cli_version() {
    testpilot()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("testpilot"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["serve", "--help"],
        vec!["worker", "--help"],
        vec!["run", "start", "--help"],
        vec!["cron", "dry-run", "--help"],
        vec!["suite", "fan-out", "--help"],
        vec!["notify", "resend", "--help"],
        vec!["locks", "clear", "--help"],
        vec!["queue", "status", "--help"],
    ] {
        testpilot().args(&args).assert().success();
    }
}

#[test]
fn test_import_start_and_drain() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let catalog = dir.path().join("catalog.toml");
    std::fs::write(
        &catalog,
        r#"
[[environments]]
name = "staging-eu"
base_url = "https://staging-eu.example.test"
"#,
    )
    .unwrap();

    testpilot()
        .arg("--config")
        .arg(&config)
        .args(["import", "--file"])
        .arg(&catalog)
        .assert()
        .success()
        .stdout(contains("Imported 1 environment(s)"));

    testpilot()
        .arg("--config")
        .arg(&config)
        .args(["run", "start", "--env", "1", "--type", "mftf", "--filter", "AdminLoginTest"])
        .assert()
        .success()
        .stdout(contains("Run #1 created (mftf)"));

    testpilot()
        .arg("--config")
        .arg(&config)
        .args(["queue", "status"])
        .assert()
        .success()
        .stdout(contains("test_runner_env_1"));

    testpilot()
        .arg("--config")
        .arg(&config)
        .args(["queue", "drain"])
        .assert()
        .success()
        .stdout(contains("Processed 5 message(s)."));

    testpilot()
        .arg("--config")
        .arg(&config)
        .args(["run", "show", "1"])
        .assert()
        .success()
        .stdout(contains("completed"));
}

#[test]
fn test_cron_add_list_remove() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    testpilot()
        .arg("--config")
        .arg(&config)
        .args(["cron", "add", "--name", "prune", "--command", "echo prune", "--cron", "0 4 * * *"])
        .assert()
        .success();

    testpilot()
        .arg("--config")
        .arg(&config)
        .args(["cron", "list"])
        .assert()
        .success()
        .stdout(contains("prune"));

    testpilot()
        .arg("--config")
        .arg(&config)
        .args(["cron", "run", "1", "--sync"])
        .assert()
        .success()
        .stdout(contains("Succeeded"));

    testpilot()
        .arg("--config")
        .arg(&config)
        .args(["cron", "remove", "--name", "prune"])
        .assert()
        .success();

    testpilot()
        .arg("--config")
        .arg(&config)
        .args(["cron", "add", "--name", "bad", "--command", "true", "--cron", "not a cron"])
        .assert()
        .failure();
}
