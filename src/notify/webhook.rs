//! Slack incoming-webhook + sendmail notifier.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use askama::Template;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Notifier, RunNotice};
use crate::config::NotificationConfig;

#[derive(Template)]
#[template(path = "slack_message.txt")]
struct SlackMessage<'a> {
    notice: &'a RunNotice,
}

#[derive(Template)]
#[template(path = "run_email.txt")]
struct RunEmail<'a> {
    notice: &'a RunNotice,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    slack_webhook_url: Option<String>,
    sendmail_command: String,
    sendmail_timeout: Duration,
    from_address: String,
}

/// Header values must stay on one line.
fn header_value(value: &str) -> String {
    value
        .split(['\r', '\n'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

impl WebhookNotifier {
    pub fn new(config: &NotificationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            slack_webhook_url: config.slack_webhook_url.clone(),
            sendmail_command: config.sendmail_command.clone(),
            sendmail_timeout: config.sendmail_timeout(),
            from_address: config.from_address.clone(),
        })
    }

    /// Full RFC 5322 message for one recipient.
    fn email_message(&self, to: &str, notice: &RunNotice) -> Result<String> {
        if to.contains(['\r', '\n']) {
            bail!("recipient address contains a line break: {to:?}");
        }
        let body = RunEmail { notice }.render().context("failed to render email")?;
        Ok(format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
            header_value(&self.from_address),
            to,
            header_value(&notice.subject()),
            body
        ))
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn send_slack(&self, notice: &RunNotice) -> Result<()> {
        let Some(url) = &self.slack_webhook_url else {
            debug!(run_id = notice.run_id, "no slack webhook configured, skipping");
            return Ok(());
        };
        let text = SlackMessage { notice }.render().context("failed to render slack message")?;

        let resp = self
            .client
            .post(url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .context("slack webhook request failed")?;
        if !resp.status().is_success() {
            bail!("slack webhook returned {}", resp.status());
        }
        info!(run_id = notice.run_id, "slack notification sent");
        Ok(())
    }

    async fn send_email(&self, to: &str, notice: &RunNotice) -> Result<()> {
        let message = self.email_message(to, notice)?;
        let mut parts = self.sendmail_command.split_whitespace();
        let Some(program) = parts.next() else {
            bail!("sendmail command is empty");
        };

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.sendmail_command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .await
                .context("failed to write message to sendmail")?;
        }
        let output = match tokio::time::timeout(self.sendmail_timeout, child.wait_with_output()).await {
            Ok(result) => result.context("sendmail did not finish")?,
            Err(_) => bail!(
                "sendmail timed out after {}s",
                self.sendmail_timeout.as_secs()
            ),
        };
        if !output.status.success() {
            bail!(
                "sendmail exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        info!(run_id = notice.run_id, to, "email notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunStatus;

    fn notice() -> RunNotice {
        RunNotice {
            run_id: 42,
            environment: "staging-eu".into(),
            status: RunStatus::Failed,
            run_type: "playwright".into(),
            trigger: "scheduler".into(),
            test_filter: Some("checkout".into()),
            duration: Some("2m 5s".into()),
            error_message: Some("exit code 1".into()),
            completed_tests: Some(3),
            total_tests: Some(4),
            link: "http://qa.test/api/v1/runs/42".into(),
        }
    }

    #[test]
    fn test_slack_template_renders() {
        let n = notice();
        let text = SlackMessage { notice: &n }.render().unwrap();
        assert!(text.contains("*Test run #42* on *staging-eu* finished: *failed*"));
        assert!(text.contains("Filter: checkout"));
        assert!(text.contains("<http://qa.test/api/v1/runs/42|View run>"));
    }

    #[test]
    fn test_email_is_addressed_to_one_recipient() {
        let notifier = WebhookNotifier::new(&NotificationConfig::default()).unwrap();
        let msg = notifier.email_message("dev@x.test", &notice()).unwrap();
        assert!(msg.contains("To: dev@x.test\r\n"));
        assert!(msg.contains("Subject: [testpilot] Run #42 failed on staging-eu"));
        assert!(msg.contains("Progress: 3/4"));
        assert!(msg.contains("exit code 1"));
    }

    #[tokio::test]
    async fn test_slack_without_webhook_is_skipped() {
        let notifier = WebhookNotifier::new(&NotificationConfig::default()).unwrap();
        notifier.send_slack(&notice()).await.unwrap();
    }

    #[tokio::test]
    async fn test_sendmail_failure_is_reported() {
        let config = NotificationConfig {
            sendmail_command: "false".to_string(),
            ..NotificationConfig::default()
        };
        let notifier = WebhookNotifier::new(&config).unwrap();
        assert!(notifier.send_email("dev@x.test", &notice()).await.is_err());
    }

    #[tokio::test]
    async fn test_hung_sendmail_is_killed_after_timeout() {
        let config = NotificationConfig {
            sendmail_command: "sleep 30".to_string(),
            sendmail_timeout_secs: 1,
            ..NotificationConfig::default()
        };
        let notifier = WebhookNotifier::new(&config).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            notifier.send_email("dev@x.test", &notice()),
        )
        .await
        .expect("send_email should give up on its own");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("timed out after 1s"), "{err}");
    }

    #[test]
    fn test_line_breaks_cannot_inject_headers() {
        let notifier = WebhookNotifier::new(&NotificationConfig::default()).unwrap();
        assert!(notifier
            .email_message("dev@x.test\r\nBcc: leak@x.test", &notice())
            .is_err());

        let n = RunNotice {
            environment: "staging-eu\r\nBcc: leak@x.test".into(),
            ..notice()
        };
        let msg = notifier.email_message("dev@x.test", &n).unwrap();
        let (headers, _) = msg.split_once("\r\n\r\n").unwrap();
        assert!(!headers.lines().any(|line| line.starts_with("Bcc:")));
        assert!(headers.contains("Subject: [testpilot] Run #42 failed on staging-eu Bcc: leak@x.test"));
    }
}
