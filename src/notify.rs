//! Completion notices.
//!
//! Notification is fire-and-forget: failures are logged and never affect the
//! chain outcome.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::chain::{ChainOutcome, ChainState};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str);
}

/// Writes the notice to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        info!(subject, "{}", body);
    }
}

/// Pipes the notice into a `mail`-compatible command.
pub struct MailNotifier {
    recipient: String,
    mail_cmd: String,
}

impl MailNotifier {
    pub fn new(recipient: impl Into<String>, mail_cmd: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            mail_cmd: mail_cmd.into(),
        }
    }

    async fn send(&self, subject: &str, body: &str) -> Result<()> {
        let mut child = Command::new(&self.mail_cmd)
            .arg("-s")
            .arg(subject)
            .arg(&self.recipient)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to run {}", self.mail_cmd))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(body.as_bytes())
                .await
                .context("Failed to write mail body")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for mail command")?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.mail_cmd,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for MailNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        match self.send(subject, body).await {
            Ok(()) => info!(recipient = %self.recipient, subject, "Notification sent"),
            Err(e) => warn!(recipient = %self.recipient, "Failed to send notification: {:#}", e),
        }
    }
}

/// Subject and body announcing a finished chain, or `None` when the chain
/// was interrupted.
pub fn compose(chain_name: &str, outcome: &ChainOutcome) -> Option<(String, String)> {
    let verdict = match outcome.state {
        ChainState::Completed => "completed",
        ChainState::Failed => "FAILED",
        ChainState::Interrupted => return None,
    };
    let summary = &outcome.summary;
    let subject = format!("mapchain {} {}", chain_name, verdict);

    let mut body = format!(
        "Chain {} {} after {}s\n{}/{} steps completed, {} failed\n",
        chain_name,
        verdict,
        outcome.duration.as_secs(),
        summary.completed,
        summary.total,
        summary.failed
    );
    for step in summary.steps.iter().filter(|s| s.error.is_some()) {
        body.push_str(&format!(
            "  {}: {}\n",
            step.id,
            step.error.as_deref().unwrap_or_default()
        ));
    }
    if let Some((date, best)) = summary.latest_best() {
        body.push_str(&format!(
            "Best map for {}: {} ({:.4})\n",
            date, best.step, best.quality
        ));
    }
    Some((subject, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BestMap, ChainSummary, StepReport, StepState};
    use std::time::Duration;

    fn outcome(state: ChainState) -> ChainOutcome {
        let mut summary = ChainSummary {
            total: 4,
            completed: 3,
            failed: 1,
            ..Default::default()
        };
        summary.best.insert(
            "20200201".to_string(),
            BestMap {
                step: "1.scratch.20200201".to_string(),
                quality: 0.39,
            },
        );
        summary.steps.push(StepReport {
            id: "1.incremental.20200201".to_string(),
            state: StepState::Failed,
            quality: None,
            master: None,
            runtime: None,
            error: Some("Engine failed: bad chart".to_string()),
        });
        ChainOutcome {
            state,
            summary,
            duration: Duration::from_secs(65),
        }
    }

    #[test]
    fn test_compose_failure() {
        let (subject, body) = compose("h3-hint", &outcome(ChainState::Failed)).unwrap();
        assert_eq!(subject, "mapchain h3-hint FAILED");
        assert!(body.contains("3/4 steps completed, 1 failed"));
        assert!(body.contains("1.incremental.20200201: Engine failed: bad chart"));
        assert!(body.contains("1.scratch.20200201 (0.3900)"));
    }

    #[test]
    fn test_no_notice_on_interrupt() {
        assert!(compose("h3-hint", &outcome(ChainState::Interrupted)).is_none());
        assert!(compose("h3-hint", &outcome(ChainState::Completed)).is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mail_failure_is_swallowed() {
        let notifier = MailNotifier::new("lab@example.org", "/nonexistent/bin/mail");
        notifier.notify("subject", "body").await;
    }
}
