//! Report delivery.
//!
//! A scheduled period hands its [`AggregatedReport`] to a [`Notifier`]; a
//! single `run-cycle` or `resume` hands over its [`CycleReport`] when
//! `notify.on_cycle` asks for it (by default, when storage crossed a
//! threshold). Delivery failures are logged and never change the exit code.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use paper_harvest_core::models::{
    AggregatedReport, CompletionStatus, CycleReport, ThresholdLevel,
};
use serde::Serialize;

use crate::config::{CycleNotifyPolicy, HttpConfig, NotifyConfig};
use crate::error::{HarvestError, HarvestResult};

/// What is being reported.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "kind", content = "report", rename_all = "lowercase")]
pub enum Notification<'a> {
    Cycle(&'a CycleReport),
    Period(&'a AggregatedReport),
}

impl Notification<'_> {
    /// Short label for logs: the instance or the period key.
    pub fn subject(&self) -> &str {
        match self {
            Notification::Cycle(r) => &r.instance,
            Notification::Period(r) => &r.period,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification<'_>, recipients: &[String])
        -> HarvestResult<()>;
}

fn write_cycle_line(out: &mut String, r: &CycleReport) {
    let _ = write!(
        out,
        "  {:<16} {:<8} discovered={} processed={} failed={} skipped={} pending={}",
        r.instance,
        r.status.as_str(),
        r.counts.discovered,
        r.counts.processed,
        r.counts.failed,
        r.counts.skipped,
        r.pending,
    );
    if let Some(reason) = &r.reason {
        let _ = write!(out, " reason={}", reason);
    }
    if let Some(storage) = &r.storage {
        let _ = write!(
            out,
            " storage={:.1}% ({})",
            storage.percent_used,
            storage.level.as_str()
        );
    }
    out.push('\n');
}

/// Plain-text digest: a headline plus one line per instance.
pub fn render_summary(notification: Notification<'_>) -> String {
    match notification {
        Notification::Cycle(r) => {
            let mut out = format!("paper-harvest cycle {}: {}\n", r.instance, r.status);
            write_cycle_line(&mut out, r);
            out
        }
        Notification::Period(report) => {
            let mut out = format!(
                "paper-harvest {}: {} instance(s), {} success, {} partial, {} aborted, {} skipped\n",
                report.period,
                report.reports.len(),
                report.count(CompletionStatus::Success),
                report.count(CompletionStatus::Partial),
                report.count(CompletionStatus::Aborted),
                report.count(CompletionStatus::Skipped),
            );
            for r in &report.reports {
                write_cycle_line(&mut out, r);
            }
            out
        }
    }
}

/// Whether a single cycle's report should be sent under `policy`.
pub fn should_notify_cycle(report: &CycleReport, policy: CycleNotifyPolicy) -> bool {
    match policy {
        CycleNotifyPolicy::Never => false,
        CycleNotifyPolicy::Always => true,
        CycleNotifyPolicy::Threshold => report
            .storage
            .as_ref()
            .is_some_and(|s| s.level != ThresholdLevel::Ok),
    }
}

/// Send a cycle report if `notify.on_cycle` asks for it. Returns whether it
/// was delivered; failures are only logged.
pub async fn notify_cycle(
    notifier: &dyn Notifier,
    notify: &NotifyConfig,
    report: &CycleReport,
) -> bool {
    if !should_notify_cycle(report, notify.on_cycle) {
        return false;
    }
    match notifier
        .send(Notification::Cycle(report), &notify.recipients)
        .await
    {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(instance = %report.instance, error = %e, "report notification failed");
            false
        }
    }
}

/// Writes the digest to the log. Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        notification: Notification<'_>,
        recipients: &[String],
    ) -> HarvestResult<()> {
        let summary = render_summary(notification);
        tracing::info!(
            subject = notification.subject(),
            recipients = recipients.join(","),
            "harvest report\n{}",
            summary.trim_end()
        );
        Ok(())
    }
}

/// POSTs the full report as JSON.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, http: &HttpConfig) -> HarvestResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(http.user_agent.clone())
            .timeout(Duration::from_secs(http.timeout_secs))
            .build()
            .map_err(|e| HarvestError::Configuration(format!("webhook client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(
        &self,
        notification: Notification<'_>,
        recipients: &[String],
    ) -> HarvestResult<()> {
        let body = serde_json::json!({
            "recipients": recipients,
            "summary": render_summary(notification),
            "payload": notification,
        });
        let resp = self.client.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HarvestError::http(
                status.as_u16(),
                format!("webhook {} rejected the report", self.url),
            ));
        }
        tracing::info!(url = %self.url, subject = notification.subject(), "report delivered");
        Ok(())
    }
}

pub fn create_notifier(
    notify: &NotifyConfig,
    http: &HttpConfig,
) -> HarvestResult<Box<dyn Notifier>> {
    match &notify.webhook_url {
        Some(url) => Ok(Box::new(WebhookNotifier::new(url.clone(), http)?)),
        None => Ok(Box::new(LogNotifier)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paper_harvest_core::models::StorageUsage;
    use std::sync::Mutex;

    /// Keeps the rendered summary of everything it is asked to send.
    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(
            &self,
            notification: Notification<'_>,
            _recipients: &[String],
        ) -> HarvestResult<()> {
            if self.fail {
                return Err(HarvestError::Network("smtp relay down".into()));
            }
            self.sent.lock().unwrap().push(render_summary(notification));
            Ok(())
        }
    }

    fn cycle_with_storage(level: ThresholdLevel, percent_used: f64) -> CycleReport {
        let mut report = CycleReport::skipped("physics", "n/a");
        report.status = CompletionStatus::Success;
        report.reason = None;
        report.storage = Some(StorageUsage {
            used_bytes: 900,
            available_bytes: 100,
            percent_used,
            level,
        });
        report
    }

    #[test]
    fn summary_lists_every_instance() {
        let now = chrono::Utc::now();
        let mut busy = CycleReport::skipped("biology", "lock held by pid=42");
        busy.finished_at = now;
        let report = AggregatedReport {
            period: "2024-02".into(),
            started_at: now,
            finished_at: now,
            reports: vec![CycleReport::skipped("physics", "lock busy"), busy],
        };
        let text = render_summary(Notification::Period(&report));
        assert!(text.starts_with("paper-harvest 2024-02: 2 instance(s), 0 success"));
        assert!(text.contains("2 skipped"));
        assert!(text.contains("biology"));
        assert!(text.contains("reason=lock held by pid=42"));
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn summary_shows_threshold_level() {
        let report = cycle_with_storage(ThresholdLevel::Critical, 97.5);
        let text = render_summary(Notification::Cycle(&report));
        assert!(text.starts_with("paper-harvest cycle physics: success"));
        assert!(text.contains("storage=97.5% (critical)"));
    }

    #[tokio::test]
    async fn threshold_crossing_sends_the_cycle_report() {
        let notifier = RecordingNotifier::default();
        let notify = NotifyConfig::default();

        let calm = cycle_with_storage(ThresholdLevel::Ok, 12.0);
        assert!(!notify_cycle(&notifier, &notify, &calm).await);
        let warning = cycle_with_storage(ThresholdLevel::Warning, 85.0);
        assert!(notify_cycle(&notifier, &notify, &warning).await);

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("(warning)"));
    }

    #[tokio::test]
    async fn cycle_policy_overrides_threshold() {
        let notifier = RecordingNotifier::default();
        let calm = cycle_with_storage(ThresholdLevel::Ok, 12.0);
        let always = NotifyConfig {
            on_cycle: CycleNotifyPolicy::Always,
            ..NotifyConfig::default()
        };
        assert!(notify_cycle(&notifier, &always, &calm).await);

        let critical = cycle_with_storage(ThresholdLevel::Critical, 99.0);
        let never = NotifyConfig {
            on_cycle: CycleNotifyPolicy::Never,
            ..NotifyConfig::default()
        };
        assert!(!notify_cycle(&notifier, &never, &critical).await);
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delivery_failure_is_not_fatal() {
        let notifier = RecordingNotifier {
            fail: true,
            ..RecordingNotifier::default()
        };
        let report = cycle_with_storage(ThresholdLevel::Critical, 99.0);
        assert!(!notify_cycle(&notifier, &NotifyConfig::default(), &report).await);
    }

    #[tokio::test]
    async fn log_notifier_never_fails() {
        let now = chrono::Utc::now();
        let report = AggregatedReport {
            period: "2024-02".into(),
            started_at: now,
            finished_at: now,
            reports: vec![],
        };
        assert!(LogNotifier
            .send(Notification::Period(&report), &["ops@example.org".into()])
            .await
            .is_ok());
    }
}
