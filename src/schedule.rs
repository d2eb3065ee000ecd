//! Monthly period runner.
//!
//! An external timer (cron, systemd) invokes `harvest schedule` as often as
//! it likes. The runner takes the global `schedule.lock`, checks
//! `schedule.json` for the last completed period, and runs every configured
//! instance at most once per calendar month. Instances share a concurrency
//! budget and each gets a wall-clock timeout; a timed-out instance is
//! cancelled, given `grace_secs` to flush its state, and reported as
//! `aborted` with reason `timeout`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use paper_harvest_core::models::{
    AggregatedReport, CompletionStatus, CycleReport, ErrorCategory, ErrorRecord,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{HarvestError, HarvestResult};
use crate::notify::{Notification, Notifier};
use crate::orchestrator::{setup_failure, Collaborators, CycleOptions, InstanceUpdateOrchestrator};
use crate::progress::{CycleProgressReporter, NoProgress};
use crate::state::{read_json, write_json_atomic, FileLock, StateStore};

const SCHEDULE_LOCK: &str = "schedule.lock";
const SCHEDULE_MARKER: &str = "schedule.json";
const CRON_FILE: &str = "harvest.cron";

/// Period key for `now`: `YYYY-MM`.
pub fn period_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Contents of `schedule.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleMarker {
    pub last_period: String,
    pub completed_at: DateTime<Utc>,
    pub exit_code: i32,
    pub report: AggregatedReport,
}

#[derive(Debug)]
pub enum PeriodOutcome {
    Ran(AggregatedReport),
    /// The period already completed; pass `force` to run it again.
    AlreadyRan { period: String },
    /// Another `harvest schedule` holds the global lock.
    Busy,
}

pub struct MonthlyScheduleRunner {
    config: Arc<Config>,
    store: StateStore,
    notifier: Box<dyn Notifier>,
    progress: Arc<dyn CycleProgressReporter>,
    shared: Option<Collaborators>,
}

impl MonthlyScheduleRunner {
    pub fn new(config: Arc<Config>, notifier: Box<dyn Notifier>) -> Self {
        let store = StateStore::new(config.storage.data_root.clone());
        Self {
            config,
            store,
            notifier,
            progress: Arc::new(NoProgress),
            shared: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn CycleProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Use the same collaborators for every instance instead of building
    /// them from the configuration.
    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.shared = Some(collaborators);
        self
    }

    pub fn marker_path(&self) -> PathBuf {
        self.store.root().join(SCHEDULE_MARKER)
    }

    pub fn last_marker(&self) -> HarvestResult<Option<ScheduleMarker>> {
        read_json(&self.marker_path())
    }

    /// Run every configured instance for the period containing `now`.
    pub async fn run_period(
        &self,
        now: DateTime<Utc>,
        force: bool,
        cancel: CancellationToken,
    ) -> HarvestResult<PeriodOutcome> {
        let lock_path = self.store.root().join(SCHEDULE_LOCK);
        let _lock = match FileLock::try_acquire(&lock_path)? {
            Some(lock) => lock,
            None => {
                tracing::warn!(path = %lock_path.display(), "another schedule run is active");
                return Ok(PeriodOutcome::Busy);
            }
        };

        let period = period_key(now);
        if !force {
            if let Some(marker) = self.last_marker()? {
                if marker.last_period == period {
                    tracing::info!(%period, completed_at = %marker.completed_at, "period already ran");
                    return Ok(PeriodOutcome::AlreadyRan { period });
                }
            }
        }

        let started_at = Utc::now();
        let budget = Semaphore::new(self.config.schedule.max_concurrent_instances.max(1));
        tracing::info!(
            %period,
            instances = self.config.instances.len(),
            concurrency = self.config.schedule.max_concurrent_instances,
            "period starting"
        );

        let runs = self
            .config
            .instances
            .keys()
            .map(|name| self.run_instance(name, &budget, &cancel));
        let reports = join_all(runs).await;

        let aggregated = AggregatedReport {
            period: period.clone(),
            started_at,
            finished_at: Utc::now(),
            reports,
        };
        let exit_code = aggregated.exit_code();

        write_json_atomic(
            &self.marker_path(),
            &ScheduleMarker {
                last_period: period.clone(),
                completed_at: aggregated.finished_at,
                exit_code,
                report: aggregated.clone(),
            },
        )?;

        if let Err(e) = self
            .notifier
            .send(Notification::Period(&aggregated), &self.config.notify.recipients)
            .await
        {
            tracing::warn!(error = %e, "report notification failed");
        }

        tracing::info!(
            %period,
            exit_code,
            success = aggregated.count(CompletionStatus::Success),
            partial = aggregated.count(CompletionStatus::Partial),
            aborted = aggregated.count(CompletionStatus::Aborted),
            skipped = aggregated.count(CompletionStatus::Skipped),
            "period finished"
        );
        Ok(PeriodOutcome::Ran(aggregated))
    }

    async fn orchestrator(&self, name: &str) -> HarvestResult<InstanceUpdateOrchestrator> {
        let collaborators = match &self.shared {
            Some(c) => c.clone(),
            None => {
                let instance = self
                    .config
                    .instance(name)
                    .map_err(|e| HarvestError::Configuration(e.to_string()))?;
                Collaborators::from_config(&self.config, instance).await?
            }
        };
        Ok(
            InstanceUpdateOrchestrator::new(self.config.clone(), name, collaborators)?
                .with_progress(self.progress.clone()),
        )
    }

    async fn run_instance(
        &self,
        name: &str,
        budget: &Semaphore,
        cancel: &CancellationToken,
    ) -> CycleReport {
        let _permit = match budget.acquire().await {
            Ok(permit) => permit,
            Err(_) => return setup_failure(name, &HarvestError::Cancelled),
        };
        let started_at = Utc::now();
        let orchestrator = match self.orchestrator(name).await {
            Ok(o) => o,
            Err(e) => {
                tracing::error!(instance = name, error = %e, "cannot set up instance");
                return setup_failure(name, &e);
            }
        };

        let timeout = Duration::from_secs(self.config.schedule.instance_timeout_secs);
        let grace = Duration::from_secs(self.config.schedule.grace_secs);
        let token = cancel.child_token();
        let cycle = orchestrator.run_cycle(CycleOptions::default(), token.clone());
        tokio::pin!(cycle);

        if let Ok(report) = tokio::time::timeout(timeout, &mut cycle).await {
            return report;
        }

        tracing::warn!(
            instance = name,
            timeout_secs = timeout.as_secs(),
            grace_secs = grace.as_secs(),
            "instance timed out, cancelling"
        );
        token.cancel();
        let mut report = match tokio::time::timeout(grace, &mut cycle).await {
            Ok(report) => report,
            Err(_) => {
                tracing::error!(instance = name, "instance did not stop within the grace period");
                let record = ErrorRecord::new(
                    ErrorCategory::Processing,
                    "did not stop within the grace period",
                )
                .fatal();
                CycleReport::aborted_before_start(name, record, started_at)
            }
        };
        report.status = CompletionStatus::Aborted;
        report.reason = Some("timeout".to_string());
        report.within_tolerance = false;
        if let Err(e) = self.store.save_report(name, &report) {
            tracing::error!(instance = name, error = %e, "failed to save cycle report");
        }
        report
    }
}

/// The crontab line that runs `harvest schedule` for `config_path`.
pub fn cron_line(cron: &str, exe: &Path, config_path: &Path) -> String {
    format!(
        "{} {} --config {} --progress off schedule\n",
        cron,
        exe.display(),
        config_path.display()
    )
}

/// Write `harvest.cron` under the data root. Installing it into the user's
/// crontab is left to the operator (`crontab harvest.cron`).
pub fn install_cron(config: &Config, exe: &Path, config_path: &Path) -> HarvestResult<PathBuf> {
    let root = &config.storage.data_root;
    std::fs::create_dir_all(root)?;
    let path = root.join(CRON_FILE);
    std::fs::write(&path, cron_line(&config.schedule.cron, exe, config_path))?;
    tracing::info!(path = %path.display(), cron = %config.schedule.cron, "cron entry written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::fetch::ArtifactTransport;
    use crate::notify::LogNotifier;
    use crate::process::tests::{LengthEmbedder, MemoryStore, TextExtractor};
    use crate::process::ParagraphChunker;
    use crate::sources::MetadataClient;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tempfile::TempDir;

    /// Never answers.
    struct StallingClient;

    #[async_trait]
    impl MetadataClient for StallingClient {
        async fn get_text(&self, _url: &str) -> HarvestResult<String> {
            std::future::pending::<()>().await;
            Err(HarvestError::Cancelled)
        }
    }

    struct NoTransport;

    #[async_trait]
    impl ArtifactTransport for NoTransport {
        async fn download(&self, url: &str, _max_bytes: u64) -> HarvestResult<Vec<u8>> {
            Err(HarvestError::http(404, url.to_string()))
        }
    }

    fn collaborators() -> Collaborators {
        Collaborators {
            metadata: Arc::new(StallingClient),
            transport: Arc::new(NoTransport),
            extractor: Arc::new(TextExtractor),
            chunker: Arc::new(ParagraphChunker),
            embedder: Arc::new(LengthEmbedder),
            store: Arc::new(MemoryStore::default()),
        }
    }

    fn config(root: &Path, extra: &str) -> Arc<Config> {
        let toml = format!(
            r#"
[storage]
data_root = "{}"

[schedule]
instance_timeout_secs = 1
grace_secs = 1
{}

[instances.physics.archive]
base_url = "https://archive.test/api/query"
categories = ["physics.optics"]
min_request_interval_ms = 0
"#,
            root.display(),
            extra
        );
        Arc::new(parse_config(&toml).unwrap())
    }

    #[test]
    fn period_key_is_year_month() {
        let now = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 0).unwrap();
        assert_eq!(period_key(now), "2024-02");
    }

    #[test]
    fn cron_file_runs_schedule() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), "cron = \"15 2 1 * *\"");
        let path = install_cron(
            &cfg,
            Path::new("/usr/local/bin/harvest"),
            Path::new("/etc/harvest.toml"),
        )
        .unwrap();
        let line = std::fs::read_to_string(path).unwrap();
        assert_eq!(
            line,
            "15 2 1 * * /usr/local/bin/harvest --config /etc/harvest.toml --progress off schedule\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_instance_is_aborted_and_period_recorded() {
        let tmp = TempDir::new().unwrap();
        let runner = MonthlyScheduleRunner::new(config(tmp.path(), ""), Box::new(LogNotifier))
            .with_collaborators(collaborators());
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 3, 0, 0).unwrap();

        let outcome = runner
            .run_period(now, false, CancellationToken::new())
            .await
            .unwrap();
        let report = match outcome {
            PeriodOutcome::Ran(report) => report,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(report.period, "2024-03");
        assert_eq!(report.reports.len(), 1);
        assert_eq!(report.reports[0].status, CompletionStatus::Aborted);
        assert_eq!(report.reports[0].reason.as_deref(), Some("timeout"));
        assert_eq!(report.exit_code(), 2);

        let marker = runner.last_marker().unwrap().unwrap();
        assert_eq!(marker.last_period, "2024-03");
        assert_eq!(marker.exit_code, 2);

        let again = runner
            .run_period(now, false, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(again, PeriodOutcome::AlreadyRan { period } if period == "2024-03"));
    }

    #[tokio::test]
    async fn concurrent_schedule_run_is_busy() {
        let tmp = TempDir::new().unwrap();
        let runner = MonthlyScheduleRunner::new(config(tmp.path(), ""), Box::new(LogNotifier))
            .with_collaborators(collaborators());
        let _held = FileLock::try_acquire(&tmp.path().join(SCHEDULE_LOCK))
            .unwrap()
            .unwrap();
        let outcome = runner
            .run_period(Utc::now(), true, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, PeriodOutcome::Busy));
    }
}
