//! Source discovery.
//!
//! A [`SourceDiscoverer`] turns an instance's source definitions into a
//! stream of [`DocumentDescriptor`]s for one date window. Each source is a
//! [`SourceAdapter`] variant that knows how to build page requests and parse
//! page bodies; the discoverer owns everything else:
//!
//! ```text
//!  SourceAdapter::Archive ─┐
//!  SourceAdapter::Journal ─┼─▶ throttle ─▶ MetadataClient ─▶ parse_page
//!  SourceAdapter::Journal ─┘        ▲            │ error
//!                                   └── retry ◀──┘
//!                                        │
//!                          dedup + window/category filter
//!                                        │
//!                                        ▼
//!                            mpsc::Sender<DocumentDescriptor>
//! ```
//!
//! A page that still fails after retries (or does not parse) ends that
//! source's query with an [`ErrorRecord`] in the ledger. Descriptors already
//! sent stay valid, and the other sources keep going.
//!
//! [`ErrorRecord`]: paper_harvest_core::models::ErrorRecord

pub mod archive;
pub mod journal;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use paper_harvest_core::ledger::ErrorLedger;
use paper_harvest_core::models::{DocumentDescriptor, OriginType};
use paper_harvest_core::retry::{RetryDecision, RetryPolicy};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{HttpConfig, InstanceConfig, WindowConfig};
use crate::error::{HarvestError, HarvestResult};
use crate::throttle::{sleep_or_cancel, MinIntervalThrottle};

pub use archive::ArchiveSource;
pub use journal::JournalSource;

/// Inclusive publication-time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub from: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl DateWindow {
    /// Explicit `since`/`until` dates win; otherwise the last `days` days.
    pub fn from_config(window: &WindowConfig, now: DateTime<Utc>) -> Self {
        let until = window
            .until
            .and_then(|d| d.and_hms_opt(23, 59, 59))
            .map(|dt| dt.and_utc())
            .unwrap_or(now);
        let from = window
            .since
            .map(|d| d.and_time(NaiveTime::MIN).and_utc())
            .unwrap_or_else(|| until - chrono::Duration::days(i64::from(window.days)));
        Self { from, until }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at <= self.until
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub window: DateWindow,
    /// Archive categories to keep; empty keeps everything.
    pub categories: Vec<String>,
}

impl DiscoveryRequest {
    pub fn for_instance(instance: &InstanceConfig, now: DateTime<Utc>) -> Self {
        Self {
            window: DateWindow::from_config(&instance.window, now),
            categories: instance
                .archive
                .as_ref()
                .map(|a| a.categories.clone())
                .unwrap_or_default(),
        }
    }

    fn admits(&self, descriptor: &DocumentDescriptor) -> bool {
        if !self.window.contains(descriptor.published) {
            return false;
        }
        match descriptor.origin {
            OriginType::Archive if !self.categories.is_empty() => descriptor
                .categories
                .iter()
                .any(|c| self.categories.contains(c)),
            _ => true,
        }
    }
}

/// One page to fetch. `offset` counts descriptors on earlier pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub url: String,
    pub offset: usize,
}

#[derive(Debug)]
pub struct Page {
    pub descriptors: Vec<DocumentDescriptor>,
    pub next: Option<PageRequest>,
    /// Total result count, when the source reports one.
    pub total: Option<usize>,
}

/// Fetches metadata pages. Implemented over HTTP for production and by
/// in-memory fakes in tests.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    async fn get_text(&self, url: &str) -> HarvestResult<String>;
}

pub struct HttpMetadataClient {
    client: reqwest::Client,
}

impl HttpMetadataClient {
    pub fn new(http: &HttpConfig) -> HarvestResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(http.user_agent.clone())
            .timeout(Duration::from_secs(http.timeout_secs))
            .build()
            .map_err(|e| HarvestError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

/// Parse a `Retry-After` header given in seconds.
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl MetadataClient for HttpMetadataClient {
    async fn get_text(&self, url: &str) -> HarvestResult<String> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let retry_after = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(HarvestError::Http {
                status: status.as_u16(),
                message: body.chars().take(300).collect(),
                retry_after,
            });
        }
        Ok(resp.text().await?)
    }
}

#[derive(Debug)]
pub enum SourceAdapter {
    Archive(ArchiveSource),
    Journal(JournalSource),
}

impl SourceAdapter {
    pub fn label(&self) -> &str {
        match self {
            SourceAdapter::Archive(a) => a.label(),
            SourceAdapter::Journal(j) => j.label(),
        }
    }

    fn throttle(&self) -> &MinIntervalThrottle {
        match self {
            SourceAdapter::Archive(a) => a.throttle(),
            SourceAdapter::Journal(j) => j.throttle(),
        }
    }

    fn first_request(&self, request: &DiscoveryRequest) -> HarvestResult<PageRequest> {
        match self {
            SourceAdapter::Archive(a) => a.page_request(&request.window, 0),
            SourceAdapter::Journal(j) => Ok(j.first_request()),
        }
    }

    fn parse_page(
        &self,
        body: &str,
        page: &PageRequest,
        request: &DiscoveryRequest,
    ) -> HarvestResult<Page> {
        match self {
            SourceAdapter::Archive(a) => a.parse_page(body, page, &request.window),
            SourceAdapter::Journal(j) => j.parse_page(body, page),
        }
    }

    /// Adapters for every source an instance defines.
    pub fn for_instance(instance: &InstanceConfig) -> Vec<SourceAdapter> {
        let mut adapters = Vec::new();
        if let Some(archive) = &instance.archive {
            if !archive.categories.is_empty() {
                adapters.push(SourceAdapter::Archive(ArchiveSource::new(archive)));
            }
        }
        for journal in &instance.journals {
            adapters.push(SourceAdapter::Journal(JournalSource::new(journal)));
        }
        adapters
    }
}

/// Counters for one discovery call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub emitted: u64,
    pub duplicates: u64,
    pub filtered: u64,
    pub pages: u64,
    pub page_errors: u64,
}

pub struct SourceDiscoverer {
    adapters: Vec<SourceAdapter>,
    client: Arc<dyn MetadataClient>,
    policy: RetryPolicy,
    ledger: Arc<ErrorLedger>,
    cancel: CancellationToken,
}

impl SourceDiscoverer {
    pub fn new(
        adapters: Vec<SourceAdapter>,
        client: Arc<dyn MetadataClient>,
        policy: RetryPolicy,
        ledger: Arc<ErrorLedger>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapters,
            client,
            policy,
            ledger,
            cancel,
        }
    }

    pub fn adapters(&self) -> &[SourceAdapter] {
        &self.adapters
    }

    /// Stream descriptors into `sink`, deduplicated by id within this call.
    /// Returns when every source is exhausted, the sink is closed, or the
    /// cycle is cancelled.
    pub async fn discover(
        &self,
        request: &DiscoveryRequest,
        sink: mpsc::Sender<DocumentDescriptor>,
    ) -> DiscoveryStats {
        let mut stats = DiscoveryStats::default();
        let mut seen: HashSet<String> = HashSet::new();

        'adapters: for adapter in &self.adapters {
            let label = adapter.label().to_string();
            let mut page_req = match adapter.first_request(request) {
                Ok(p) => p,
                Err(e) => {
                    self.record_page_error(&label, &e, 0);
                    stats.page_errors += 1;
                    continue;
                }
            };
            tracing::info!(source = %label, "discovery started");

            loop {
                if self.cancel.is_cancelled() {
                    break 'adapters;
                }
                let page = match self.fetch_page(adapter, &page_req).await {
                    Ok(body) => adapter.parse_page(&body, &page_req, request),
                    Err((HarvestError::Cancelled, _)) => break 'adapters,
                    Err((e, retries)) => {
                        self.record_page_error(&label, &e, retries);
                        stats.page_errors += 1;
                        break;
                    }
                };
                let page = match page {
                    Ok(p) => p,
                    Err(e) => {
                        self.record_page_error(&label, &e, 0);
                        stats.page_errors += 1;
                        break;
                    }
                };
                stats.pages += 1;
                tracing::debug!(
                    source = %label,
                    offset = page_req.offset,
                    returned = page.descriptors.len(),
                    total = ?page.total,
                    "page parsed"
                );

                for descriptor in page.descriptors {
                    if !request.admits(&descriptor) {
                        stats.filtered += 1;
                        continue;
                    }
                    if !seen.insert(descriptor.id.clone()) {
                        stats.duplicates += 1;
                        continue;
                    }
                    if sink.send(descriptor).await.is_err() {
                        tracing::debug!(source = %label, "discovery sink closed");
                        break 'adapters;
                    }
                    stats.emitted += 1;
                }

                match page.next {
                    Some(next) => page_req = next,
                    None => break,
                }
            }
        }

        tracing::info!(
            emitted = stats.emitted,
            duplicates = stats.duplicates,
            filtered = stats.filtered,
            page_errors = stats.page_errors,
            "discovery finished"
        );
        stats
    }

    /// Drain [`discover`](Self::discover) into a vector.
    pub async fn collect(&self, request: &DiscoveryRequest) -> Vec<DocumentDescriptor> {
        let (tx, mut rx) = mpsc::channel(64);
        let drain = async {
            let mut out = Vec::new();
            while let Some(d) = rx.recv().await {
                out.push(d);
            }
            out
        };
        let (_, out) = tokio::join!(self.discover(request, tx), drain);
        out
    }

    async fn fetch_page(
        &self,
        adapter: &SourceAdapter,
        page: &PageRequest,
    ) -> Result<String, (HarvestError, u32)> {
        let mut retries = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err((HarvestError::Cancelled, retries)),
                _ = adapter.throttle().acquire() => {}
            }
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err((HarvestError::Cancelled, retries)),
                result = self.client.get_text(&page.url) => result,
            };
            let err = match result {
                Ok(body) => return Ok(body),
                Err(e) => e,
            };
            match self.policy.decide(retries, &err) {
                RetryDecision::RetryAfter(delay) => {
                    let sample: f64 = rand::thread_rng().gen();
                    let delay = self.policy.jittered(delay, sample);
                    tracing::warn!(
                        source = adapter.label(),
                        url = %page.url,
                        error = %err,
                        retry = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "page request failed, retrying"
                    );
                    if !sleep_or_cancel(delay, &self.cancel).await {
                        return Err((HarvestError::Cancelled, retries));
                    }
                    retries += 1;
                }
                RetryDecision::GiveUp => return Err((err, retries)),
            }
        }
    }

    fn record_page_error(&self, label: &str, error: &HarvestError, retries: u32) {
        tracing::error!(source = %label, error = %error, retries, "source query ended early");
        let mut record = error.to_record(None, retries);
        record.message = format!("{}: {}", label, record.message);
        self.ledger.record(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArchiveSourceConfig, JournalSourceConfig};
    use chrono::TimeZone;
    use paper_harvest_core::models::ErrorCategory;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned bodies by URL substring; unknown URLs are 404s.
    struct CannedClient {
        pages: Vec<(String, String)>,
        failures: Mutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl MetadataClient for CannedClient {
        async fn get_text(&self, url: &str) -> HarvestResult<String> {
            {
                let mut failures = self.failures.lock().unwrap();
                for (needle, left) in failures.iter_mut() {
                    if url.contains(needle.as_str()) && *left > 0 {
                        *left -= 1;
                        return Err(HarvestError::http(503, "busy"));
                    }
                }
            }
            self.pages
                .iter()
                .find(|(needle, _)| url.contains(needle.as_str()))
                .map(|(_, body)| body.clone())
                .ok_or_else(|| HarvestError::http(404, url.to_string()))
        }
    }

    fn window() -> DateWindow {
        DateWindow {
            from: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            until: Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap(),
        }
    }

    fn archive_adapter() -> SourceAdapter {
        SourceAdapter::Archive(ArchiveSource::new(&ArchiveSourceConfig {
            base_url: "https://archive.test/api/query".into(),
            categories: vec!["quant-ph".into()],
            page_size: 100,
            min_request_interval_ms: 0,
        }))
    }

    fn journal_adapter() -> SourceAdapter {
        SourceAdapter::Journal(JournalSource::new(&JournalSourceConfig {
            name: "joo".into(),
            feed_url: "https://example.org/joo.rss".into(),
            category: None,
            min_request_interval_ms: 0,
        }))
    }

    fn discoverer(
        adapters: Vec<SourceAdapter>,
        client: CannedClient,
        ledger: Arc<ErrorLedger>,
    ) -> SourceDiscoverer {
        SourceDiscoverer::new(
            adapters,
            Arc::new(client),
            RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(20)),
            ledger,
            CancellationToken::new(),
        )
    }

    #[test]
    fn window_from_config() {
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 3, 0, 0).unwrap();
        let rolling = DateWindow::from_config(&WindowConfig::default(), now);
        assert_eq!(rolling.until, now);
        assert_eq!(rolling.from, now - chrono::Duration::days(31));

        let fixed = DateWindow::from_config(
            &WindowConfig {
                days: 31,
                since: chrono::NaiveDate::from_ymd_opt(2024, 1, 1),
                until: chrono::NaiveDate::from_ymd_opt(2024, 1, 31),
            },
            now,
        );
        assert_eq!(fixed, window());
    }

    #[tokio::test(start_paused = true)]
    async fn filters_window_and_categories_and_dedups() {
        use archive::tests::{entry_xml, feed_xml};
        let body = feed_xml(
            4,
            &[
                entry_xml("2401.00001", "2024-01-03T00:00:00Z", "quant-ph"),
                entry_xml("2401.00001", "2024-01-03T00:00:00Z", "quant-ph"),
                entry_xml("2312.09999", "2023-12-20T00:00:00Z", "quant-ph"),
                entry_xml("2401.00002", "2024-01-05T00:00:00Z", "cs.AI"),
            ],
        );
        let client = CannedClient {
            pages: vec![("archive.test".into(), body)],
            failures: Mutex::new(HashMap::new()),
        };
        let ledger = Arc::new(ErrorLedger::new());
        let disc = discoverer(vec![archive_adapter()], client, ledger.clone());
        let request = DiscoveryRequest {
            window: window(),
            categories: vec!["quant-ph".into()],
        };

        let found = disc.collect(&request).await;
        let ids: Vec<&str> = found.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["arxiv:2401.00001"]);
        assert!(ledger.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_page_errors_are_retried() {
        let client = CannedClient {
            pages: vec![("joo.rss".into(), journal::tests::FEED.to_string())],
            failures: Mutex::new(HashMap::from([("joo.rss".to_string(), 2)])),
        };
        let ledger = Arc::new(ErrorLedger::new());
        let disc = discoverer(vec![journal_adapter()], client, ledger.clone());
        let request = DiscoveryRequest {
            window: window(),
            categories: vec![],
        };
        let found = disc.collect(&request).await;
        assert_eq!(found.len(), 2);
        assert!(ledger.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_source_is_recorded_and_others_continue() {
        use archive::tests::{entry_xml, feed_xml};
        let client = CannedClient {
            pages: vec![(
                "archive.test".into(),
                feed_xml(1, &[entry_xml("2401.00003", "2024-01-09T00:00:00Z", "quant-ph")]),
            )],
            failures: Mutex::new(HashMap::new()),
        };
        let ledger = Arc::new(ErrorLedger::new());
        let disc = discoverer(
            vec![journal_adapter(), archive_adapter()],
            client,
            ledger.clone(),
        );
        let request = DiscoveryRequest {
            window: window(),
            categories: vec!["quant-ph".into()],
        };
        let found = disc.collect(&request).await;
        assert_eq!(found.len(), 1);
        let summary = ledger.summary();
        assert_eq!(summary.get(&ErrorCategory::Network), Some(&1));
        assert!(ledger.export()[0].message.starts_with("journal:joo"));
    }
}
