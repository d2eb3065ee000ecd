//! TOML configuration.
//!
//! One file configures the shared pieces (storage root, chunking, embedding,
//! vector store, schedule, notification, HTTP client) and every instance under
//! `[instances.<name>]`. Instances are isolated corpora: each has its own
//! sources, worker pools, retry policy, checkpoint cadence, and retention.
//!
//! ```toml
//! [storage]
//! data_root = "./data"
//!
//! [instances.physics.archive]
//! categories = ["physics.optics", "quant-ph"]
//!
//! [instances.physics.window]
//! days = 31
//! ```
//!
//! Validation happens once in [`load_config`]; a config that loads is safe to
//! hand to the orchestrator.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use paper_harvest_core::chunk::ChunkingStrategy;
use paper_harvest_core::retry::RetryPolicy;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceConfig>,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub fn strategy(&self) -> ChunkingStrategy {
        ChunkingStrategy {
            max_tokens: self.max_tokens,
            overlap_tokens: self.overlap_tokens,
        }
    }
}

fn default_max_tokens() -> usize {
    700
}
fn default_overlap() -> usize {
    0
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_embed_retries(),
            timeout_secs: default_embed_timeout_secs(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embed_retries() -> u32 {
    5
}
fn default_embed_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct VectorStoreConfig {
    /// SQLite file; defaults to `<data_root>/vectors.sqlite`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_instance_timeout_secs")]
    pub instance_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_instances")]
    pub max_concurrent_instances: usize,
    /// Time a cancelled instance gets to flush state before it is abandoned.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    #[serde(default = "default_cron")]
    pub cron: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            instance_timeout_secs: default_instance_timeout_secs(),
            max_concurrent_instances: default_max_concurrent_instances(),
            grace_secs: default_grace_secs(),
            cron: default_cron(),
        }
    }
}

fn default_instance_timeout_secs() -> u64 {
    6 * 3600
}
fn default_max_concurrent_instances() -> usize {
    2
}
fn default_grace_secs() -> u64 {
    30
}
fn default_cron() -> String {
    "0 3 1 * *".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotifyConfig {
    #[serde(default)]
    pub recipients: Vec<String>,
    /// When set, reports are POSTed here as JSON.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Which single-instance cycles (`run-cycle`, `resume`) are reported.
    #[serde(default)]
    pub on_cycle: CycleNotifyPolicy,
}

/// When a single cycle report goes to the notifier. Scheduled periods are
/// always reported.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CycleNotifyPolicy {
    Never,
    /// Only when storage crossed the warning or critical threshold.
    #[default]
    Threshold,
    Always,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_user_agent() -> String {
    format!("paper-harvest/{}", env!("CARGO_PKG_VERSION"))
}
fn default_http_timeout_secs() -> u64 {
    60
}

// ============ Instances ============

#[derive(Debug, Deserialize, Clone)]
pub struct InstanceConfig {
    /// Filled from the table key by [`load_config`].
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub archive: Option<ArchiveSourceConfig>,
    #[serde(default)]
    pub journals: Vec<JournalSourceConfig>,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Failed / attempted ratio above which a partial cycle counts as fatal.
    #[serde(default = "default_max_failure_ratio")]
    pub max_failure_ratio: f64,
}

fn default_max_failure_ratio() -> f64 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveSourceConfig {
    #[serde(default = "default_archive_url")]
    pub base_url: String,
    pub categories: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_archive_interval_ms")]
    pub min_request_interval_ms: u64,
}

fn default_archive_url() -> String {
    "https://export.arxiv.org/api/query".to_string()
}
fn default_page_size() -> usize {
    100
}
fn default_archive_interval_ms() -> u64 {
    3000
}

#[derive(Debug, Deserialize, Clone)]
pub struct JournalSourceConfig {
    pub name: String,
    pub feed_url: String,
    /// Category assigned to every item of this journal.
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_journal_interval_ms")]
    pub min_request_interval_ms: u64,
}

fn default_journal_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct WindowConfig {
    /// Look-back from "now" when `since` is not set.
    #[serde(default = "default_window_days")]
    pub days: u32,
    #[serde(default)]
    pub since: Option<NaiveDate>,
    #[serde(default)]
    pub until: Option<NaiveDate>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            days: default_window_days(),
            since: None,
            until: None,
        }
    }
}

fn default_window_days() -> u32 {
    31
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_rps")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    /// Accepted leading bytes of a downloaded artifact.
    #[serde(default = "default_accept_signatures")]
    pub accept_signatures: Vec<String>,
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_fetch_concurrency(),
            requests_per_second: default_rps(),
            burst: default_burst(),
            timeout_secs: default_fetch_timeout_secs(),
            accept_signatures: default_accept_signatures(),
            max_artifact_bytes: default_max_artifact_bytes(),
        }
    }
}

fn default_fetch_concurrency() -> usize {
    4
}
fn default_rps() -> f64 {
    1.0
}
fn default_burst() -> u32 {
    1
}
fn default_fetch_timeout_secs() -> u64 {
    120
}
fn default_accept_signatures() -> Vec<String> {
    vec!["%PDF-".to_string()]
}
fn default_max_artifact_bytes() -> u64 {
    100 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessConfig {
    #[serde(default = "default_process_concurrency")]
    pub concurrency: usize,
    /// Applied to every collaborator call (extract, chunk, embed, upsert).
    #[serde(default = "default_process_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            concurrency: default_process_concurrency(),
            timeout_secs: default_process_timeout_secs(),
        }
    }
}

fn default_process_concurrency() -> usize {
    2
}
fn default_process_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter)
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_jitter() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointConfig {
    /// Settled documents between state flushes.
    #[serde(default = "default_checkpoint_batch")]
    pub batch_size: u64,
    /// Re-attempt documents that failed in earlier cycles.
    #[serde(default)]
    pub retry_failed: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            batch_size: default_checkpoint_batch(),
            retry_failed: false,
        }
    }
}

fn default_checkpoint_batch() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    #[serde(default = "default_warn_percent")]
    pub warn_percent: f64,
    #[serde(default = "default_critical_percent")]
    pub critical_percent: f64,
    /// Budget for this instance; when unset, percentages are of the filesystem.
    #[serde(default)]
    pub quota_bytes: Option<u64>,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub max_artifact_age_days: Option<u32>,
    #[serde(default = "default_keep_archived_states")]
    pub keep_archived_states: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            warn_percent: default_warn_percent(),
            critical_percent: default_critical_percent(),
            quota_bytes: None,
            auto_delete: false,
            max_artifact_age_days: None,
            keep_archived_states: default_keep_archived_states(),
        }
    }
}

fn default_warn_percent() -> f64 {
    80.0
}
fn default_critical_percent() -> f64 {
    95.0
}
fn default_keep_archived_states() -> usize {
    12
}

impl Config {
    pub fn instance(&self, name: &str) -> Result<&InstanceConfig> {
        self.instances.get(name).with_context(|| {
            let known: Vec<&str> = self.instances.keys().map(String::as_str).collect();
            format!(
                "Unknown instance '{}'. Configured instances: {}",
                name,
                if known.is_empty() {
                    "(none)".to_string()
                } else {
                    known.join(", ")
                }
            )
        })
    }

    pub fn vector_store_path(&self) -> PathBuf {
        self.vector_store
            .path
            .clone()
            .unwrap_or_else(|| self.storage.data_root.join("vectors.sqlite"))
    }
}

/// Instance names become directory names and vector store collections.
fn is_valid_instance_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    for (name, instance) in config.instances.iter_mut() {
        instance.name = name.clone();
    }

    // Validate chunking
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    // Validate schedule
    if config.schedule.max_concurrent_instances == 0 {
        bail!("schedule.max_concurrent_instances must be >= 1");
    }
    if config.schedule.cron.split_whitespace().count() != 5 {
        bail!(
            "schedule.cron must have five fields, got '{}'",
            config.schedule.cron
        );
    }

    for (name, instance) in &config.instances {
        validate_instance(name, instance)?;
    }

    Ok(config)
}

fn validate_instance(name: &str, instance: &InstanceConfig) -> Result<()> {
    if !is_valid_instance_name(name) {
        bail!(
            "instance name '{}' may only contain letters, digits, '-' and '_'",
            name
        );
    }

    let has_archive = instance
        .archive
        .as_ref()
        .is_some_and(|a| !a.categories.is_empty());
    if !has_archive && instance.journals.is_empty() {
        bail!(
            "instances.{} needs at least one source (archive categories or journals)",
            name
        );
    }
    if let Some(archive) = &instance.archive {
        if archive.page_size == 0 {
            bail!("instances.{}.archive.page_size must be > 0", name);
        }
    }
    for journal in &instance.journals {
        if journal.name.is_empty() || journal.name.contains(':') {
            bail!(
                "instances.{}: journal name '{}' must be non-empty and contain no ':'",
                name,
                journal.name
            );
        }
    }

    if let (Some(since), Some(until)) = (instance.window.since, instance.window.until) {
        if since > until {
            bail!("instances.{}.window.since must be <= until", name);
        }
    }
    if instance.window.since.is_none() && instance.window.days == 0 {
        bail!("instances.{}.window.days must be > 0", name);
    }

    if instance.fetch.concurrency == 0 {
        bail!("instances.{}.fetch.concurrency must be >= 1", name);
    }
    if instance.fetch.requests_per_second <= 0.0 || !instance.fetch.requests_per_second.is_finite()
    {
        bail!("instances.{}.fetch.requests_per_second must be > 0", name);
    }
    if instance.fetch.burst == 0 {
        bail!("instances.{}.fetch.burst must be >= 1", name);
    }
    if instance.fetch.max_artifact_bytes == 0 {
        bail!("instances.{}.fetch.max_artifact_bytes must be > 0", name);
    }
    if instance.process.concurrency == 0 {
        bail!("instances.{}.process.concurrency must be >= 1", name);
    }
    if instance.retry.base_delay_ms > instance.retry.max_delay_ms {
        bail!(
            "instances.{}.retry.base_delay_ms must be <= max_delay_ms",
            name
        );
    }
    if instance.checkpoint.batch_size == 0 {
        bail!("instances.{}.checkpoint.batch_size must be >= 1", name);
    }
    if !(0.0..=1.0).contains(&instance.max_failure_ratio) {
        bail!("instances.{}.max_failure_ratio must be in [0.0, 1.0]", name);
    }

    let retention = &instance.retention;
    if !(0.0 < retention.warn_percent
        && retention.warn_percent < retention.critical_percent
        && retention.critical_percent <= 100.0)
    {
        bail!(
            "instances.{}.retention: need 0 < warn_percent < critical_percent <= 100",
            name
        );
    }
    if retention.auto_delete && retention.max_artifact_age_days.is_none() {
        bail!(
            "instances.{}.retention.auto_delete requires max_artifact_age_days",
            name
        );
    }

    Ok(())
}
