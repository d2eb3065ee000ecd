//! Data model for an ingestion cycle.
//!
//! These types flow through every stage of the pipeline: descriptors come
//! out of discovery, [`ProcessingState`] is the durable checkpoint, and
//! [`CycleReport`] is the immutable outcome handed to notification.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which kind of source produced a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginType {
    /// Bulk archive listing (arXiv-style).
    Archive,
    /// Journal table-of-contents index.
    Journal,
}

impl OriginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginType::Archive => "archive",
            OriginType::Journal => "journal",
        }
    }
}

/// Source-agnostic description of a candidate document, before download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentDescriptor {
    /// Stable identifier, unique across sources (e.g. `arxiv:2401.01234`).
    pub id: String,
    pub origin: OriginType,
    /// Label of the adapter that produced it (e.g. `archive:arxiv`).
    pub source: String,
    pub title: String,
    pub authors: Vec<String>,
    pub published: DateTime<Utc>,
    /// Where the artifact is downloaded from.
    pub url: String,
    pub categories: Vec<String>,
    /// Arbitrary source metadata (always a JSON object).
    pub metadata: serde_json::Value,
}

/// A chunk of extracted document text, ready for embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    /// `<document id>#<index>`; stable across re-processing.
    pub id: String,
    pub document_id: String,
    pub index: usize,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

/// Classification attached to every recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Network,
    Parse,
    Storage,
    Validation,
    /// Default bucket for failures that fit no other category.
    Processing,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Parse => "parse",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Processing => "processing",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured failure observed during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub category: ErrorCategory,
    pub document_id: Option<String>,
    pub message: String,
    pub retry_count: u32,
    pub fatal: bool,
}

impl ErrorRecord {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            document_id: None,
            message: message.into(),
            retry_count: 0,
            fatal: false,
        }
    }

    pub fn for_document(mut self, id: impl Into<String>) -> Self {
        self.document_id = Some(id.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

/// Marker stored for every successfully processed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEntry {
    pub cycle_id: Uuid,
    pub at: DateTime<Utc>,
}

/// Last failure summary for a document in the negative cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub category: ErrorCategory,
    pub message: String,
    pub retries: u32,
    pub cycle_id: Uuid,
    pub at: DateTime<Utc>,
}

/// Aggregate per-cycle counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub discovered: u64,
    pub downloaded: u64,
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Position of the checkpoint within the current cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCursor {
    /// Number of batch boundaries flushed so far.
    pub flushed_batches: u64,
    /// Documents settled (processed or failed) since the last flush.
    pub since_flush: u64,
}

/// Result of asking the state whether a document should be worked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Eligible; for [`ProcessingState::claim`] it is now in flight.
    Claimed,
    /// Already processed during this cycle (resumed cycle).
    ProcessedThisCycle,
    /// Already failed during this cycle.
    FailedThisCycle,
    /// Processed by an earlier cycle.
    SkippedProcessed,
    /// Failed in an earlier cycle and failed retries are disabled.
    SkippedFailed,
    /// Another worker holds it.
    InFlight,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }

    /// Whether the outcome counts toward the cycle's `skipped` counter.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            ClaimOutcome::SkippedProcessed | ClaimOutcome::SkippedFailed
        )
    }
}

/// Durable per-instance progress record.
///
/// A document id lives in at most one of `processed`, `failed`, and
/// `in_flight`. `in_flight` is never persisted: after a crash those
/// documents are simply pending again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub instance: String,
    pub cycle_id: Uuid,
    pub cycle_started: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub processed: BTreeMap<String, ProcessedEntry>,
    #[serde(default)]
    pub failed: BTreeMap<String, FailedEntry>,
    #[serde(skip)]
    pub in_flight: BTreeSet<String>,
    /// Downloaded during this cycle but not yet settled. Persisted so a
    /// resumed cycle that reuses the artifact does not count it twice.
    #[serde(default)]
    pub fetched: BTreeSet<String>,
    #[serde(default)]
    pub cursor: BatchCursor,
    #[serde(default)]
    pub counters: Counters,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessingState {
    pub fn new(instance: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            instance: instance.into(),
            cycle_id: Uuid::new_v4(),
            cycle_started: now,
            last_updated: now,
            processed: BTreeMap::new(),
            failed: BTreeMap::new(),
            in_flight: BTreeSet::new(),
            fetched: BTreeSet::new(),
            cursor: BatchCursor::default(),
            counters: Counters::default(),
            completed_at: None,
        }
    }

    /// Start the next cycle, carrying the processed set and the failure
    /// cache forward. Counters and cursor start from zero.
    pub fn next_cycle(&self, now: DateTime<Utc>) -> Self {
        Self {
            processed: self.processed.clone(),
            failed: self.failed.clone(),
            ..Self::new(self.instance.clone(), now)
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Reset the counters that discovery recomputes from scratch. Called at
    /// the start of every (possibly resumed) discovery pass.
    pub fn begin_discovery(&mut self) {
        self.counters.discovered = 0;
        self.counters.skipped = 0;
    }

    pub fn record_discovered(&mut self) {
        self.counters.discovered += 1;
    }

    fn outcome_for(&self, id: &str, retry_failed: bool) -> ClaimOutcome {
        if self.in_flight.contains(id) {
            return ClaimOutcome::InFlight;
        }
        if let Some(entry) = self.processed.get(id) {
            return if entry.cycle_id == self.cycle_id {
                ClaimOutcome::ProcessedThisCycle
            } else {
                ClaimOutcome::SkippedProcessed
            };
        }
        if let Some(entry) = self.failed.get(id) {
            if entry.cycle_id == self.cycle_id {
                return ClaimOutcome::FailedThisCycle;
            }
            if !retry_failed {
                return ClaimOutcome::SkippedFailed;
            }
        }
        ClaimOutcome::Claimed
    }

    /// Classify a freshly discovered document without claiming it. Skips
    /// are counted here, once per discovered descriptor.
    pub fn triage(&mut self, id: &str, retry_failed: bool) -> ClaimOutcome {
        let outcome = self.outcome_for(id, retry_failed);
        if outcome.is_skip() {
            self.counters.skipped += 1;
        }
        outcome
    }

    /// Claim a document for this worker. On [`ClaimOutcome::Claimed`] the id
    /// moves to `in_flight` (and out of a stale failure entry).
    pub fn claim(&mut self, id: &str, retry_failed: bool) -> ClaimOutcome {
        let outcome = self.outcome_for(id, retry_failed);
        if outcome.is_claimed() {
            self.failed.remove(id);
            self.in_flight.insert(id.to_string());
        }
        outcome
    }

    /// Drop a claim without an outcome (cancellation before completion).
    pub fn release(&mut self, id: &str) {
        self.in_flight.remove(id);
    }

    /// Count an obtained artifact once per document and cycle.
    pub fn mark_downloaded(&mut self, id: &str) {
        if self.fetched.insert(id.to_string()) {
            self.counters.downloaded += 1;
        }
    }

    pub fn mark_processed(&mut self, id: &str, now: DateTime<Utc>) {
        self.in_flight.remove(id);
        self.fetched.remove(id);
        self.failed.remove(id);
        self.processed.insert(
            id.to_string(),
            ProcessedEntry {
                cycle_id: self.cycle_id,
                at: now,
            },
        );
        self.counters.processed += 1;
        self.cursor.since_flush += 1;
        self.last_updated = now;
    }

    pub fn mark_failed(&mut self, id: &str, record: &ErrorRecord) {
        self.in_flight.remove(id);
        self.fetched.remove(id);
        self.processed.remove(id);
        self.failed.insert(
            id.to_string(),
            FailedEntry {
                category: record.category,
                message: record.message.clone(),
                retries: record.retry_count,
                cycle_id: self.cycle_id,
                at: record.timestamp,
            },
        );
        self.counters.failed += 1;
        self.cursor.since_flush += 1;
        self.last_updated = record.timestamp;
    }

    /// True once `batch_size` documents have settled since the last flush.
    pub fn at_batch_boundary(&self, batch_size: u64) -> bool {
        self.cursor.since_flush >= batch_size.max(1)
    }

    pub fn mark_flushed(&mut self, now: DateTime<Utc>) {
        if self.cursor.since_flush > 0 {
            self.cursor.flushed_batches += 1;
            self.cursor.since_flush = 0;
        }
        self.last_updated = now;
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        self.last_updated = now;
    }

    /// Discovered this cycle but neither settled nor skipped.
    pub fn pending(&self) -> u64 {
        self.counters.discovered.saturating_sub(
            self.counters.processed + self.counters.failed + self.counters.skipped,
        )
    }

    /// Processed ids whose processing belongs to the current cycle.
    pub fn processed_this_cycle(&self) -> impl Iterator<Item = &str> {
        self.processed
            .iter()
            .filter(move |(_, e)| e.cycle_id == self.cycle_id)
            .map(|(id, _)| id.as_str())
    }

    /// Ledger entries for the documents that failed earlier in this cycle,
    /// oldest first. Used to seed the ledger of a resumed cycle.
    pub fn failures_this_cycle(&self) -> Vec<ErrorRecord> {
        let mut records: Vec<ErrorRecord> = self
            .failed
            .iter()
            .filter(|(_, e)| e.cycle_id == self.cycle_id)
            .map(|(id, e)| ErrorRecord {
                timestamp: e.at,
                category: e.category,
                document_id: Some(id.clone()),
                message: e.message.clone(),
                retry_count: e.retries,
                fatal: false,
            })
            .collect();
        records.sort_by_key(|r| r.timestamp);
        records
    }

    /// Check the membership invariant: no id in more than one set.
    pub fn is_consistent(&self) -> bool {
        let unsettled = |id: &String| !self.processed.contains_key(id) && !self.failed.contains_key(id);
        self.processed.keys().all(|id| !self.failed.contains_key(id))
            && self.in_flight.iter().all(unsettled)
            && self.fetched.iter().all(unsettled)
    }
}

/// Storage threshold verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdLevel {
    Ok,
    Warning,
    Critical,
}

impl ThresholdLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdLevel::Ok => "ok",
            ThresholdLevel::Warning => "warning",
            ThresholdLevel::Critical => "critical",
        }
    }
}

/// Disk usage snapshot for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub percent_used: f64,
    pub level: ThresholdLevel,
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Success,
    Partial,
    Aborted,
    /// Lock busy: another cycle was already running.
    Skipped,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::Success => "success",
            CompletionStatus::Partial => "partial",
            CompletionStatus::Aborted => "aborted",
            CompletionStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_LOCK_BUSY: i32 = 3;

/// Immutable outcome of one instance cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub instance: String,
    pub cycle_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub counts: Counters,
    pub pending: u64,
    pub storage: Option<StorageUsage>,
    pub errors: Vec<ErrorRecord>,
    pub error_summary: BTreeMap<ErrorCategory, usize>,
    pub status: CompletionStatus,
    pub reason: Option<String>,
    /// Failed/attempted ratio stayed within the instance's tolerance.
    pub within_tolerance: bool,
}

impl CycleReport {
    /// Report for a cycle that never started because the lock was held.
    pub fn skipped(instance: impl Into<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            instance: instance.into(),
            cycle_id: None,
            started_at: now,
            finished_at: now,
            duration_secs: 0.0,
            counts: Counters::default(),
            pending: 0,
            storage: None,
            errors: Vec::new(),
            error_summary: BTreeMap::new(),
            status: CompletionStatus::Skipped,
            reason: Some(reason.into()),
            within_tolerance: true,
        }
    }

    /// Report for a cycle that could not start at all (bad configuration,
    /// unreadable state).
    pub fn aborted_before_start(
        instance: impl Into<String>,
        record: ErrorRecord,
        started_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        let mut error_summary = BTreeMap::new();
        error_summary.insert(record.category, 1);
        Self {
            instance: instance.into(),
            cycle_id: None,
            started_at,
            finished_at: now,
            duration_secs: (now - started_at).num_milliseconds().max(0) as f64 / 1000.0,
            counts: Counters::default(),
            pending: 0,
            storage: None,
            reason: Some(record.message.clone()),
            errors: vec![record],
            error_summary,
            status: CompletionStatus::Aborted,
            within_tolerance: false,
        }
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            CompletionStatus::Success => EXIT_SUCCESS,
            CompletionStatus::Partial if self.within_tolerance => EXIT_PARTIAL,
            CompletionStatus::Partial | CompletionStatus::Aborted => EXIT_FATAL,
            CompletionStatus::Skipped => EXIT_LOCK_BUSY,
        }
    }
}

/// All instance reports of one scheduled period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedReport {
    /// Period key, `YYYY-MM`.
    pub period: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reports: Vec<CycleReport>,
}

impl AggregatedReport {
    /// Worst exit code across instances: fatal, then lock busy, then partial.
    pub fn exit_code(&self) -> i32 {
        let codes: Vec<i32> = self.reports.iter().map(CycleReport::exit_code).collect();
        [EXIT_FATAL, EXIT_LOCK_BUSY, EXIT_PARTIAL]
            .into_iter()
            .find(|code| codes.contains(code))
            .unwrap_or(EXIT_SUCCESS)
    }

    pub fn count(&self, status: CompletionStatus) -> usize {
        self.reports.iter().filter(|r| r.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(id: &str) -> ErrorRecord {
        ErrorRecord::new(ErrorCategory::Network, "connection reset")
            .for_document(id)
            .with_retries(3)
    }

    #[test]
    fn claim_moves_to_in_flight_once() {
        let mut state = ProcessingState::new("physics", Utc::now());
        assert_eq!(state.claim("a", false), ClaimOutcome::Claimed);
        assert_eq!(state.claim("a", false), ClaimOutcome::InFlight);
        state.mark_processed("a", Utc::now());
        assert_eq!(state.claim("a", false), ClaimOutcome::ProcessedThisCycle);
        assert!(state.is_consistent());
    }

    #[test]
    fn next_cycle_skips_previous_work() {
        let mut state = ProcessingState::new("physics", Utc::now());
        state.claim("done", false);
        state.mark_processed("done", Utc::now());
        state.claim("bad", false);
        state.mark_failed("bad", &failure("bad"));

        let mut next = state.next_cycle(Utc::now());
        assert_ne!(next.cycle_id, state.cycle_id);
        assert_eq!(next.counters, Counters::default());
        assert_eq!(next.triage("done", false), ClaimOutcome::SkippedProcessed);
        assert_eq!(next.triage("bad", false), ClaimOutcome::SkippedFailed);
        assert_eq!(next.counters.skipped, 2);
    }

    #[test]
    fn retry_failed_reclaims_old_failures() {
        let mut state = ProcessingState::new("physics", Utc::now());
        state.claim("bad", false);
        state.mark_failed("bad", &failure("bad"));
        assert_eq!(state.claim("bad", true), ClaimOutcome::FailedThisCycle);

        let mut next = state.next_cycle(Utc::now());
        assert_eq!(next.claim("bad", true), ClaimOutcome::Claimed);
        assert!(!next.failed.contains_key("bad"));
        assert!(next.is_consistent());
    }

    #[test]
    fn pending_accounts_for_every_discovered_document() {
        let mut state = ProcessingState::new("physics", Utc::now());
        for _ in 0..5 {
            state.record_discovered();
        }
        state.claim("a", false);
        state.mark_processed("a", Utc::now());
        state.claim("b", false);
        state.mark_failed("b", &failure("b"));
        assert_eq!(state.pending(), 3);
    }

    #[test]
    fn batch_boundary_and_flush() {
        let mut state = ProcessingState::new("physics", Utc::now());
        for id in ["a", "b"] {
            state.claim(id, false);
            state.mark_processed(id, Utc::now());
        }
        assert!(!state.at_batch_boundary(3));
        assert!(state.at_batch_boundary(2));
        state.mark_flushed(Utc::now());
        assert_eq!(state.cursor.flushed_batches, 1);
        assert_eq!(state.cursor.since_flush, 0);
    }

    #[test]
    fn in_flight_is_not_serialized() {
        let mut state = ProcessingState::new("physics", Utc::now());
        state.claim("a", false);
        let json = serde_json::to_string(&state).unwrap();
        let mut back: ProcessingState = serde_json::from_str(&json).unwrap();
        assert!(back.in_flight.is_empty());
        assert_eq!(back.claim("a", false), ClaimOutcome::Claimed);
    }

    #[test]
    fn reused_artifact_is_counted_once() {
        let mut state = ProcessingState::new("physics", Utc::now());
        state.claim("a", false);
        state.mark_downloaded("a");
        state.release("a");

        let json = serde_json::to_string(&state).unwrap();
        let mut resumed: ProcessingState = serde_json::from_str(&json).unwrap();
        assert_eq!(resumed.claim("a", false), ClaimOutcome::Claimed);
        resumed.mark_downloaded("a");
        resumed.mark_processed("a", Utc::now());
        assert_eq!(resumed.counters.downloaded, 1);
        assert!(resumed.fetched.is_empty());
        assert!(resumed.is_consistent());
    }

    #[test]
    fn failures_of_this_cycle_rebuild_ledger_entries() {
        let mut state = ProcessingState::new("physics", Utc::now());
        state.claim("old", false);
        state.mark_failed("old", &failure("old"));
        let mut next = state.next_cycle(Utc::now());
        next.claim("new", false);
        next.mark_failed("new", &failure("new"));

        let records = next.failures_this_cycle();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].document_id.as_deref(), Some("new"));
        assert_eq!(records[0].category, ErrorCategory::Network);
        assert_eq!(records[0].retry_count, 3);
    }

    #[test]
    fn exit_codes_follow_status() {
        let mut report = CycleReport::skipped("physics", "busy");
        assert_eq!(report.exit_code(), EXIT_LOCK_BUSY);
        report.status = CompletionStatus::Partial;
        report.within_tolerance = true;
        assert_eq!(report.exit_code(), EXIT_PARTIAL);
        report.within_tolerance = false;
        assert_eq!(report.exit_code(), EXIT_FATAL);
        report.status = CompletionStatus::Success;
        assert_eq!(report.exit_code(), EXIT_SUCCESS);
    }

    #[test]
    fn aggregated_exit_code_prefers_fatal() {
        let mut ok = CycleReport::skipped("a", "busy");
        ok.status = CompletionStatus::Success;
        let busy = CycleReport::skipped("b", "busy");
        let mut agg = AggregatedReport {
            period: "2026-10".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            reports: vec![ok.clone(), busy],
        };
        assert_eq!(agg.exit_code(), EXIT_LOCK_BUSY);
        let mut aborted = ok;
        aborted.status = CompletionStatus::Aborted;
        agg.reports.push(aborted);
        assert_eq!(agg.exit_code(), EXIT_FATAL);
    }
}
