//! One full update cycle for one instance.
//!
//! ```text
//!  Idle ─▶ Locking ─▶ Discovering ─▶ Fetching ─▶ Processing ─▶ Reporting ─▶ Idle
//!             │            │             │            │
//!             └────────────┴──────┬──────┴────────────┘
//!                                 ▼
//!                             Aborting ──▶ Reporting
//! ```
//!
//! The three working stages are pipelined over bounded channels, so the
//! phase names mark which stage is still producing rather than exclusive
//! steps:
//!
//! ```text
//!  discover ──▶ triage ──▶ fetch pool ──▶ process pool
//!   (task)   (CycleState)  (semaphore +    (semaphore +
//!                           token bucket)   timeouts)
//! ```
//!
//! A busy lock yields a `skipped` report. A storage error or a state flush
//! failure cancels the cycle: workers finish their current item, the state is
//! flushed, and the report is `partial`. An outside cancellation ends in
//! `aborted`. Either way the lock is released before returning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use paper_harvest_core::ledger::ErrorLedger;
use paper_harvest_core::models::{
    ClaimOutcome, CompletionStatus, CycleReport, DocumentDescriptor, ErrorCategory, ErrorRecord,
    ProcessingState,
};
use paper_harvest_core::progress::ProgressTracker;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, InstanceConfig};
use crate::embedding::create_embedder;
use crate::error::{HarvestError, HarvestResult};
use crate::extract::PdfExtractor;
use crate::fetch::{ArtifactTransport, FetchOutcome, FetchedArtifact, HttpTransport, RateLimitedFetcher};
use crate::process::{
    Chunker, ContentExtractor, Embedder, IngestionProcessor, ParagraphChunker, ProcessorOptions,
    Settled, VectorStore,
};
use crate::progress::{CycleProgressEvent, CycleProgressReporter, NoProgress};
use crate::sources::{
    DiscoveryRequest, HttpMetadataClient, MetadataClient, SourceAdapter, SourceDiscoverer,
};
use crate::state::{CycleState, StateStore};
use crate::storage::StorageMonitor;
use crate::vector_store::SqliteVectorStore;

const DISCOVERY_CHANNEL: usize = 256;
const WORK_CHANNEL: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Locking,
    Discovering,
    Fetching,
    Processing,
    Reporting,
    Aborting,
}

#[derive(Debug, Clone, Default)]
pub struct CycleOptions {
    /// Forward at most this many unprocessed documents to the fetch pool.
    pub max_items: Option<usize>,
    /// Discover and count only; nothing is written.
    pub dry_run: bool,
    /// Override `checkpoint.retry_failed`.
    pub retry_failed: Option<bool>,
    /// The caller expects an interrupted cycle (`harvest resume`).
    pub resume: bool,
}

/// External systems a cycle talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub metadata: Arc<dyn MetadataClient>,
    pub transport: Arc<dyn ArtifactTransport>,
    pub extractor: Arc<dyn ContentExtractor>,
    pub chunker: Arc<dyn Chunker>,
    pub embedder: Arc<dyn Embedder>,
    pub store: Arc<dyn VectorStore>,
}

impl Collaborators {
    /// Default HTTP, PDF, embedding, and SQLite implementations.
    pub async fn from_config(config: &Config, instance: &InstanceConfig) -> HarvestResult<Self> {
        Ok(Self {
            metadata: Arc::new(HttpMetadataClient::new(&config.http)?),
            transport: Arc::new(HttpTransport::new(&config.http, &instance.fetch)?),
            extractor: Arc::new(PdfExtractor),
            chunker: Arc::new(ParagraphChunker),
            embedder: create_embedder(&config.embedding)?,
            store: Arc::new(SqliteVectorStore::open(&config.vector_store_path()).await?),
        })
    }
}

/// Bookkeeping shared by the stages of one running cycle.
struct CycleRun<'a> {
    instance: &'a str,
    state: CycleState,
    ledger: Arc<ErrorLedger>,
    cancel: CancellationToken,
    fatal: Mutex<Option<HarvestError>>,
    tracker: Mutex<ProgressTracker>,
    progress: &'a dyn CycleProgressReporter,
    forwarded: AtomicU64,
}

impl CycleRun<'_> {
    /// Record the first cycle-fatal error and stop taking work.
    fn abort_with(&self, error: HarvestError) {
        tracing::error!(instance = self.instance, error = %error, "cycle aborting");
        let mut slot = self.fatal.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        }
        self.cancel.cancel();
    }

    fn take_fatal(&self) -> Option<HarvestError> {
        self.fatal.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    fn settled(&self, id: &str) {
        let snapshot = {
            let mut tracker = self.tracker.lock().unwrap_or_else(|p| p.into_inner());
            tracker.advance(1, id);
            tracker.snapshot()
        };
        self.progress.report(CycleProgressEvent::Working {
            instance: self.instance.to_string(),
            snapshot,
        });
    }

    fn forward(&self) {
        let n = self.forwarded.fetch_add(1, Ordering::SeqCst) + 1;
        self.tracker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .revise_total(n);
    }

    /// Settle a failed download. A cycle-fatal error leaves the document
    /// pending instead, so the resumed cycle picks it up again.
    async fn record_failure(&self, id: &str, error: HarvestError, retries: u32) {
        let record = error.to_record(Some(id), retries);
        self.ledger.record(record.clone());
        if error.is_fatal() {
            self.state.release(id);
            self.abort_with(error);
            return;
        }
        if let Err(e) = self.state.mark_failed(id, &record).await {
            self.abort_with(e);
        }
        self.settled(id);
    }
}

fn receiver_stream<T>(rx: mpsc::Receiver<T>) -> impl futures::Stream<Item = T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

pub struct InstanceUpdateOrchestrator {
    config: Arc<Config>,
    instance: InstanceConfig,
    store: StateStore,
    collaborators: Collaborators,
    progress: Arc<dyn CycleProgressReporter>,
    phase: Mutex<CyclePhase>,
}

impl InstanceUpdateOrchestrator {
    pub fn new(
        config: Arc<Config>,
        instance: &str,
        collaborators: Collaborators,
    ) -> HarvestResult<Self> {
        let instance = config
            .instance(instance)
            .map_err(|e| HarvestError::Configuration(e.to_string()))?
            .clone();
        let store = StateStore::new(config.storage.data_root.clone());
        Ok(Self {
            config,
            instance,
            store,
            collaborators,
            progress: Arc::new(NoProgress),
            phase: Mutex::new(CyclePhase::Idle),
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn CycleProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn instance(&self) -> &InstanceConfig {
        &self.instance
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn enter(&self, phase: CyclePhase) {
        let mut current = self.phase.lock().unwrap_or_else(|p| p.into_inner());
        if *current != phase {
            tracing::debug!(instance = %self.instance.name, from = ?*current, to = ?phase, "phase");
            *current = phase;
        }
    }

    /// Run one cycle to completion, cancellation, or abort. Never fails:
    /// every outcome is expressed in the report.
    pub async fn run_cycle(&self, options: CycleOptions, cancel: CancellationToken) -> CycleReport {
        let started_at = Utc::now();
        let name = self.instance.name.clone();
        tracing::info!(instance = %name, dry_run = options.dry_run, max_items = ?options.max_items, "cycle starting");

        self.enter(CyclePhase::Locking);
        let lock = if options.dry_run {
            None
        } else {
            if let Err(e) = self.store.ensure_layout(&name) {
                self.enter(CyclePhase::Idle);
                return CycleReport::aborted_before_start(&name, e.to_record(None, 0), started_at);
            }
            match self.store.acquire_lock(&name, Duration::ZERO).await {
                Ok(lock) => Some(lock),
                Err(HarvestError::LockBusy(_)) => {
                    let holder = self
                        .store
                        .lock_holder(&name)
                        .map(|h| h.replace('\n', " "))
                        .unwrap_or_else(|| "unknown holder".to_string());
                    tracing::warn!(instance = %name, holder = %holder, "instance is locked, skipping");
                    self.enter(CyclePhase::Idle);
                    return CycleReport::skipped(&name, format!("lock busy ({})", holder));
                }
                Err(e) => {
                    self.enter(CyclePhase::Idle);
                    return CycleReport::aborted_before_start(&name, e.to_record(None, 0), started_at);
                }
            }
        };

        let state = match self.initial_state(&options, started_at) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(instance = %name, error = %e, "cannot load state");
                drop(lock);
                self.enter(CyclePhase::Idle);
                return CycleReport::aborted_before_start(&name, e.to_record(None, 0), started_at);
            }
        };

        let report = self.run_locked(state, &options, cancel, started_at).await;

        if !options.dry_run {
            if let Err(e) = self.store.save_report(&name, &report) {
                tracing::error!(instance = %name, error = %e, "failed to save cycle report");
            }
        }
        if let Some(lock) = lock {
            self.store.release_lock(lock);
        }
        self.progress.report(CycleProgressEvent::Finished {
            instance: name.clone(),
            status: report.status.to_string(),
        });
        tracing::info!(
            instance = %name,
            status = %report.status,
            discovered = report.counts.discovered,
            processed = report.counts.processed,
            failed = report.counts.failed,
            skipped = report.counts.skipped,
            pending = report.pending,
            duration_secs = report.duration_secs,
            "cycle finished"
        );
        self.enter(CyclePhase::Idle);
        report
    }

    /// Resume an interrupted cycle, or start the next one.
    fn initial_state(
        &self,
        options: &CycleOptions,
        now: chrono::DateTime<Utc>,
    ) -> HarvestResult<ProcessingState> {
        let name = &self.instance.name;
        match self.store.load(name)? {
            Some(state) if !state.is_complete() => {
                tracing::info!(
                    instance = %name,
                    cycle = %state.cycle_id,
                    processed = state.counters.processed,
                    failed = state.counters.failed,
                    batches = state.cursor.flushed_batches,
                    "resuming interrupted cycle"
                );
                Ok(state)
            }
            Some(previous) => {
                if options.resume {
                    tracing::warn!(instance = %name, "no interrupted cycle to resume, starting a new one");
                }
                Ok(previous.next_cycle(now))
            }
            None => {
                if options.resume {
                    tracing::warn!(instance = %name, "no saved state to resume, starting a new cycle");
                }
                Ok(ProcessingState::new(name.clone(), now))
            }
        }
    }

    async fn run_locked(
        &self,
        state: ProcessingState,
        options: &CycleOptions,
        outer_cancel: CancellationToken,
        started_at: chrono::DateTime<Utc>,
    ) -> CycleReport {
        let instance = &self.instance;
        let retry_failed = options
            .retry_failed
            .unwrap_or(instance.checkpoint.retry_failed);
        let state_failures = state.failures_this_cycle();
        if !state_failures.is_empty() {
            tracing::info!(
                instance = %instance.name,
                failures = state_failures.len(),
                "carrying failures of the interrupted run"
            );
        }
        let cycle_state = if options.dry_run {
            CycleState::ephemeral(state, self.store.clone(), retry_failed)
        } else {
            CycleState::new(
                state,
                self.store.clone(),
                instance.checkpoint.batch_size,
                retry_failed,
            )
        };

        let run = CycleRun {
            instance: &instance.name,
            state: cycle_state,
            ledger: Arc::new(ErrorLedger::with_records(state_failures)),
            cancel: outer_cancel.child_token(),
            fatal: Mutex::new(None),
            tracker: Mutex::new(ProgressTracker::new()),
            progress: self.progress.as_ref(),
            forwarded: AtomicU64::new(0),
        };
        run.state.begin_discovery();
        if let Err(e) = run.state.flush().await {
            run.abort_with(e);
        }
        run.tracker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .start(0);

        if !run.cancel.is_cancelled() {
            self.pipeline(&run, options).await;
        }

        let fatal = run.take_fatal();
        let cancelled = outer_cancel.is_cancelled();
        if fatal.is_some() || cancelled {
            self.enter(CyclePhase::Aborting);
        }
        self.enter(CyclePhase::Reporting);

        let snapshot = run.state.snapshot();
        let pending = snapshot.pending();
        let (status, reason) = match (&fatal, cancelled) {
            (Some(e), _) => {
                if !run.ledger.has_fatal() {
                    run.ledger.record(e.to_record(None, 0).fatal());
                }
                (CompletionStatus::Partial, Some(e.to_string()))
            }
            (None, true) => (CompletionStatus::Aborted, Some("cancelled".to_string())),
            (None, false) if options.dry_run => (CompletionStatus::Success, Some("dry run".to_string())),
            (None, false) if pending > 0 => (
                CompletionStatus::Partial,
                Some(format!("stopped after max_items; {} documents pending", pending)),
            ),
            (None, false) if run.ledger.is_empty() && snapshot.counters.failed == 0 => {
                (CompletionStatus::Success, None)
            }
            (None, false) => (CompletionStatus::Partial, None),
        };

        if !options.dry_run {
            let finalize = if fatal.is_none() && !cancelled && pending == 0 {
                run.state.complete().await
            } else {
                run.state.flush().await
            };
            if let Err(e) = finalize {
                tracing::error!(instance = %instance.name, error = %e, "final state flush failed");
                run.ledger.record(e.to_record(None, 0));
            }
        }

        let storage = if options.dry_run {
            None
        } else {
            let monitor = StorageMonitor::new(self.store.clone());
            if status == CompletionStatus::Success && instance.retention.auto_delete {
                if let Err(e) = monitor.apply_retention(instance, &run.state.snapshot(), Utc::now()) {
                    tracing::warn!(instance = %instance.name, error = %e, "retention failed");
                }
            }
            Some(monitor.usage(instance))
        };

        let errors = run.ledger.export();
        if !options.dry_run {
            match self
                .store
                .export_errors(&instance.name, snapshot.cycle_id, &errors)
            {
                Ok(Some(path)) => {
                    tracing::info!(instance = %instance.name, path = %path.display(), records = errors.len(), "error log exported")
                }
                Ok(None) => {}
                Err(e) => tracing::error!(instance = %instance.name, error = %e, "error export failed"),
            }
        }

        let counts = snapshot.counters.clone();
        let attempted = counts.processed + counts.failed;
        let failure_ratio = if attempted == 0 {
            0.0
        } else {
            counts.failed as f64 / attempted as f64
        };
        let within_tolerance = status != CompletionStatus::Aborted
            && fatal.is_none()
            && failure_ratio <= instance.max_failure_ratio;

        let finished_at = Utc::now();
        CycleReport {
            instance: instance.name.clone(),
            cycle_id: Some(snapshot.cycle_id),
            started_at,
            finished_at,
            duration_secs: (finished_at - started_at).num_milliseconds().max(0) as f64 / 1000.0,
            counts,
            pending,
            storage,
            error_summary: run.ledger.summary(),
            errors,
            status,
            reason,
            within_tolerance,
        }
    }

    fn discoverer(&self, run: &CycleRun<'_>) -> SourceDiscoverer {
        SourceDiscoverer::new(
            SourceAdapter::for_instance(&self.instance),
            self.collaborators.metadata.clone(),
            self.instance.retry.policy(),
            run.ledger.clone(),
            run.cancel.clone(),
        )
    }

    fn fetcher(&self, run: &CycleRun<'_>) -> RateLimitedFetcher {
        RateLimitedFetcher::new(
            self.collaborators.transport.clone(),
            self.store.artifacts_dir(&self.instance.name),
            &self.instance.fetch,
            self.instance.retry.policy(),
            run.cancel.clone(),
        )
    }

    fn processor(&self) -> IngestionProcessor {
        IngestionProcessor::new(
            self.instance.name.clone(),
            self.collaborators.extractor.clone(),
            self.collaborators.chunker.clone(),
            self.collaborators.embedder.clone(),
            self.collaborators.store.clone(),
            ProcessorOptions {
                strategy: self.config.chunking.strategy(),
                embed_batch_size: self.config.embedding.batch_size,
                timeout: Duration::from_secs(self.instance.process.timeout_secs),
                concurrency: self.instance.process.concurrency,
            },
        )
    }

    async fn pipeline(&self, run: &CycleRun<'_>, options: &CycleOptions) {
        let discoverer = self.discoverer(run);
        let fetcher = self.fetcher(run);
        let processor = self.processor();
        let request = DiscoveryRequest::for_instance(&self.instance, Utc::now());
        tracing::info!(
            instance = %self.instance.name,
            from = %request.window.from,
            until = %request.window.until,
            sources = discoverer.adapters().len(),
            "discovery window"
        );

        let (disc_tx, disc_rx) = mpsc::channel::<DocumentDescriptor>(DISCOVERY_CHANNEL);
        let (fetch_tx, fetch_rx) = mpsc::channel::<DocumentDescriptor>(WORK_CHANNEL);
        let (proc_tx, proc_rx) = mpsc::channel::<FetchedArtifact>(WORK_CHANNEL);

        self.enter(CyclePhase::Discovering);
        run.progress.report(CycleProgressEvent::Discovering {
            instance: self.instance.name.clone(),
        });

        let discovery = async move {
            let stats = discoverer.discover(&request, disc_tx).await;
            self.enter(CyclePhase::Fetching);
            stats
        };

        let triage = self.triage(run, options, disc_rx, fetch_tx);

        let fetch_stage = async move {
            let proc_tx = proc_tx;
            receiver_stream(fetch_rx)
                .for_each_concurrent(self.instance.fetch.concurrency.max(1), |descriptor| {
                    let fetcher = &fetcher;
                    let proc_tx = &proc_tx;
                    async move {
                        let id = descriptor.id.clone();
                        match fetcher.fetch_unprocessed(&run.state, descriptor).await {
                            FetchOutcome::Fetched(artifact) => {
                                if proc_tx.send(artifact).await.is_err() {
                                    run.state.release(&id);
                                }
                            }
                            FetchOutcome::Failed(failure) => {
                                run.record_failure(&id, failure.error, failure.retries).await;
                            }
                            FetchOutcome::NotClaimed(_) | FetchOutcome::Cancelled(_) => {}
                        }
                    }
                })
                .await;
            self.enter(CyclePhase::Processing);
        };

        let process_stage = receiver_stream(proc_rx).for_each_concurrent(
            self.instance.process.concurrency.max(1),
            |artifact| {
                let processor = &processor;
                async move {
                    let id = artifact.descriptor.id.clone();
                    if run.cancel.is_cancelled() {
                        run.state.release(&id);
                        return;
                    }
                    match processor
                        .process_and_record(&run.state, &run.ledger, &artifact)
                        .await
                    {
                        Ok(Settled::Processed { .. }) | Ok(Settled::Failed(_)) => run.settled(&id),
                        Err(e) => {
                            run.settled(&id);
                            run.abort_with(e);
                        }
                    }
                }
            },
        );

        let (stats, _, _, _) = tokio::join!(discovery, triage, fetch_stage, process_stage);
        tracing::debug!(instance = %self.instance.name, ?stats, "pipeline drained");
    }

    /// Count each discovered document and forward the claimable ones.
    async fn triage(
        &self,
        run: &CycleRun<'_>,
        options: &CycleOptions,
        mut disc_rx: mpsc::Receiver<DocumentDescriptor>,
        fetch_tx: mpsc::Sender<DocumentDescriptor>,
    ) {
        let limit = options.max_items.map(|n| n as u64).unwrap_or(u64::MAX);
        let mut limit_logged = false;
        loop {
            let descriptor = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => break,
                next = disc_rx.recv() => match next {
                    Some(d) => d,
                    None => break,
                },
            };
            match run.state.discovered(&descriptor.id) {
                ClaimOutcome::Claimed => {}
                outcome => {
                    tracing::trace!(id = %descriptor.id, ?outcome, "not forwarded");
                    continue;
                }
            }
            if options.dry_run {
                continue;
            }
            if run.forwarded.load(Ordering::SeqCst) >= limit {
                if !limit_logged {
                    tracing::info!(instance = run.instance, limit, "max_items reached, remaining documents stay pending");
                    limit_logged = true;
                }
                continue;
            }
            run.forward();
            if fetch_tx.send(descriptor).await.is_err() {
                break;
            }
        }
    }
}

/// Ledger entry for a cycle that could not even be built.
pub fn setup_failure(instance: &str, error: &HarvestError) -> CycleReport {
    let record = ErrorRecord::new(
        match error {
            HarvestError::Configuration(_) => ErrorCategory::Validation,
            other => other.category(),
        },
        error.to_string(),
    )
    .fatal();
    CycleReport::aborted_before_start(instance, record, Utc::now())
}
