//! Artifact processing: extract → chunk → embed → store.
//!
//! The pipeline only knows the collaborators through the four traits in this
//! module. Default implementations live in [`crate::extract`],
//! [`crate::embedding`], and [`crate::vector_store`]; tests plug in fakes.
//!
//! ```text
//!  FetchedArtifact ──▶ ContentExtractor ──▶ Chunker ──▶ Embedder ──▶ VectorStore
//!                          (timeout)                    (timeout,     (timeout)
//!                                                        batched)
//! ```
//!
//! [`IngestionProcessor::process_and_record`] settles the document in the
//! cycle state: processed on success, failed (with an [`ErrorRecord`] in the
//! ledger) otherwise. Only storage failures escape as errors, because they
//! end the whole cycle.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paper_harvest_core::chunk::{chunk_text, ChunkingStrategy};
use paper_harvest_core::ledger::ErrorLedger;
use paper_harvest_core::models::{DocumentDescriptor, ErrorRecord, TextChunk};
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::error::{HarvestError, HarvestResult};
use crate::fetch::FetchedArtifact;
use crate::state::CycleState;

/// Turns an artifact on disk into plain text.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, path: &Path) -> HarvestResult<String>;
}

pub trait Chunker: Send + Sync {
    fn chunk(&self, document_id: &str, text: &str, strategy: &ChunkingStrategy) -> Vec<TextChunk>;
}

/// Computes one vector per input text, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    /// A disabled embedder is skipped; chunks are stored without vectors.
    fn is_enabled(&self) -> bool {
        true
    }
    async fn embed(&self, texts: &[String]) -> HarvestResult<Vec<Vec<f32>>>;
}

/// Per-collection chunk counts reported by a [`VectorStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub documents: u64,
    pub chunks: u64,
    pub embedded_chunks: u64,
}

/// Destination for chunks and vectors. `collection` is the instance name.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Replace everything stored for `metadata.document_id` in `collection`.
    /// `vectors` is either empty or parallel to `chunks`.
    async fn upsert(
        &self,
        collection: &str,
        chunks: &[TextChunk],
        vectors: &[Vec<f32>],
        metadata: &DocumentMetadata,
    ) -> HarvestResult<()>;

    async fn stats(&self, collection: &str) -> HarvestResult<StoreStats>;
}

/// Metadata stored next to a document's chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentMetadata {
    pub instance: String,
    pub document_id: String,
    pub source: String,
    pub title: String,
    pub authors: Vec<String>,
    pub published: DateTime<Utc>,
    pub url: String,
    pub categories: Vec<String>,
    pub artifact_sha256: String,
    pub extra: serde_json::Value,
}

impl DocumentMetadata {
    pub fn new(instance: &str, descriptor: &DocumentDescriptor, artifact_sha256: &str) -> Self {
        Self {
            instance: instance.to_string(),
            document_id: descriptor.id.clone(),
            source: descriptor.source.clone(),
            title: descriptor.title.clone(),
            authors: descriptor.authors.clone(),
            published: descriptor.published,
            url: descriptor.url.clone(),
            categories: descriptor.categories.clone(),
            artifact_sha256: artifact_sha256.to_string(),
            extra: descriptor.metadata.clone(),
        }
    }
}

/// Chunker backed by the core paragraph chunker.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParagraphChunker;

impl Chunker for ParagraphChunker {
    fn chunk(&self, document_id: &str, text: &str, strategy: &ChunkingStrategy) -> Vec<TextChunk> {
        chunk_text(document_id, text, strategy)
    }
}

/// How a document settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    Processed { chunks: usize },
    Failed(ErrorRecord),
}

pub struct ProcessorOptions {
    pub strategy: ChunkingStrategy,
    pub embed_batch_size: usize,
    pub timeout: Duration,
    pub concurrency: usize,
}

pub struct IngestionProcessor {
    instance: String,
    extractor: Arc<dyn ContentExtractor>,
    chunker: Arc<dyn Chunker>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    options: ProcessorOptions,
    permits: Semaphore,
}

impl IngestionProcessor {
    pub fn new(
        instance: impl Into<String>,
        extractor: Arc<dyn ContentExtractor>,
        chunker: Arc<dyn Chunker>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        options: ProcessorOptions,
    ) -> Self {
        let permits = Semaphore::new(options.concurrency.max(1));
        Self {
            instance: instance.into(),
            extractor,
            chunker,
            embedder,
            store,
            options,
            permits,
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    async fn bounded<T, F>(&self, stage: &str, fut: F) -> HarvestResult<T>
    where
        F: std::future::Future<Output = HarvestResult<T>>,
    {
        match tokio::time::timeout(self.options.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(stage, timeout_secs = self.options.timeout.as_secs(), "collaborator timed out");
                Err(HarvestError::Timeout(self.options.timeout))
            }
        }
    }

    /// Process one artifact. Returns the number of chunks stored.
    pub async fn process(&self, artifact: &FetchedArtifact) -> HarvestResult<usize> {
        let metadata = DocumentMetadata::new(&self.instance, &artifact.descriptor, &artifact.sha256);
        self.process_with_metadata(&artifact.path, &metadata).await
    }

    /// Process with explicit metadata. Metadata for another instance is
    /// refused before any collaborator runs.
    pub async fn process_with_metadata(
        &self,
        path: &Path,
        metadata: &DocumentMetadata,
    ) -> HarvestResult<usize> {
        if metadata.instance != self.instance {
            return Err(HarvestError::Configuration(format!(
                "document {} belongs to instance '{}', not '{}'",
                metadata.document_id, metadata.instance, self.instance
            )));
        }

        let text = self
            .bounded("extract", self.extractor.extract(path))
            .await?;
        if text.trim().is_empty() {
            return Err(HarvestError::Content(format!(
                "no extractable text in {}",
                path.display()
            )));
        }

        let chunks = self
            .chunker
            .chunk(&metadata.document_id, &text, &self.options.strategy);

        let mut vectors = Vec::new();
        if self.embedder.is_enabled() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            for batch in texts.chunks(self.options.embed_batch_size.max(1)) {
                let embedded = self.bounded("embed", self.embedder.embed(batch)).await?;
                if embedded.len() != batch.len() {
                    return Err(HarvestError::Processing(format!(
                        "embedder returned {} vectors for {} chunks",
                        embedded.len(),
                        batch.len()
                    )));
                }
                vectors.extend(embedded);
            }
        }

        self.bounded(
            "store",
            self.store
                .upsert(&self.instance, &chunks, &vectors, metadata),
        )
        .await?;

        tracing::debug!(
            id = %metadata.document_id,
            chunks = chunks.len(),
            embedded = vectors.len(),
            "document processed"
        );
        Ok(chunks.len())
    }

    /// Process and settle the document in `state`, recording failures in
    /// `ledger`. An `Err` means the cycle must abort.
    pub async fn process_and_record(
        &self,
        state: &CycleState,
        ledger: &ErrorLedger,
        artifact: &FetchedArtifact,
    ) -> HarvestResult<Settled> {
        let id = artifact.descriptor.id.as_str();
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| HarvestError::Cancelled)?;

        match self.process(artifact).await {
            Ok(chunks) => {
                state.mark_processed(id).await?;
                Ok(Settled::Processed { chunks })
            }
            Err(error) if error.is_fatal() => {
                // The document is not at fault: leave it pending for the resume.
                ledger.record(error.to_record(Some(id), 0));
                state.release(id);
                Err(error)
            }
            Err(error) => {
                let record = error.to_record(Some(id), 0);
                tracing::warn!(id, category = %record.category, error = %error, "processing failed");
                ledger.record(record.clone());
                state.mark_failed(id, &record).await?;
                Ok(Settled::Failed(record))
            }
        }
    }
}
