//! Rate-limited artifact download.
//!
//! [`RateLimitedFetcher`] downloads the artifact behind a
//! [`DocumentDescriptor`] into `<instance>/artifacts/`. Concurrency is capped
//! by a semaphore, request rate by a [`TokenBucket`], and every attempt runs
//! under the fetch timeout. Failed attempts are retried per the instance's
//! [`RetryPolicy`] with jittered backoff; the sleeps are cancellable.
//!
//! A download is accepted only if it passes the [`IntegrityCheck`]: it must
//! be non-empty, within the size cap, and start with one of the accepted
//! signatures. A corrupt body is treated like a transient network error.
//!
//! Artifacts are written to a temp file and renamed into place, so a crash
//! never leaves a truncated artifact under its final name. An artifact left
//! by an interrupted cycle is reused without a network call when it still
//! passes the integrity check.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use paper_harvest_core::models::{ClaimOutcome, DocumentDescriptor};
use paper_harvest_core::retry::{RetryDecision, RetryPolicy};
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{FetchConfig, HttpConfig};
use crate::error::{HarvestError, HarvestResult};
use crate::state::CycleState;
use crate::throttle::{sleep_or_cancel, TokenBucket};

/// Extensions an artifact may be stored under, in lookup order.
const ARTIFACT_EXTENSIONS: &[&str] = &["pdf", "txt", "bin"];

/// Downloads raw bytes. The HTTP implementation is [`HttpTransport`]; tests
/// substitute in-memory fakes.
#[async_trait]
pub trait ArtifactTransport: Send + Sync {
    /// Fetch `url`, failing once the body grows past `max_bytes`.
    async fn download(&self, url: &str, max_bytes: u64) -> HarvestResult<Vec<u8>>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(http: &HttpConfig, fetch: &FetchConfig) -> HarvestResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(http.user_agent.clone())
            .timeout(Duration::from_secs(fetch.timeout_secs))
            .build()
            .map_err(|e| HarvestError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactTransport for HttpTransport {
    async fn download(&self, url: &str, max_bytes: u64) -> HarvestResult<Vec<u8>> {
        let mut resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HarvestError::Http {
                status: status.as_u16(),
                message: format!("GET {}", url),
                retry_after: crate::sources::retry_after(resp.headers()),
            });
        }
        if let Some(len) = resp.content_length() {
            if len > max_bytes {
                return Err(HarvestError::Integrity(format!(
                    "declared size {} exceeds limit of {} bytes",
                    len, max_bytes
                )));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            body.extend_from_slice(&chunk);
            if body.len() as u64 > max_bytes {
                return Err(HarvestError::Integrity(format!(
                    "body exceeds limit of {} bytes",
                    max_bytes
                )));
            }
        }
        Ok(body)
    }
}

/// Acceptance rules for a downloaded body.
#[derive(Debug, Clone)]
pub struct IntegrityCheck {
    pub max_bytes: u64,
    pub signatures: Vec<Vec<u8>>,
}

impl IntegrityCheck {
    pub fn from_config(fetch: &FetchConfig) -> Self {
        Self {
            max_bytes: fetch.max_artifact_bytes,
            signatures: fetch
                .accept_signatures
                .iter()
                .map(|s| s.as_bytes().to_vec())
                .collect(),
        }
    }

    pub fn verify(&self, body: &[u8]) -> HarvestResult<()> {
        if body.is_empty() {
            return Err(HarvestError::Integrity("empty body".to_string()));
        }
        if body.len() as u64 > self.max_bytes {
            return Err(HarvestError::Integrity(format!(
                "{} bytes exceeds limit of {}",
                body.len(),
                self.max_bytes
            )));
        }
        if !self.signatures.is_empty() && !self.signatures.iter().any(|s| body.starts_with(s)) {
            let head: String = String::from_utf8_lossy(&body[..body.len().min(16)])
                .chars()
                .map(|c| if c.is_control() { '.' } else { c })
                .collect();
            return Err(HarvestError::Integrity(format!(
                "unexpected leading bytes {:?}",
                head
            )));
        }
        Ok(())
    }
}

/// A verified artifact on disk.
#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub descriptor: DocumentDescriptor,
    pub path: PathBuf,
    pub bytes: u64,
    /// SHA-256 of the artifact, hex encoded.
    pub sha256: String,
    /// True when an artifact from an earlier attempt was reused.
    pub reused: bool,
    pub retries: u32,
}

#[derive(Debug)]
pub struct FetchFailure {
    pub descriptor: DocumentDescriptor,
    pub error: HarvestError,
    pub retries: u32,
}

#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(FetchedArtifact),
    Failed(FetchFailure),
    /// The state refused the claim (already settled, skipped, or in flight).
    NotClaimed(ClaimOutcome),
    Cancelled(DocumentDescriptor),
}

/// File stem for a document id: filesystem-safe characters plus a short
/// digest so distinct ids never collide after sanitizing.
pub fn artifact_stem(id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(120)
        .collect();
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    format!("{}-{}", safe, &digest[..8])
}

/// Locate the stored artifact for `id` under `artifacts_dir`.
pub fn find_artifact(artifacts_dir: &Path, id: &str) -> Option<PathBuf> {
    let stem = artifact_stem(id);
    ARTIFACT_EXTENSIONS
        .iter()
        .map(|ext| artifacts_dir.join(format!("{}.{}", stem, ext)))
        .find(|p| p.is_file())
}

fn extension_for(body: &[u8]) -> &'static str {
    if body.starts_with(b"%PDF-") {
        "pdf"
    } else if std::str::from_utf8(body).is_ok() {
        "txt"
    } else {
        "bin"
    }
}

pub struct RateLimitedFetcher {
    transport: Arc<dyn ArtifactTransport>,
    artifacts_dir: PathBuf,
    permits: Semaphore,
    bucket: TokenBucket,
    timeout: Duration,
    policy: RetryPolicy,
    integrity: IntegrityCheck,
    cancel: CancellationToken,
}

impl RateLimitedFetcher {
    pub fn new(
        transport: Arc<dyn ArtifactTransport>,
        artifacts_dir: PathBuf,
        fetch: &FetchConfig,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            artifacts_dir,
            permits: Semaphore::new(fetch.concurrency.max(1)),
            bucket: TokenBucket::new(fetch.requests_per_second, fetch.burst),
            timeout: Duration::from_secs(fetch.timeout_secs),
            policy,
            integrity: IntegrityCheck::from_config(fetch),
            cancel,
        }
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Existing artifact for `id`, if one was written earlier.
    pub fn existing_artifact(&self, id: &str) -> Option<PathBuf> {
        find_artifact(&self.artifacts_dir, id)
    }

    /// Claim `descriptor` in the cycle state and download it. Documents the
    /// state refuses are returned as [`FetchOutcome::NotClaimed`] without
    /// any I/O; a cancelled download releases its claim.
    pub async fn fetch_unprocessed(
        &self,
        state: &CycleState,
        descriptor: DocumentDescriptor,
    ) -> FetchOutcome {
        let claim = state.claim(&descriptor.id);
        if !claim.is_claimed() {
            return FetchOutcome::NotClaimed(claim);
        }
        let outcome = self.fetch(descriptor).await;
        match &outcome {
            FetchOutcome::Fetched(artifact) => state.mark_downloaded(&artifact.descriptor.id),
            FetchOutcome::Cancelled(d) => state.release(&d.id),
            FetchOutcome::Failed(_) | FetchOutcome::NotClaimed(_) => {}
        }
        outcome
    }

    /// Download one artifact, honouring the pool, the rate limit, and the
    /// retry policy.
    pub async fn fetch(&self, descriptor: DocumentDescriptor) -> FetchOutcome {
        if self.cancel.is_cancelled() {
            return FetchOutcome::Cancelled(descriptor);
        }

        match self.reuse_existing(&descriptor).await {
            Ok(Some(artifact)) => return FetchOutcome::Fetched(artifact),
            Ok(None) => {}
            Err(error) => {
                return FetchOutcome::Failed(FetchFailure {
                    descriptor,
                    error,
                    retries: 0,
                })
            }
        }

        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return FetchOutcome::Cancelled(descriptor),
            permit = self.permits.acquire() => match permit {
                Ok(p) => p,
                Err(_) => return FetchOutcome::Cancelled(descriptor),
            },
        };

        let mut retries = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return FetchOutcome::Cancelled(descriptor),
                _ = self.bucket.acquire() => {}
            }

            let attempt = match tokio::time::timeout(
                self.timeout,
                self.transport
                    .download(&descriptor.url, self.integrity.max_bytes),
            )
            .await
            {
                Ok(Ok(body)) => self.integrity.verify(&body).map(|_| body),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(HarvestError::Timeout(self.timeout)),
            };

            let error = match attempt {
                Ok(body) => {
                    return match self.store(&descriptor, &body).await {
                        Ok(path) => {
                            tracing::debug!(
                                id = %descriptor.id,
                                bytes = body.len(),
                                retries,
                                "artifact downloaded"
                            );
                            FetchOutcome::Fetched(FetchedArtifact {
                                sha256: hex::encode(Sha256::digest(&body)),
                                bytes: body.len() as u64,
                                path,
                                descriptor,
                                reused: false,
                                retries,
                            })
                        }
                        Err(error) => FetchOutcome::Failed(FetchFailure {
                            descriptor,
                            error,
                            retries,
                        }),
                    };
                }
                Err(e) => e,
            };

            match self.policy.decide(retries, &error) {
                RetryDecision::RetryAfter(delay) => {
                    let sample: f64 = rand::thread_rng().gen();
                    let delay = self.policy.jittered(delay, sample);
                    tracing::warn!(
                        id = %descriptor.id,
                        error = %error,
                        retry = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "download failed, retrying"
                    );
                    if !sleep_or_cancel(delay, &self.cancel).await {
                        return FetchOutcome::Cancelled(descriptor);
                    }
                    retries += 1;
                }
                RetryDecision::GiveUp => {
                    tracing::warn!(id = %descriptor.id, error = %error, retries, "download failed");
                    return FetchOutcome::Failed(FetchFailure {
                        descriptor,
                        error,
                        retries,
                    });
                }
            }
        }
    }

    async fn reuse_existing(
        &self,
        descriptor: &DocumentDescriptor,
    ) -> HarvestResult<Option<FetchedArtifact>> {
        let Some(path) = self.existing_artifact(&descriptor.id) else {
            return Ok(None);
        };
        let body = tokio::fs::read(&path).await?;
        if let Err(e) = self.integrity.verify(&body) {
            tracing::warn!(id = %descriptor.id, path = %path.display(), error = %e, "discarding invalid artifact");
            tokio::fs::remove_file(&path).await?;
            return Ok(None);
        }
        tracing::debug!(id = %descriptor.id, path = %path.display(), "reusing artifact");
        Ok(Some(FetchedArtifact {
            descriptor: descriptor.clone(),
            bytes: body.len() as u64,
            sha256: hex::encode(Sha256::digest(&body)),
            path,
            reused: true,
            retries: 0,
        }))
    }

    async fn store(&self, descriptor: &DocumentDescriptor, body: &[u8]) -> HarvestResult<PathBuf> {
        tokio::fs::create_dir_all(&self.artifacts_dir).await?;
        let stem = artifact_stem(&descriptor.id);
        let path = self
            .artifacts_dir
            .join(format!("{}.{}", stem, extension_for(body)));
        let tmp = self.artifacts_dir.join(format!("{}.part", stem));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(body).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;
    use chrono::Utc;
    use paper_harvest_core::models::{OriginType, ProcessingState};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const PDF: &[u8] = b"%PDF-1.7\nhello";

    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<HashMap<String, VecDeque<HarvestResult<Vec<u8>>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn push(&self, url: &str, response: HarvestResult<Vec<u8>>) {
            self.script
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(response);
        }
    }

    #[async_trait]
    impl ArtifactTransport for ScriptedTransport {
        async fn download(&self, url: &str, _max_bytes: u64) -> HarvestResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| Err(HarvestError::http(404, url.to_string())))
        }
    }

    fn descriptor(id: &str) -> DocumentDescriptor {
        DocumentDescriptor {
            id: id.to_string(),
            origin: OriginType::Archive,
            source: "archive:arxiv".into(),
            title: "t".into(),
            authors: vec![],
            published: Utc::now(),
            url: format!("https://files.test/{}", id),
            categories: vec![],
            metadata: serde_json::json!({}),
        }
    }

    fn fetcher(dir: &Path, transport: Arc<ScriptedTransport>) -> RateLimitedFetcher {
        let fetch = FetchConfig {
            requests_per_second: 1000.0,
            burst: 10,
            ..FetchConfig::default()
        };
        RateLimitedFetcher::new(
            transport,
            dir.join("artifacts"),
            &fetch,
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            CancellationToken::new(),
        )
    }

    #[test]
    fn integrity_rules() {
        let check = IntegrityCheck::from_config(&FetchConfig::default());
        assert!(check.verify(PDF).is_ok());
        assert!(matches!(check.verify(b""), Err(HarvestError::Integrity(_))));
        assert!(matches!(
            check.verify(b"<html>captcha</html>"),
            Err(HarvestError::Integrity(_))
        ));
        let small = IntegrityCheck {
            max_bytes: 4,
            ..check
        };
        assert!(small.verify(PDF).is_err());
    }

    #[test]
    fn stems_are_safe_and_distinct() {
        let a = artifact_stem("doi:10.1/x");
        let b = artifact_stem("doi_10.1_x");
        assert!(a.starts_with("doi_10.1_x-"));
        assert_ne!(a, b);
        assert!(!artifact_stem("journal:https://x/y?z").contains('/'));
    }

    #[tokio::test]
    async fn writes_artifact_atomically() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        transport.push("https://files.test/arxiv:1", Ok(PDF.to_vec()));
        let f = fetcher(dir.path(), transport);

        let FetchOutcome::Fetched(artifact) = f.fetch(descriptor("arxiv:1")).await else {
            panic!("expected a fetched artifact");
        };
        assert!(!artifact.reused);
        assert_eq!(artifact.path.extension().unwrap(), "pdf");
        assert_eq!(std::fs::read(&artifact.path).unwrap(), PDF);
        let leftovers: Vec<_> = std::fs::read_dir(f.artifacts_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn corrupt_then_valid_body_is_retried() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let url = "https://files.test/arxiv:2";
        transport.push(url, Ok(b"<html>".to_vec()));
        transport.push(url, Err(HarvestError::http(503, "busy")));
        transport.push(url, Ok(PDF.to_vec()));
        let f = fetcher(dir.path(), transport.clone());

        let FetchOutcome::Fetched(artifact) = f.fetch(descriptor("arxiv:2")).await else {
            panic!("expected a fetched artifact");
        };
        assert_eq!(artifact.retries, 2);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_error_fails_without_retry() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let f = fetcher(dir.path(), transport.clone());

        let FetchOutcome::Failed(failure) = f.fetch(descriptor("arxiv:3")).await else {
            panic!("expected a failure");
        };
        assert_eq!(failure.retries, 0);
        assert!(matches!(failure.error, HarvestError::Http { status: 404, .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn existing_artifact_is_reused_without_network() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let f = fetcher(dir.path(), transport.clone());
        std::fs::create_dir_all(f.artifacts_dir()).unwrap();
        std::fs::write(
            f.artifacts_dir()
                .join(format!("{}.pdf", artifact_stem("arxiv:4"))),
            PDF,
        )
        .unwrap();

        let FetchOutcome::Fetched(artifact) = f.fetch(descriptor("arxiv:4")).await else {
            panic!("expected reuse");
        };
        assert!(artifact.reused);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn processed_documents_are_not_claimed() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let f = fetcher(dir.path(), transport.clone());

        let mut earlier = ProcessingState::new("physics", Utc::now());
        earlier.mark_processed("arxiv:5", Utc::now());
        let state = CycleState::ephemeral(
            earlier.next_cycle(Utc::now()),
            StateStore::new(dir.path()),
            false,
        );

        let outcome = f.fetch_unprocessed(&state, descriptor("arxiv:5")).await;
        assert!(matches!(
            outcome,
            FetchOutcome::NotClaimed(ClaimOutcome::SkippedProcessed)
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_fetch_releases_the_claim() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let cancel = CancellationToken::new();
        let f = RateLimitedFetcher::new(
            transport,
            dir.path().join("artifacts"),
            &FetchConfig::default(),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            cancel.clone(),
        );
        let state = CycleState::ephemeral(
            ProcessingState::new("physics", Utc::now()),
            StateStore::new(dir.path()),
            false,
        );
        cancel.cancel();
        let outcome = f.fetch_unprocessed(&state, descriptor("arxiv:6")).await;
        assert!(matches!(outcome, FetchOutcome::Cancelled(_)));
        assert!(state.snapshot().in_flight.is_empty());
        assert!(state.claim("arxiv:6").is_claimed());
    }
}
