//! Durable per-instance state, locks, and cycle artifacts.
//!
//! Everything an instance persists lives under `<data_root>/<instance>/`:
//!
//! ```text
//! <instance>/
//! ├── state.json          ProcessingState checkpoint (atomic replace)
//! ├── harvest.lock        flock target; body holds pid + acquisition time
//! ├── last_report.json    most recent CycleReport
//! ├── artifacts/          downloaded raw documents
//! ├── archive/            completed states, state-<ts>-<cycle>.json
//! └── errors/             exported ledgers, errors-<ts>.json
//! ```
//!
//! Writes go through a temp file, `fsync`, `rename`, and a directory
//! `fsync`, so a crash leaves either the old or the new file and never a
//! torn one. Locks are `flock(LOCK_EX | LOCK_NB)`: the kernel drops them
//! when the holder dies.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use paper_harvest_core::models::{ClaimOutcome, CycleReport, ErrorRecord, ProcessingState};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{HarvestError, HarvestResult};

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "harvest.lock";
const REPORT_FILE: &str = "last_report.json";
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ============ Locks ============

/// An exclusive advisory lock on a file. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try once. `Ok(None)` means another holder has it.
    pub fn try_acquire(path: &Path) -> HarvestResult<Option<FileLock>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if !try_flock_exclusive(&file)? {
            return Ok(None);
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(
            file,
            "pid={}\nacquired={}",
            std::process::id(),
            Utc::now().to_rfc3339()
        )?;
        file.sync_all()?;

        Ok(Some(FileLock {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        unlock(&self.file);
    }
}

fn try_flock_exclusive(file: &File) -> std::io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid descriptor owned by `file` for the whole call.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock
            || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

fn unlock(file: &File) {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fd is a valid descriptor owned by `file`.
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
    }
}

/// Held for the duration of one instance cycle.
#[derive(Debug)]
pub struct InstanceLock {
    instance: String,
    _lock: FileLock,
}

impl InstanceLock {
    pub fn instance(&self) -> &str {
        &self.instance
    }
}

// ============ Atomic files ============

/// Write JSON via temp file + fsync + rename + directory fsync.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> HarvestResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| HarvestError::Storage(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(dir)?;

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = dir.join(tmp_name);

    let bytes = serde_json::to_vec_pretty(value)?;
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_dir(dir)?;
    Ok(())
}

fn sync_dir(dir: &Path) -> HarvestResult<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> HarvestResult<Option<T>> {
    let mut content = String::new();
    match File::open(path) {
        Ok(mut f) => {
            f.read_to_string(&mut content)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| HarvestError::Storage(format!("{} is corrupt: {}", path.display(), e)))
}

fn file_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

// ============ StateStore ============

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instance_dir(&self, instance: &str) -> PathBuf {
        self.root.join(instance)
    }

    pub fn artifacts_dir(&self, instance: &str) -> PathBuf {
        self.instance_dir(instance).join("artifacts")
    }

    pub fn archive_dir(&self, instance: &str) -> PathBuf {
        self.instance_dir(instance).join("archive")
    }

    pub fn errors_dir(&self, instance: &str) -> PathBuf {
        self.instance_dir(instance).join("errors")
    }

    pub fn state_path(&self, instance: &str) -> PathBuf {
        self.instance_dir(instance).join(STATE_FILE)
    }

    pub fn lock_path(&self, instance: &str) -> PathBuf {
        self.instance_dir(instance).join(LOCK_FILE)
    }

    /// Create the instance directory tree.
    pub fn ensure_layout(&self, instance: &str) -> HarvestResult<()> {
        for dir in [
            self.artifacts_dir(instance),
            self.archive_dir(instance),
            self.errors_dir(instance),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Load the checkpoint, or `None` if the instance has never run.
    pub fn load(&self, instance: &str) -> HarvestResult<Option<ProcessingState>> {
        read_json(&self.state_path(instance))
    }

    pub fn save(&self, instance: &str, state: &ProcessingState) -> HarvestResult<()> {
        write_json_atomic(&self.state_path(instance), state)
    }

    /// Acquire the instance lock, polling until `timeout` elapses. A zero
    /// timeout tries exactly once.
    pub async fn acquire_lock(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> HarvestResult<InstanceLock> {
        let path = self.lock_path(instance);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(lock) = FileLock::try_acquire(&path)? {
                tracing::debug!(instance, path = %path.display(), "instance lock acquired");
                return Ok(InstanceLock {
                    instance: instance.to_string(),
                    _lock: lock,
                });
            }
            if tokio::time::Instant::now() + LOCK_POLL_INTERVAL > deadline {
                return Err(HarvestError::LockBusy(instance.to_string()));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    pub fn release_lock(&self, lock: InstanceLock) {
        tracing::debug!(instance = lock.instance(), "instance lock released");
        drop(lock);
    }

    /// Contents of the lock file (pid and acquisition time) while held.
    pub fn lock_holder(&self, instance: &str) -> Option<String> {
        let content = fs::read_to_string(self.lock_path(instance)).ok()?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// Move a completed state into `archive/`.
    pub fn archive(&self, instance: &str, state: &ProcessingState) -> HarvestResult<PathBuf> {
        let at = state.completed_at.unwrap_or_else(Utc::now);
        let path = self.archive_dir(instance).join(format!(
            "state-{}-{}.json",
            file_stamp(at),
            state.cycle_id
        ));
        write_json_atomic(&path, state)?;
        Ok(path)
    }

    /// Archived states, oldest first.
    pub fn archived_states(&self, instance: &str) -> Vec<PathBuf> {
        sorted_entries(&self.archive_dir(instance), "state-")
    }

    /// Exported error logs, oldest first.
    pub fn error_logs(&self, instance: &str) -> Vec<PathBuf> {
        sorted_entries(&self.errors_dir(instance), "errors-")
    }

    /// Write the cycle's ledger. Returns `None` when there was nothing to
    /// export.
    pub fn export_errors(
        &self,
        instance: &str,
        cycle_id: Uuid,
        records: &[ErrorRecord],
    ) -> HarvestResult<Option<PathBuf>> {
        if records.is_empty() {
            return Ok(None);
        }
        let path = self.errors_dir(instance).join(format!(
            "errors-{}-{}.json",
            file_stamp(Utc::now()),
            cycle_id
        ));
        let body = serde_json::json!({
            "instance": instance,
            "cycle_id": cycle_id,
            "records": records,
        });
        write_json_atomic(&path, &body)?;
        Ok(Some(path))
    }

    pub fn save_report(&self, instance: &str, report: &CycleReport) -> HarvestResult<()> {
        write_json_atomic(&self.instance_dir(instance).join(REPORT_FILE), report)
    }

    pub fn load_report(&self, instance: &str) -> HarvestResult<Option<CycleReport>> {
        read_json(&self.instance_dir(instance).join(REPORT_FILE))
    }
}

fn sorted_entries(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(prefix) && n.ends_with(".json"))
                })
                .collect()
        })
        .unwrap_or_default();
    paths.sort();
    paths
}

// ============ CycleState ============

/// Shared, checkpointing handle on the running cycle's [`ProcessingState`].
///
/// All membership transitions go through the mutex, so a document is
/// claimed by at most one worker. Every `batch_size` settled documents the
/// state is flushed to disk. The flush writes a snapshot on the blocking
/// pool with the mutex released; `writer` keeps flushes in order.
#[derive(Debug)]
pub struct CycleState {
    state: Mutex<ProcessingState>,
    writer: tokio::sync::Mutex<()>,
    store: StateStore,
    batch_size: u64,
    retry_failed: bool,
    persist: bool,
}

impl CycleState {
    pub fn new(
        state: ProcessingState,
        store: StateStore,
        batch_size: u64,
        retry_failed: bool,
    ) -> Self {
        Self {
            state: Mutex::new(state),
            writer: tokio::sync::Mutex::new(()),
            store,
            batch_size,
            retry_failed,
            persist: true,
        }
    }

    /// A handle that never writes (dry runs).
    pub fn ephemeral(state: ProcessingState, store: StateStore, retry_failed: bool) -> Self {
        Self {
            persist: false,
            ..Self::new(state, store, u64::MAX, retry_failed)
        }
    }

    fn guard(&self) -> MutexGuard<'_, ProcessingState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn instance(&self) -> String {
        self.guard().instance.clone()
    }

    pub fn cycle_id(&self) -> Uuid {
        self.guard().cycle_id
    }

    pub fn retry_failed(&self) -> bool {
        self.retry_failed
    }

    pub fn begin_discovery(&self) {
        self.guard().begin_discovery();
    }

    /// Count a discovered document and classify it.
    pub fn discovered(&self, id: &str) -> ClaimOutcome {
        let mut state = self.guard();
        state.record_discovered();
        state.triage(id, self.retry_failed)
    }

    pub fn claim(&self, id: &str) -> ClaimOutcome {
        self.guard().claim(id, self.retry_failed)
    }

    pub fn release(&self, id: &str) {
        self.guard().release(id);
    }

    pub fn mark_downloaded(&self, id: &str) {
        self.guard().mark_downloaded(id);
    }

    pub async fn mark_processed(&self, id: &str) -> HarvestResult<()> {
        let due = {
            let mut state = self.guard();
            state.mark_processed(id, Utc::now());
            state.at_batch_boundary(self.batch_size)
        };
        if due {
            self.write().await?;
        }
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, record: &ErrorRecord) -> HarvestResult<()> {
        let due = {
            let mut state = self.guard();
            state.mark_failed(id, record);
            state.at_batch_boundary(self.batch_size)
        };
        if due {
            self.write().await?;
        }
        Ok(())
    }

    /// Persist a snapshot; the cursor only advances once the save succeeded.
    async fn write(&self) -> HarvestResult<()> {
        if !self.persist {
            return Ok(());
        }
        let _writer = self.writer.lock().await;
        let (snapshot, settled) = {
            let state = self.guard();
            let mut snapshot = state.clone();
            let settled = snapshot.cursor.since_flush;
            snapshot.mark_flushed(Utc::now());
            (snapshot, settled)
        };

        let store = self.store.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            store.save(&snapshot.instance, &snapshot).map(|_| snapshot)
        })
        .await
        .map_err(|e| HarvestError::Storage(format!("checkpoint task failed: {}", e)))??;

        let mut state = self.guard();
        state.cursor.flushed_batches = snapshot.cursor.flushed_batches;
        state.cursor.since_flush = state.cursor.since_flush.saturating_sub(settled);
        state.last_updated = state.last_updated.max(snapshot.last_updated);
        tracing::debug!(
            instance = %snapshot.instance,
            batches = snapshot.cursor.flushed_batches,
            processed = snapshot.counters.processed,
            failed = snapshot.counters.failed,
            "checkpoint flushed"
        );
        Ok(())
    }

    /// Flush regardless of the batch cursor (drain, abort).
    pub async fn flush(&self) -> HarvestResult<()> {
        self.write().await
    }

    /// Mark complete, flush, and archive.
    pub async fn complete(&self) -> HarvestResult<()> {
        self.guard().complete(Utc::now());
        if !self.persist {
            return Ok(());
        }
        self.write().await?;
        let state = self.snapshot();
        let store = self.store.clone();
        let path = tokio::task::spawn_blocking(move || store.archive(&state.instance, &state))
            .await
            .map_err(|e| HarvestError::Storage(format!("archive task failed: {}", e)))??;
        tracing::info!(archive = %path.display(), "cycle state archived");
        Ok(())
    }

    pub fn snapshot(&self) -> ProcessingState {
        self.guard().clone()
    }
}
