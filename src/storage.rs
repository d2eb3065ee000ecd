//! Disk usage, thresholds, and retention for instance storage.
//!
//! | Measure | Source |
//! |---------|--------|
//! | used bytes | sum of file sizes under `<data_root>/<instance>/` |
//! | available bytes | `quota_bytes - used` when a quota is set, else `statvfs` |
//! | percent used | of the quota when set, else of the filesystem |
//!
//! Cleanup is advisory by default: [`StorageMonitor::recommend_cleanup`]
//! only lists what could go. [`StorageMonitor::apply_retention`] deletes,
//! and only when `retention.auto_delete` is set, and only artifacts of
//! documents that were processed more than `max_artifact_age_days` ago.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use paper_harvest_core::models::{ProcessingState, StorageUsage, ThresholdLevel};
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::{InstanceConfig, RetentionConfig};
use crate::error::HarvestResult;
use crate::fetch::find_artifact;
use crate::state::StateStore;

/// Artifact age used for recommendations when no retention age is set.
const ADVISORY_ARTIFACT_AGE_DAYS: u32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupKind {
    ProcessedArtifacts,
    ArchivedStates,
    ErrorLogs,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupAction {
    pub kind: CleanupKind,
    pub description: String,
    pub paths: Vec<PathBuf>,
    pub reclaimable_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionOutcome {
    pub deleted_files: u64,
    pub reclaimed_bytes: u64,
}

/// Total size of regular files under `dir`. A missing directory is empty.
pub fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Filesystem `(total, available)` bytes for the filesystem holding `path`,
/// walking up to the nearest existing ancestor.
#[cfg(unix)]
pub fn filesystem_space(path: &Path) -> Option<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let existing = path.ancestors().find(|p| p.exists())?;
    let c_path = CString::new(existing.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated string and stat is a valid
    // out-pointer for the duration of the call.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let frsize = stat.f_frsize as u64;
    Some((
        (stat.f_blocks as u64).saturating_mul(frsize),
        (stat.f_bavail as u64).saturating_mul(frsize),
    ))
}

#[cfg(not(unix))]
pub fn filesystem_space(_path: &Path) -> Option<(u64, u64)> {
    None
}

pub fn threshold(percent_used: f64, retention: &RetentionConfig) -> ThresholdLevel {
    if percent_used >= retention.critical_percent {
        ThresholdLevel::Critical
    } else if percent_used >= retention.warn_percent {
        ThresholdLevel::Warning
    } else {
        ThresholdLevel::Ok
    }
}

/// Date at which `available_bytes` runs out if every cycle adds
/// `growth_per_cycle` bytes. `None` when nothing grows.
pub fn projection(
    available_bytes: u64,
    growth_per_cycle: u64,
    cycle_period: chrono::Duration,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if growth_per_cycle == 0 {
        return None;
    }
    let cycles = available_bytes as f64 / growth_per_cycle as f64;
    let secs = cycle_period.num_seconds() as f64 * cycles;
    if !secs.is_finite() || secs > i64::MAX as f64 / 2.0 {
        return None;
    }
    Some(now + chrono::Duration::seconds(secs as i64))
}

/// Bytes one cycle adds: average bytes per processed document times the
/// documents the last cycle processed.
pub fn growth_per_cycle(used_bytes: u64, processed_total: u64, processed_last_cycle: u64) -> u64 {
    if processed_total == 0 {
        return 0;
    }
    used_bytes / processed_total * processed_last_cycle
}

pub struct StorageMonitor {
    store: StateStore,
}

impl StorageMonitor {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn usage(&self, instance: &InstanceConfig) -> StorageUsage {
        let dir = self.store.instance_dir(&instance.name);
        let used_bytes = directory_size(&dir);
        let retention = &instance.retention;

        let (available_bytes, percent_used) = match retention.quota_bytes {
            Some(quota) if quota > 0 => (
                quota.saturating_sub(used_bytes),
                used_bytes as f64 * 100.0 / quota as f64,
            ),
            _ => match filesystem_space(&dir) {
                Some((total, available)) if total > 0 => (
                    available,
                    total.saturating_sub(available) as f64 * 100.0 / total as f64,
                ),
                _ => (0, 0.0),
            },
        };

        let level = threshold(percent_used, retention);
        match level {
            ThresholdLevel::Ok => {}
            ThresholdLevel::Warning => tracing::warn!(
                instance = %instance.name,
                percent_used = format!("{:.1}", percent_used),
                "storage above warning threshold"
            ),
            ThresholdLevel::Critical => tracing::error!(
                instance = %instance.name,
                percent_used = format!("{:.1}", percent_used),
                "storage above critical threshold"
            ),
        }

        StorageUsage {
            used_bytes,
            available_bytes,
            percent_used,
            level,
        }
    }

    /// Artifacts of documents processed before `cutoff`, with their sizes.
    fn expired_artifacts(
        &self,
        instance: &str,
        state: &ProcessingState,
        cutoff: DateTime<Utc>,
    ) -> Vec<(PathBuf, u64)> {
        let dir = self.store.artifacts_dir(instance);
        state
            .processed
            .iter()
            .filter(|(_, entry)| entry.at < cutoff)
            .filter_map(|(id, _)| find_artifact(&dir, id))
            .map(|p| {
                let len = std::fs::metadata(&p).map(|m| m.len()).unwrap_or(0);
                (p, len)
            })
            .collect()
    }

    /// Suggested cleanup, largest category first. Nothing is deleted.
    pub fn recommend_cleanup(
        &self,
        instance: &InstanceConfig,
        state: &ProcessingState,
        now: DateTime<Utc>,
    ) -> Vec<CleanupAction> {
        let retention = &instance.retention;
        let age_days = retention
            .max_artifact_age_days
            .unwrap_or(ADVISORY_ARTIFACT_AGE_DAYS);
        let cutoff = now - chrono::Duration::days(i64::from(age_days));

        let mut actions = Vec::new();

        let artifacts = self.expired_artifacts(&instance.name, state, cutoff);
        if !artifacts.is_empty() {
            actions.push(CleanupAction {
                kind: CleanupKind::ProcessedArtifacts,
                description: format!(
                    "delete {} artifact(s) of documents processed more than {} days ago",
                    artifacts.len(),
                    age_days
                ),
                reclaimable_bytes: artifacts.iter().map(|(_, len)| len).sum(),
                paths: artifacts.into_iter().map(|(p, _)| p).collect(),
            });
        }

        let keep = retention.keep_archived_states;
        for (kind, paths, what) in [
            (
                CleanupKind::ArchivedStates,
                self.store.archived_states(&instance.name),
                "archived state(s)",
            ),
            (
                CleanupKind::ErrorLogs,
                self.store.error_logs(&instance.name),
                "error log(s)",
            ),
        ] {
            if paths.len() <= keep {
                continue;
            }
            let surplus: Vec<PathBuf> = paths[..paths.len() - keep].to_vec();
            actions.push(CleanupAction {
                kind,
                description: format!("prune {} {} beyond the newest {}", surplus.len(), what, keep),
                reclaimable_bytes: surplus
                    .iter()
                    .filter_map(|p| std::fs::metadata(p).ok())
                    .map(|m| m.len())
                    .sum(),
                paths: surplus,
            });
        }

        actions.sort_by(|a, b| b.reclaimable_bytes.cmp(&a.reclaimable_bytes));
        actions
    }

    /// Delete expired artifacts of processed documents. A no-op unless
    /// `retention.auto_delete` is set with a `max_artifact_age_days`.
    pub fn apply_retention(
        &self,
        instance: &InstanceConfig,
        state: &ProcessingState,
        now: DateTime<Utc>,
    ) -> HarvestResult<RetentionOutcome> {
        let retention = &instance.retention;
        let age_days = match (retention.auto_delete, retention.max_artifact_age_days) {
            (true, Some(days)) => days,
            _ => {
                tracing::debug!(instance = %instance.name, "retention disabled, nothing deleted");
                return Ok(RetentionOutcome::default());
            }
        };
        let cutoff = now - chrono::Duration::days(i64::from(age_days));

        let mut outcome = RetentionOutcome::default();
        for (path, len) in self.expired_artifacts(&instance.name, state, cutoff) {
            std::fs::remove_file(&path)?;
            outcome.deleted_files += 1;
            outcome.reclaimed_bytes += len;
        }
        tracing::info!(
            instance = %instance.name,
            deleted = outcome.deleted_files,
            reclaimed_bytes = outcome.reclaimed_bytes,
            "retention applied"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::artifact_stem;
    use tempfile::TempDir;

    fn instance(retention: RetentionConfig) -> InstanceConfig {
        let mut cfg = crate::config::parse_config(
            r#"
[storage]
data_root = "/unused"

[instances.physics.archive]
categories = ["quant-ph"]
"#,
        )
        .unwrap()
        .instances
        .remove("physics")
        .unwrap();
        cfg.retention = retention;
        cfg
    }

    fn seed(store: &StateStore, id: &str, bytes: usize) {
        let dir = store.artifacts_dir("physics");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{}.pdf", artifact_stem(id))), vec![b'x'; bytes]).unwrap();
    }

    fn aged_state(now: DateTime<Utc>) -> ProcessingState {
        let mut state = ProcessingState::new("physics", now);
        state.mark_processed("arxiv:old", now - chrono::Duration::days(200));
        state.mark_processed("arxiv:new", now - chrono::Duration::days(5));
        state
    }

    #[test]
    fn thresholds() {
        let r = RetentionConfig::default();
        assert_eq!(threshold(10.0, &r), ThresholdLevel::Ok);
        assert_eq!(threshold(80.0, &r), ThresholdLevel::Warning);
        assert_eq!(threshold(99.0, &r), ThresholdLevel::Critical);
    }

    #[test]
    fn usage_against_quota() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        seed(&store, "arxiv:1", 900);
        let monitor = StorageMonitor::new(store);
        let usage = monitor.usage(&instance(RetentionConfig {
            quota_bytes: Some(1000),
            ..RetentionConfig::default()
        }));
        assert_eq!(usage.used_bytes, 900);
        assert_eq!(usage.available_bytes, 100);
        assert!((usage.percent_used - 90.0).abs() < 1e-9);
        assert_eq!(usage.level, ThresholdLevel::Warning);
    }

    #[test]
    fn missing_instance_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let monitor = StorageMonitor::new(StateStore::new(dir.path().join("nowhere")));
        let usage = monitor.usage(&instance(RetentionConfig::default()));
        assert_eq!(usage.used_bytes, 0);
    }

    #[test]
    fn projection_scales_with_growth() {
        let now = Utc::now();
        let month = chrono::Duration::days(30);
        assert_eq!(projection(1000, 0, month, now), None);
        let full = projection(1000, 250, month, now).unwrap();
        assert_eq!((full - now).num_days(), 120);
        assert_eq!(growth_per_cycle(1000, 10, 3), 300);
        assert_eq!(growth_per_cycle(1000, 0, 3), 0);
    }

    #[test]
    fn recommendations_do_not_delete() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        seed(&store, "arxiv:old", 500);
        seed(&store, "arxiv:new", 500);
        let now = Utc::now();
        let monitor = StorageMonitor::new(store.clone());

        let actions = monitor.recommend_cleanup(&instance(RetentionConfig::default()), &aged_state(now), now);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, CleanupKind::ProcessedArtifacts);
        assert_eq!(actions[0].reclaimable_bytes, 500);
        assert!(actions[0].paths[0].exists());
    }

    #[test]
    fn retention_requires_opt_in() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        seed(&store, "arxiv:old", 500);
        seed(&store, "arxiv:new", 500);
        let now = Utc::now();
        let monitor = StorageMonitor::new(store.clone());
        let state = aged_state(now);

        let off = monitor
            .apply_retention(&instance(RetentionConfig::default()), &state, now)
            .unwrap();
        assert_eq!(off, RetentionOutcome::default());

        let on = instance(RetentionConfig {
            auto_delete: true,
            max_artifact_age_days: Some(30),
            ..RetentionConfig::default()
        });
        let done = monitor.apply_retention(&on, &state, now).unwrap();
        assert_eq!(done.deleted_files, 1);
        assert_eq!(done.reclaimed_bytes, 500);
        assert!(find_artifact(&store.artifacts_dir("physics"), "arxiv:old").is_none());
        assert!(find_artifact(&store.artifacts_dir("physics"), "arxiv:new").is_some());
    }
}
