//! Operator views: `harvest status`, `harvest instances`, `harvest storage`.
//!
//! Everything here is read-only except `storage --apply-retention`, which
//! takes the instance lock before deleting anything.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use crate::config::{Config, InstanceConfig};
use crate::error::HarvestError;
use crate::process::VectorStore;
use crate::progress::format_number;
use crate::state::StateStore;
use crate::storage::{growth_per_cycle, projection, StorageMonitor};
use crate::vector_store::SqliteVectorStore;

/// Average spacing of scheduled cycles, used for storage projections.
const CYCLE_PERIOD_DAYS: i64 = 30;

fn store(config: &Config) -> StateStore {
    StateStore::new(config.storage.data_root.clone())
}

/// Print the persisted state, lock holder, last report, and storage usage.
pub async fn run_status(config: &Config, name: &str) -> Result<()> {
    let instance = config.instance(name)?;
    let store = store(config);

    println!("paper-harvest: {}", instance.name);
    println!("{}", "=".repeat(16 + instance.name.len()));
    println!();

    match store.lock_holder(name) {
        Some(holder) => println!("  Lock:        held ({})", holder.replace('\n', ", ")),
        None => println!("  Lock:        free"),
    }

    let state = store
        .load(name)
        .with_context(|| format!("Failed to read state for '{}'", name))?;
    match &state {
        None => println!("  State:       no cycle has run yet"),
        Some(state) => {
            let phase = if state.is_complete() {
                "complete"
            } else {
                "interrupted (resumable)"
            };
            println!("  Cycle:       {} ({})", state.cycle_id, phase);
            println!("  Started:     {}", format_ts_relative(state.cycle_started));
            println!("  Updated:     {}", format_ts_relative(state.last_updated));
            let c = &state.counters;
            println!(
                "  Counts:      discovered {}  processed {}  failed {}  skipped {}  pending {}",
                format_number(c.discovered),
                format_number(c.processed),
                format_number(c.failed),
                format_number(c.skipped),
                format_number(state.pending()),
            );
            println!(
                "  Known:       {} processed, {} failed (all cycles)",
                format_number(state.processed.len() as u64),
                format_number(state.failed.len() as u64),
            );
            println!("  Batches:     {} flushed", state.cursor.flushed_batches);
        }
    }

    if let Some(report) = store.load_report(name)? {
        println!();
        println!(
            "  Last report: {} {} ({:.1}s)",
            report.status,
            format_ts_relative(report.finished_at),
            report.duration_secs
        );
        if let Some(reason) = &report.reason {
            println!("  Reason:      {}", reason);
        }
        if !report.error_summary.is_empty() {
            let summary: Vec<String> = report
                .error_summary
                .iter()
                .map(|(category, n)| format!("{}={}", category, n))
                .collect();
            println!("  Errors:      {}", summary.join(" "));
        }
    }

    let usage = StorageMonitor::new(store.clone()).usage(instance);
    println!();
    println!(
        "  Storage:     {} used, {} available ({:.1}%, {})",
        format_bytes(usage.used_bytes),
        format_bytes(usage.available_bytes),
        usage.percent_used,
        usage.level.as_str()
    );

    let db_path = config.vector_store_path();
    if db_path.exists() {
        let vectors = SqliteVectorStore::open(&db_path).await?;
        let stats = vectors.stats(name).await?;
        println!(
            "  Vectors:     {} documents, {} chunks, {} embedded",
            format_number(stats.documents),
            format_number(stats.chunks),
            format_number(stats.embedded_chunks)
        );
        vectors.close().await;
    }
    println!();
    Ok(())
}

/// List configured instances and their sources.
pub fn run_instances(config: &Config) -> Result<()> {
    if config.instances.is_empty() {
        println!("No instances configured.");
        return Ok(());
    }
    let store = store(config);
    println!(
        "{:<20} {:<40} {:>7}   {}",
        "INSTANCE", "SOURCES", "WINDOW", "LAST RUN"
    );
    println!("{}", "-".repeat(90));
    for instance in config.instances.values() {
        let last = match store.load_report(&instance.name) {
            Ok(Some(report)) => format!("{} {}", report.status, format_ts_relative(report.finished_at)),
            Ok(None) => "never".to_string(),
            Err(e) => format!("unreadable ({})", e),
        };
        println!(
            "{:<20} {:<40} {:>7}   {}",
            instance.name,
            describe_sources(instance),
            format!("{}d", instance.window.days),
            last
        );
    }
    Ok(())
}

fn describe_sources(instance: &InstanceConfig) -> String {
    let mut parts = Vec::new();
    if let Some(archive) = &instance.archive {
        parts.push(format!("archive[{}]", archive.categories.join(",")));
    }
    for journal in &instance.journals {
        parts.push(format!("journal:{}", journal.name));
    }
    parts.join(" ")
}

/// Print usage, a growth projection, and the cleanup plan. With `apply`,
/// run retention under the instance lock.
pub async fn run_storage(config: &Config, name: &str, apply: bool) -> Result<()> {
    let instance = config.instance(name)?;
    let store = store(config);
    let monitor = StorageMonitor::new(store.clone());
    let now = Utc::now();

    let usage = monitor.usage(instance);
    println!("Storage for {}", instance.name);
    println!();
    println!("  Directory:   {}", store.instance_dir(name).display());
    println!("  Used:        {}", format_bytes(usage.used_bytes));
    println!("  Available:   {}", format_bytes(usage.available_bytes));
    println!(
        "  Percent:     {:.1}% ({}; warn at {}%, critical at {}%)",
        usage.percent_used,
        usage.level.as_str(),
        instance.retention.warn_percent,
        instance.retention.critical_percent
    );

    let state = store.load(name)?;
    if let Some(state) = &state {
        let last_cycle = state.processed_this_cycle().count() as u64;
        let growth = growth_per_cycle(usage.used_bytes, state.processed.len() as u64, last_cycle);
        match projection(
            usage.available_bytes,
            growth,
            chrono::Duration::days(CYCLE_PERIOD_DAYS),
            now,
        ) {
            Some(full_at) => println!(
                "  Projection:  +{} per cycle, full around {}",
                format_bytes(growth),
                full_at.format("%Y-%m-%d")
            ),
            None => println!("  Projection:  no growth observed"),
        }

        let plan = monitor.recommend_cleanup(instance, state, now);
        println!();
        if plan.is_empty() {
            println!("  Nothing to clean up.");
        } else {
            println!("  Cleanup plan:");
            for action in &plan {
                println!(
                    "    {:<48} {:>10}  ({} files)",
                    action.description,
                    format_bytes(action.reclaimable_bytes),
                    action.paths.len()
                );
            }
        }

        if apply {
            if !instance.retention.auto_delete {
                bail!(
                    "instances.{}.retention.auto_delete is off; nothing was deleted",
                    name
                );
            }
            let lock = match store.acquire_lock(name, Duration::ZERO).await {
                Ok(lock) => lock,
                Err(HarvestError::LockBusy(_)) => {
                    bail!("instance '{}' is running a cycle; try again later", name)
                }
                Err(e) => return Err(e.into()),
            };
            let outcome = monitor.apply_retention(instance, state, now)?;
            store.release_lock(lock);
            println!();
            println!(
                "  Deleted {} files, reclaimed {}",
                outcome.deleted_files,
                format_bytes(outcome.reclaimed_bytes)
            );
        }
    } else if apply {
        println!();
        println!("  No state yet; nothing to delete.");
    }
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to now (e.g. "3 hours ago").
pub fn format_ts_relative(at: DateTime<Utc>) -> String {
    format_relative_to(at, Utc::now())
}

fn format_relative_to(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - at).num_seconds();
    if delta < 0 {
        return at.format("%Y-%m-%d %H:%M").to_string();
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        at.format("%Y-%m-%d %H:%M").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bytes_are_human_readable() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn relative_timestamps() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(format_relative_to(now, now), "just now");
        assert_eq!(
            format_relative_to(now - chrono::Duration::minutes(1), now),
            "1 min ago"
        );
        assert_eq!(
            format_relative_to(now - chrono::Duration::hours(5), now),
            "5 hours ago"
        );
        assert_eq!(
            format_relative_to(now - chrono::Duration::days(2), now),
            "2 days ago"
        );
        let old = Utc.with_ymd_and_hms(2023, 11, 2, 8, 30, 0).unwrap();
        assert_eq!(format_relative_to(old, now), "2023-11-02 08:30");
    }
}
