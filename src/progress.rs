//! Cycle progress reporting.
//!
//! Reports observable progress during `harvest run-cycle`, `resume`, and
//! `schedule` so operators see what is being fetched, how much is left, and
//! when the cycle should finish. Progress is emitted on **stderr** so stdout
//! remains parseable for scripts.

use std::io::Write;

use paper_harvest_core::progress::ProgressSnapshot;

/// A single progress event for one instance cycle.
#[derive(Clone, Debug)]
pub enum CycleProgressEvent {
    /// Source queries are running; no total yet.
    Discovering { instance: String },
    /// Documents are being fetched and processed.
    Working {
        instance: String,
        snapshot: ProgressSnapshot,
    },
    /// The cycle reached a final status.
    Finished { instance: String, status: String },
}

/// Reports cycle progress. Implementations write to stderr (human or JSON).
pub trait CycleProgressReporter: Send + Sync {
    fn report(&self, event: CycleProgressEvent);
}

/// Human-friendly progress on stderr:
/// `harvest physics  working  12 / 37 docs  0.8/s  eta 14:02:10  arxiv:2401.00001`.
pub struct StderrProgress;

impl CycleProgressReporter for StderrProgress {
    fn report(&self, event: CycleProgressEvent) {
        let line = match &event {
            CycleProgressEvent::Discovering { instance } => {
                format!("harvest {}  discovering...\n", instance)
            }
            CycleProgressEvent::Working { instance, snapshot } => {
                let eta = snapshot
                    .eta
                    .map(|t| t.format("%H:%M:%S").to_string())
                    .unwrap_or_else(|| "--:--:--".to_string());
                format!(
                    "harvest {}  working  {} / {} docs  {:.1}/s  eta {}  {}\n",
                    instance,
                    format_number(snapshot.completed),
                    format_number(snapshot.total),
                    snapshot.rate,
                    eta,
                    snapshot.current_item.as_deref().unwrap_or("")
                )
            }
            CycleProgressEvent::Finished { instance, status } => {
                format!("harvest {}  {}\n", instance, status)
            }
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl CycleProgressReporter for JsonProgress {
    fn report(&self, event: CycleProgressEvent) {
        let obj = match &event {
            CycleProgressEvent::Discovering { instance } => serde_json::json!({
                "event": "progress",
                "instance": instance,
                "phase": "discovering"
            }),
            CycleProgressEvent::Working { instance, snapshot } => serde_json::json!({
                "event": "progress",
                "instance": instance,
                "phase": "working",
                "completed": snapshot.completed,
                "total": snapshot.total,
                "rate": snapshot.rate,
                "eta": snapshot.eta,
                "current": snapshot.current_item,
            }),
            CycleProgressEvent::Finished { instance, status } => serde_json::json!({
                "event": "finished",
                "instance": instance,
                "status": status
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl CycleProgressReporter for NoProgress {
    fn report(&self, _event: CycleProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> std::sync::Arc<dyn CycleProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}
