//! Rate and ETA tracking for a running cycle.
//!
//! The rate is computed over a sliding window of timestamped `advance`
//! samples rather than from the last delta, so a burst of fast documents
//! followed by a slow one does not make the ETA jump around. The total may
//! only grow: when discovery and processing are pipelined, new pages keep
//! surfacing documents after work has started.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

const DEFAULT_WINDOW: Duration = Duration::from_secs(30);
const DEFAULT_MAX_SAMPLES: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub completed: u64,
    pub total: u64,
    /// Items per second over the sliding window.
    pub rate: f64,
    pub eta: Option<DateTime<Utc>>,
    pub current_item: Option<String>,
}

#[derive(Debug)]
pub struct ProgressTracker {
    completed: u64,
    total: u64,
    current_item: Option<String>,
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    max_samples: usize,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            completed: 0,
            total: 0,
            current_item: None,
            samples: VecDeque::new(),
            window,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }

    pub fn start(&mut self, total_estimate: u64) {
        self.start_at(total_estimate, Instant::now());
    }

    pub fn start_at(&mut self, total_estimate: u64, now: Instant) {
        self.completed = 0;
        self.total = total_estimate;
        self.current_item = None;
        self.samples.clear();
        self.samples.push_back((now, 0));
    }

    /// Raise the total estimate. Lower values are ignored.
    pub fn revise_total(&mut self, total: u64) {
        self.total = self.total.max(total);
    }

    pub fn advance(&mut self, completed_delta: u64, current_item: &str) {
        self.advance_at(completed_delta, current_item, Instant::now());
    }

    pub fn advance_at(&mut self, completed_delta: u64, current_item: &str, now: Instant) {
        if self.samples.is_empty() {
            self.samples.push_back((now, self.completed));
        }
        self.completed += completed_delta;
        self.total = self.total.max(self.completed);
        self.current_item = Some(current_item.to_string());
        self.samples.push_back((now, self.completed));

        while self.samples.len() > self.max_samples
            || (self.samples.len() > 2
                && now.saturating_duration_since(self.samples[1].0) > self.window)
        {
            self.samples.pop_front();
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot_at(Instant::now(), Utc::now())
    }

    pub fn snapshot_at(&self, now: Instant, wall_now: DateTime<Utc>) -> ProgressSnapshot {
        let rate = self.rate_at(now);
        let remaining = self.total.saturating_sub(self.completed);
        let eta = if remaining == 0 {
            Some(wall_now)
        } else if rate > 0.0 {
            let secs = remaining as f64 / rate;
            chrono::Duration::from_std(Duration::from_secs_f64(secs))
                .ok()
                .map(|d| wall_now + d)
        } else {
            None
        };
        ProgressSnapshot {
            completed: self.completed,
            total: self.total,
            rate,
            eta,
            current_item: self.current_item.clone(),
        }
    }

    fn rate_at(&self, now: Instant) -> f64 {
        let Some(&(oldest_at, oldest_count)) = self.samples.front() else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(oldest_at).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        (self.completed - oldest_count) as f64 / elapsed
    }
}
