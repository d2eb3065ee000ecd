//! Append-only error ledger for one cycle.
//!
//! Workers share a single ledger. Recording never fails and never panics:
//! a poisoned lock is recovered, since losing the ledger must not take the
//! pipeline down with it.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::models::{ErrorCategory, ErrorRecord};

#[derive(Debug, Default)]
pub struct ErrorLedger {
    records: Mutex<Vec<ErrorRecord>>,
}

impl ErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A ledger that continues from records of an earlier run.
    pub fn with_records(records: Vec<ErrorRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Vec<ErrorRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, record: ErrorRecord) {
        self.guard().push(record);
    }

    /// Count of records per category.
    pub fn summary(&self) -> BTreeMap<ErrorCategory, usize> {
        let mut counts = BTreeMap::new();
        for record in self.guard().iter() {
            *counts.entry(record.category).or_insert(0) += 1;
        }
        counts
    }

    /// All records in the order they were recorded.
    pub fn export(&self) -> Vec<ErrorRecord> {
        self.guard().clone()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn has_fatal(&self) -> bool {
        self.guard().iter().any(|r| r.fatal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn summary_counts_by_category() {
        let ledger = ErrorLedger::new();
        ledger.record(ErrorRecord::new(ErrorCategory::Network, "reset").for_document("a"));
        ledger.record(ErrorRecord::new(ErrorCategory::Network, "timeout").for_document("b"));
        ledger.record(ErrorRecord::new(ErrorCategory::Parse, "bad xml"));

        let summary = ledger.summary();
        assert_eq!(summary.get(&ErrorCategory::Network), Some(&2));
        assert_eq!(summary.get(&ErrorCategory::Parse), Some(&1));
        assert_eq!(summary.get(&ErrorCategory::Storage), None);
    }

    #[test]
    fn export_preserves_order() {
        let ledger = ErrorLedger::new();
        for i in 0..5 {
            ledger.record(ErrorRecord::new(ErrorCategory::Processing, format!("e{}", i)));
        }
        let messages: Vec<String> = ledger.export().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["e0", "e1", "e2", "e3", "e4"]);
    }

    #[test]
    fn seeded_records_come_first() {
        let ledger =
            ErrorLedger::with_records(vec![ErrorRecord::new(ErrorCategory::Network, "earlier")]);
        ledger.record(ErrorRecord::new(ErrorCategory::Parse, "later"));
        let messages: Vec<String> = ledger.export().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["earlier", "later"]);
    }

    #[test]
    fn survives_poisoned_lock() {
        let ledger = Arc::new(ErrorLedger::new());
        let poisoner = Arc::clone(&ledger);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.records.lock().unwrap();
            panic!("worker crashed while holding the ledger");
        })
        .join();

        ledger.record(ErrorRecord::new(ErrorCategory::Storage, "disk full").fatal());
        assert_eq!(ledger.len(), 1);
        assert!(ledger.has_fatal());
    }
}
