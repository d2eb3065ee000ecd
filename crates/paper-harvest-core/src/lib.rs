//! # Paper Harvest Core
//!
//! Shared, runtime-free logic for paper-harvest: the data model threaded
//! through an ingestion cycle, the retry policy, the progress tracker, the
//! error ledger, and the paragraph chunker.
//!
//! This crate contains no tokio, network, or filesystem code. Everything
//! here is deterministic given its inputs, which keeps the pipeline's
//! bookkeeping testable without a runtime.

pub mod chunk;
pub mod ledger;
pub mod models;
pub mod progress;
pub mod retry;
