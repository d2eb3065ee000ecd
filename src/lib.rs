//! # paper-harvest
//!
//! A resumable, multi-instance ingestion pipeline for scientific papers.
//!
//! Each configured *instance* (a topic such as `physics` or `biology`)
//! periodically discovers new papers from a preprint archive and journal
//! feeds, downloads the artifacts under a rate limit, extracts and chunks
//! the text, embeds the chunks, and upserts them into a vector store. Every
//! document's progress is checkpointed, so an interrupted cycle resumes
//! where it stopped and a finished one is never repeated.
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────────────────────┐
//!  harvest CLI ──▶ │ MonthlyScheduleRunner        │  schedule.lock, schedule.json
//!                  └──────────────┬───────────────┘
//!                                 ▼ (per instance, bounded)
//!                  ┌──────────────────────────────┐
//!                  │ InstanceUpdateOrchestrator   │  harvest.lock, state.json
//!                  └──────────────┬───────────────┘
//!         ┌───────────────────────┼───────────────────────┐
//!         ▼                       ▼                       ▼
//!  ┌──────────────┐      ┌──────────────────┐     ┌─────────────────────┐
//!  │ Source       │ ───▶ │ RateLimited      │ ──▶ │ IngestionProcessor  │
//!  │ Discoverer   │      │ Fetcher          │     │ extract/chunk/embed │
//!  └──────────────┘      └──────────────────┘     └──────────┬──────────┘
//!                                                            ▼
//!                                                   ┌─────────────────┐
//!                                                   │ VectorStore     │
//!                                                   │ (SQLite)        │
//!                                                   └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init-store                      # create the vector store schema
//! harvest instances                       # list configured instances
//! harvest run-cycle --instance physics    # one cycle now
//! harvest resume --instance physics       # continue an interrupted cycle
//! harvest schedule                        # monthly run for every instance
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Error taxonomy and retry classification |
//! | [`state`] | Locks, atomic state persistence, per-cycle state |
//! | [`throttle`] | Token bucket and request spacing |
//! | [`sources`] | Archive and journal discovery |
//! | [`fetch`] | Rate-limited artifact download |
//! | [`extract`] | PDF and text extraction |
//! | [`embedding`] | Embedding providers |
//! | [`process`] | Extract, chunk, embed, upsert |
//! | [`vector_store`] | SQLite vector store |
//! | [`storage`] | Disk usage, thresholds, retention |
//! | [`orchestrator`] | One instance cycle |
//! | [`schedule`] | Monthly multi-instance runs |
//! | [`notify`] | Report delivery |
//! | [`progress`] | Cycle progress on stderr |
//! | [`status`] | Operator views |

pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod notify;
pub mod orchestrator;
pub mod process;
pub mod progress;
pub mod schedule;
pub mod sources;
pub mod state;
pub mod status;
pub mod storage;
pub mod throttle;
pub mod vector_store;
