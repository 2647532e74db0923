//! Storage layer for Apiary.
//!
//! The job store is the single source of truth for analyses, jobs, semaphores,
//! accumulators and workers. Components talk to it through [`HiveStore`] so that
//! the SQLite backend can be swapped out in tests.
//!
//! # Example
//!
//! ```ignore
//! use apiary::store::{HiveStore, JobBatch, SqliteStore};
//!
//! let store = SqliteStore::open_in_memory()?;
//! let id = store.store_analysis(&Analysis::new(0, "start", "Dummy"))?;
//! store.insert_batch(JobBatch::single(NewJob::new(id, json!({}))))?;
//! ```

mod sqlite;
mod traits;

pub use sqlite::{SqliteStore, compute_pipeline_hash, default_store_path};
pub use traits::{
    AccuEntry, AnalysisRepository, BatchIds, BoundedClaim, FunnelEffect, HiveStore, JobBatch, JobRepository, LogMessage,
    WorkerRepository,
};
