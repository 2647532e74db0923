//! Job lifecycle and dependency engine.
//!
//! - [`JobGraph`]: create, claim, run transitions, complete, fail, flow, reclaim
//! - [`dataflow`]: rule evaluation into store batches and accumulator entries

pub mod dataflow;
mod graph;

pub use dataflow::{FlowPlan, fold_accu, plan_flow};
pub use graph::{FailOutcome, FailureReason, JobGraph, ReclaimedJob};
