//! Domain types for Apiary
//!
//! - Analysis / ResourceClass: pipeline stages and their resource profiles
//! - AnalysisJob / JobStatus: units of work and their state machine
//! - DataflowRule / AnalysisCtrlRule: static edges of the pipeline graph
//! - WorkerRecord / Role / CauseOfDeath: execution processes

pub mod analysis;
pub mod job;
pub mod rules;
pub mod worker;

pub use analysis::{Analysis, DEFAULT_RESOURCE_CLASS, ResourceClass, ResourceDescription};
pub use job::{AnalysisJob, JobId, JobStatus, NewJob, StatusCounts};
pub use rules::{
    AccuKind, AnalysisCtrlRule, BRANCH_ANY_FAILURE, BRANCH_MAIN, BRANCH_MEMLIMIT, BRANCH_RUNLIMIT, DataflowRule,
    DataflowTarget, FunnelSpec,
};
pub use worker::{CauseOfDeath, Role, WorkerRecord, WorkerStatus};
