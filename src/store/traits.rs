//! Repository interfaces over the job store.
//!
//! One trait per entity type. Every multi-row effect (creating a fan of jobs,
//! completing a job and releasing its funnel) is a single method so that an
//! implementation can make it atomic.

use crate::domain::{Analysis, AnalysisJob, CauseOfDeath, JobId, JobStatus, NewJob, Role, StatusCounts, WorkerRecord, WorkerStatus};
use crate::error::Result;

/// A set of jobs created atomically by one dataflow event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobBatch {
    /// Created first, with `semaphore_count = fan.len()`. SEMAPHORED when the fan
    /// is non-empty, READY otherwise.
    pub funnel: Option<NewJob>,
    /// Created READY. With a funnel they all point at it; otherwise a job with
    /// `semaphored_by` set increments that funnel.
    pub fan: Vec<NewJob>,
}

impl JobBatch {
    pub fn single(job: NewJob) -> Self {
        Self {
            funnel: None,
            fan: vec![job],
        }
    }
}

/// Ids allocated for a [`JobBatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchIds {
    pub funnel: Option<JobId>,
    pub fan: Vec<JobId>,
}

impl BatchIds {
    /// All created ids, funnel first.
    pub fn all(&self) -> Vec<JobId> {
        self.funnel.iter().copied().chain(self.fan.iter().copied()).collect()
    }
}

/// What finishing a job did to its funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunnelEffect {
    /// The job was not semaphoring anything
    None,
    /// The funnel is still waiting on `remaining` jobs
    Decremented { funnel: JobId, remaining: u32 },
    /// The funnel reached zero and is now READY
    Released { funnel: JobId },
}

/// Result of a claim bounded by an analysis' in-flight capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundedClaim {
    Claimed,
    /// Someone else claimed it, or it is not claimable yet
    Conflict,
    /// The analysis already has `capacity` jobs in flight
    AtCapacity,
}

/// One accumulated value stored against a funnel job.
#[derive(Debug, Clone, PartialEq)]
pub struct AccuEntry {
    pub funnel_job_id: JobId,
    pub name: String,
    /// `scalar`, `list` or `map`
    pub kind: String,
    pub key: Option<String>,
    pub value: serde_json::Value,
}

/// A message attached to a job or worker.
#[derive(Debug, Clone, PartialEq)]
pub struct LogMessage {
    pub job_id: Option<JobId>,
    pub worker_id: Option<i64>,
    pub time: i64,
    pub message: String,
    pub is_error: bool,
}

/// Analysis persistence.
pub trait AnalysisRepository: Send + Sync {
    /// Insert or update by name; returns the analysis id.
    fn store_analysis(&self, analysis: &Analysis) -> Result<i64>;

    fn get_analysis(&self, id: i64) -> Result<Option<Analysis>>;

    fn find_analysis(&self, name: &str) -> Result<Option<Analysis>>;

    /// All analyses in creation order.
    fn list_analyses(&self) -> Result<Vec<Analysis>>;

    /// Edit capacities at run time.
    fn set_capacity(&self, id: i64, hive_capacity: Option<u32>, analysis_capacity: Option<u32>) -> Result<()>;

    /// Hive-wide key/value metadata, such as the installed pipeline.
    fn set_meta(&self, key: &str, value: &str) -> Result<()>;

    fn get_meta(&self, key: &str) -> Result<Option<String>>;
}

/// Job persistence and the conditional updates the state machine relies on.
pub trait JobRepository: Send + Sync {
    /// Insert every batch and store every accumulator entry in one transaction.
    fn apply_flow(&self, batches: &[JobBatch], accus: &[AccuEntry]) -> Result<Vec<BatchIds>>;

    fn insert_batch(&self, batch: JobBatch) -> Result<BatchIds> {
        let mut ids = self.apply_flow(std::slice::from_ref(&batch), &[])?;
        Ok(ids.pop().unwrap_or_default())
    }

    fn get_job(&self, id: JobId) -> Result<Option<AnalysisJob>>;

    /// Jobs filtered by analysis and/or status, in creation order.
    fn list_jobs(&self, analysis_id: Option<i64>, status: Option<JobStatus>) -> Result<Vec<AnalysisJob>>;

    /// Ids of READY jobs whose backoff has expired, in creation order.
    fn claimable_job_ids(&self, analysis_id: i64, limit: usize, now: i64) -> Result<Vec<JobId>>;

    /// READY jobs whose backoff has expired.
    fn count_claimable(&self, analysis_id: i64, now: i64) -> Result<u64>;

    /// Compare-and-set READY -> CLAIMED. `false` when someone else got there first.
    fn claim_job(&self, id: JobId, worker_id: i64, now: i64) -> Result<bool>;

    /// Like [`claim_job`](Self::claim_job), but only while the job's analysis has
    /// fewer than `capacity` jobs in flight. Counting and claiming are one
    /// transaction, so concurrent claimers never overshoot.
    fn claim_job_within(&self, id: JobId, worker_id: i64, now: i64, capacity: u32) -> Result<BoundedClaim>;

    /// Compare-and-set from any of `from` to `to`.
    fn update_job_status(&self, id: JobId, from: &[JobStatus], to: JobStatus) -> Result<bool>;

    /// Move an in-flight job to DONE or PASSED_ON and decrement its funnel in the
    /// same transaction. `Ok(None)` when the job was not in flight.
    fn finish_job(&self, id: JobId, terminal: JobStatus) -> Result<Option<FunnelEffect>>;

    /// Put an in-flight job back to READY with a new retry count.
    fn requeue_job(&self, id: JobId, retry_count: u32, available_at: i64, message: &str) -> Result<bool>;

    /// Mark an in-flight or SEMAPHORED job FAILED.
    fn fail_job(&self, id: JobId, retry_count: u32, message: &str) -> Result<bool>;

    fn jobs_held_by_worker(&self, worker_id: i64) -> Result<Vec<AnalysisJob>>;

    fn count_jobs_by_status(&self, analysis_id: i64) -> Result<StatusCounts>;

    fn accu_for(&self, funnel_job_id: JobId) -> Result<Vec<AccuEntry>>;

    fn log_message(&self, job_id: Option<JobId>, worker_id: Option<i64>, message: &str, is_error: bool) -> Result<()>;

    fn messages_for_job(&self, job_id: JobId) -> Result<Vec<LogMessage>>;
}

/// Worker and role persistence.
pub trait WorkerRepository: Send + Sync {
    /// Register a worker, or return the existing record for `(meadow, process_id)`.
    fn register_worker(
        &self,
        meadow: &str,
        process_id: &str,
        analysis_id: Option<i64>,
        resource_class: Option<&str>,
    ) -> Result<WorkerRecord>;

    fn get_worker(&self, id: i64) -> Result<Option<WorkerRecord>>;

    fn find_worker(&self, meadow: &str, process_id: &str) -> Result<Option<WorkerRecord>>;

    /// Workers not yet DEAD.
    fn live_workers(&self) -> Result<Vec<WorkerRecord>>;

    /// Bind the worker to `analysis_id` unless that would exceed `hive_capacity`
    /// (counting the other live workers bound to it). Atomic.
    fn specialize_worker(
        &self,
        worker_id: i64,
        analysis_id: i64,
        resource_class: &str,
        hive_capacity: Option<u32>,
    ) -> Result<bool>;

    /// Update status and check-in time; a DEAD worker is never revived.
    fn set_worker_status(&self, id: i64, status: WorkerStatus) -> Result<()>;

    fn record_job_done(&self, worker_id: i64) -> Result<()>;

    /// Mark DEAD with a cause. `false` if it was already dead.
    fn mark_worker_dead(&self, id: i64, cause: CauseOfDeath) -> Result<bool>;

    fn start_role(&self, worker_id: i64, analysis_id: i64) -> Result<Role>;

    fn end_role(&self, role_id: i64, attempted_jobs: u32, done_jobs: u32) -> Result<()>;
}

/// Everything the engine needs from a store.
pub trait HiveStore: AnalysisRepository + JobRepository + WorkerRepository {}

impl<T: AnalysisRepository + JobRepository + WorkerRepository> HiveStore for T {}
