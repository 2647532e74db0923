//! Job state machine and semaphore bookkeeping.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::domain::{
    Analysis, AnalysisJob, BRANCH_MEMLIMIT, BRANCH_RUNLIMIT, CauseOfDeath, JobId, JobStatus, NewJob,
};
use crate::error::{ApiaryError, Result};
use crate::id::now_ms;
use crate::jobs::dataflow::{fold_accu, plan_flow};
use crate::pipeline::Pipeline;
use crate::store::{BoundedClaim, FunnelEffect, HiveStore, JobBatch};

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Transient; the job is retried until the threshold
    Recoverable(String),
    /// Retrying cannot help; the job fails permanently at once
    Fatal(String),
    /// The worker holding the job died before reporting
    WorkerLost {
        worker_id: i64,
        cause: CauseOfDeath,
    },
}

impl FailureReason {
    pub fn message(&self) -> String {
        match self {
            FailureReason::Recoverable(msg) | FailureReason::Fatal(msg) => msg.clone(),
            FailureReason::WorkerLost { worker_id, cause } => ApiaryError::WorkerLost {
                worker_id: *worker_id,
                cause: cause.to_string(),
            }
            .to_string(),
        }
    }

    /// Branch specific to this failure, taken before the catch-all.
    fn specific_branch(&self) -> Option<i32> {
        match self {
            FailureReason::WorkerLost {
                cause: CauseOfDeath::RunLimit,
                ..
            } => Some(BRANCH_RUNLIMIT),
            FailureReason::WorkerLost {
                cause: CauseOfDeath::MemLimit,
                ..
            } => Some(BRANCH_MEMLIMIT),
            _ => None,
        }
    }
}

/// What `fail` did with the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued { retry_count: u32, available_at: i64 },
    Failed { retry_count: u32 },
    PassedOn { branch: i32, created: Vec<JobId> },
}

/// A job taken back from a dead worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedJob {
    pub job_id: JobId,
    pub analysis_id: i64,
    /// Status the worker left it in
    pub from: JobStatus,
    pub outcome: FailOutcome,
    /// Set when the normal failure handling broke and the job was failed outright
    pub error: Option<String>,
}

impl ReclaimedJob {
    /// Status the job ended up in.
    pub fn to(&self) -> JobStatus {
        match self.outcome {
            FailOutcome::Requeued { .. } => JobStatus::Ready,
            FailOutcome::Failed { .. } => JobStatus::Failed,
            FailOutcome::PassedOn { .. } => JobStatus::PassedOn,
        }
    }
}

/// Operations on the job graph, all routed through the store.
#[derive(Clone)]
pub struct JobGraph {
    store: Arc<dyn HiveStore>,
    pipeline: Arc<Pipeline>,
}

impl JobGraph {
    pub fn new(store: Arc<dyn HiveStore>, pipeline: Arc<Pipeline>) -> Self {
        Self { store, pipeline }
    }

    pub fn store(&self) -> &Arc<dyn HiveStore> {
        &self.store
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Create a READY job, optionally semaphoring an existing funnel.
    pub fn create(&self, analysis_id: i64, input: Value, semaphored_by: Option<JobId>) -> Result<JobId> {
        self.pipeline.require_analysis_by_id(analysis_id)?;
        let ids = self
            .store
            .insert_batch(JobBatch::single(NewJob::new(analysis_id, input).semaphored_by(semaphored_by)))?;
        let id = ids
            .fan
            .first()
            .copied()
            .ok_or_else(|| ApiaryError::StoreUnavailable("insert returned no job id".to_string()))?;
        debug!(job_id = id, analysis_id, ?semaphored_by, "Created job");
        Ok(id)
    }

    /// The analysis as stored, with capacities edited at run time.
    pub fn current_analysis(&self, analysis_id: i64) -> Result<Analysis> {
        match self.store.get_analysis(analysis_id)? {
            Some(analysis) => Ok(analysis),
            None => Ok(self.pipeline.require_analysis_by_id(analysis_id)?.clone()),
        }
    }

    pub fn get(&self, job_id: JobId) -> Result<AnalysisJob> {
        self.store.get_job(job_id)?.ok_or(ApiaryError::JobNotFound(job_id))
    }

    /// Claim one job. `ClaimConflict` when another worker won.
    pub fn claim(&self, job_id: JobId, worker_id: i64) -> Result<AnalysisJob> {
        if self.store.claim_job(job_id, worker_id, now_ms())? {
            self.get(job_id)
        } else {
            Err(ApiaryError::ClaimConflict(job_id))
        }
    }

    /// Claim up to `n` claimable jobs of an analysis in creation order, within
    /// its `analysis_capacity`. Each capped claim rechecks the in-flight count
    /// in the store, so workers on other connections cannot push it past capacity.
    pub fn claim_batch(&self, analysis_id: i64, worker_id: i64, n: usize) -> Result<Vec<AnalysisJob>> {
        let capacity = self.current_analysis(analysis_id)?.analysis_capacity;
        let mut claimed = Vec::with_capacity(n);
        while claimed.len() < n {
            let candidates = self
                .store
                .claimable_job_ids(analysis_id, (n - claimed.len()) * 2, now_ms())?;
            if candidates.is_empty() {
                break;
            }
            for job_id in candidates {
                if claimed.len() == n {
                    break;
                }
                let outcome = match capacity {
                    Some(capacity) => self.store.claim_job_within(job_id, worker_id, now_ms(), capacity)?,
                    None if self.store.claim_job(job_id, worker_id, now_ms())? => BoundedClaim::Claimed,
                    None => BoundedClaim::Conflict,
                };
                match outcome {
                    BoundedClaim::Claimed => claimed.push(self.get(job_id)?),
                    BoundedClaim::Conflict => {
                        debug!(job_id, worker_id, "Lost claim race, trying next job");
                    }
                    BoundedClaim::AtCapacity => {
                        debug!(analysis_id, worker_id, ?capacity, claimed = claimed.len(), "Analysis at capacity");
                        return Ok(claimed);
                    }
                }
            }
        }
        Ok(claimed)
    }

    /// Hand a claimed but unstarted job back, without counting a retry.
    pub fn release(&self, job_id: JobId) -> Result<()> {
        self.transition(job_id, JobStatus::Claimed, JobStatus::Ready)
    }

    pub fn start_compilation(&self, job_id: JobId) -> Result<()> {
        self.transition(job_id, JobStatus::Claimed, JobStatus::Compilation)
    }

    pub fn start_run(&self, job_id: JobId) -> Result<()> {
        self.transition(job_id, JobStatus::Compilation, JobStatus::Run)
    }

    fn transition(&self, job_id: JobId, from: JobStatus, to: JobStatus) -> Result<()> {
        if self.store.update_job_status(job_id, &[from], to)? {
            Ok(())
        } else {
            Err(ApiaryError::InvalidState(format!("job {job_id} is not {from}, cannot move to {to}")))
        }
    }

    /// Mark an in-flight job DONE and release its funnel.
    pub fn complete(&self, job_id: JobId) -> Result<FunnelEffect> {
        self.finish(job_id, JobStatus::Done)
    }

    fn finish(&self, job_id: JobId, terminal: JobStatus) -> Result<FunnelEffect> {
        match self.store.finish_job(job_id, terminal) {
            Ok(Some(effect)) => {
                if let FunnelEffect::Released { funnel } = effect {
                    info!(job_id, funnel_job_id = funnel, "Funnel released");
                }
                Ok(effect)
            }
            Ok(None) => Err(ApiaryError::InvalidState(format!("job {job_id} is not in flight"))),
            Err(e @ ApiaryError::SemaphoreUnderflow { .. }) => {
                error!(job_id, error = %e, "Semaphore bookkeeping is corrupt");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Record a failure: retry, pass on through a failure branch, or fail for good.
    pub fn fail(&self, job_id: JobId, reason: FailureReason) -> Result<FailOutcome> {
        let job = self.get(job_id)?;
        if !job.status.is_in_flight() {
            return Err(ApiaryError::InvalidState(format!(
                "job {job_id} is {}, only in-flight jobs can fail",
                job.status
            )));
        }
        let analysis = self.pipeline.require_analysis_by_id(job.analysis_id)?;
        let message = reason.message();
        let retry_count = job.retry_count + 1;
        self.store.log_message(Some(job_id), job.worker_id, &message, true)?;

        let specific = reason.specific_branch();
        let specific_rule = specific.filter(|b| self.pipeline.rules_for(&analysis.name, *b).next().is_some());
        let retryable = !matches!(reason, FailureReason::Fatal(_)) && specific_rule.is_none();

        if retryable && retry_count < analysis.max_retry_count {
            let available_at = now_ms() + analysis.retry_delay_ms as i64;
            if !self.store.requeue_job(job_id, retry_count, available_at, &message)? {
                return Err(ApiaryError::InvalidState(format!("job {job_id} left flight before requeue")));
            }
            warn!(
                "{}",
                ApiaryError::RetryableJobFailure {
                    job_id,
                    retry_count,
                    message: message.clone()
                }
            );
            return Ok(FailOutcome::Requeued {
                retry_count,
                available_at,
            });
        }

        if let Some(branch) = self.pipeline.failure_branch(&analysis.name, specific) {
            let created = self.flow(&job, branch, std::slice::from_ref(&job.input))?;
            self.finish(job_id, JobStatus::PassedOn)?;
            info!(job_id, branch, created = created.len(), "Job passed on through failure branch");
            return Ok(FailOutcome::PassedOn { branch, created });
        }

        if !self.store.fail_job(job_id, retry_count, &message)? {
            return Err(ApiaryError::InvalidState(format!("job {job_id} left flight before failing")));
        }
        error!(
            "{}",
            ApiaryError::PermanentJobFailure {
                job_id,
                message: message.clone()
            }
        );

        if analysis.fail_funnel_on_failure {
            self.fail_funnel_chain(&job, &message)?;
        }
        Ok(FailOutcome::Failed { retry_count })
    }

    fn fail_funnel_chain(&self, job: &AnalysisJob, message: &str) -> Result<()> {
        let mut next = job.semaphored_by;
        while let Some(funnel_id) = next {
            let funnel = self.get(funnel_id)?;
            let reason = format!("semaphored job {} failed: {message}", job.id);
            if self.store.fail_job(funnel_id, funnel.retry_count, &reason)? {
                warn!(funnel_job_id = funnel_id, job_id = job.id, "Failure propagated to funnel");
            }
            next = funnel.semaphored_by;
        }
        Ok(())
    }

    /// Apply the pipeline's rules for `(job's analysis, branch)`.
    pub fn flow(&self, emitter: &AnalysisJob, branch: i32, payloads: &[Value]) -> Result<Vec<JobId>> {
        let plan = plan_flow(&self.pipeline, emitter, branch, payloads)?;
        if plan.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self.store.apply_flow(&plan.batches, &plan.accus)?;
        let created: Vec<JobId> = ids.iter().flat_map(|b| b.all()).collect();
        debug!(
            job_id = emitter.id,
            branch,
            created = created.len(),
            accumulated = plan.accus.len(),
            "Dataflow applied"
        );
        Ok(created)
    }

    /// Fan-in data accumulated into a funnel job.
    pub fn accumulated(&self, funnel_job_id: JobId) -> Result<Map<String, Value>> {
        Ok(fold_accu(&self.store.accu_for(funnel_job_id)?))
    }

    /// Fail every job a dead worker still holds.
    ///
    /// A job whose failure handling breaks (a failure branch that cannot be
    /// planned, say) is failed outright and the error kept on its record, so
    /// one bad job never strands the rest. Only store outages propagate.
    pub fn reclaim_worker_jobs(&self, worker_id: i64, cause: CauseOfDeath) -> Result<Vec<ReclaimedJob>> {
        let held = self.store.jobs_held_by_worker(worker_id)?;
        let mut reclaimed = Vec::with_capacity(held.len());
        for job in held {
            let (outcome, error) = match self.fail(job.id, FailureReason::WorkerLost { worker_id, cause }) {
                Ok(outcome) => (outcome, None),
                Err(e) if e.aborts_pass() => return Err(e),
                Err(e) => {
                    warn!(job_id = job.id, worker_id, error = %e, "Reclaim failed, failing job outright");
                    let retry_count = job.retry_count + 1;
                    let message = format!("reclaimed from dead worker {worker_id}: {e}");
                    self.store.fail_job(job.id, retry_count, &message)?;
                    (FailOutcome::Failed { retry_count }, Some(e.to_string()))
                }
            };
            info!(job_id = job.id, worker_id, cause = %cause, ?outcome, "Reclaimed job from dead worker");
            reclaimed.push(ReclaimedJob {
                job_id: job.id,
                analysis_id: job.analysis_id,
                from: job.status,
                outcome,
                error,
            });
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccuKind, Analysis, BRANCH_ANY_FAILURE, BRANCH_MAIN, DataflowRule, DataflowTarget};
    use crate::store::{JobRepository, SqliteStore};
    use serde_json::json;

    fn graph_for(pipeline: Pipeline) -> JobGraph {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let pipeline = pipeline.install(store.as_ref()).unwrap();
        JobGraph::new(store, Arc::new(pipeline))
    }

    fn fan_pipeline() -> Pipeline {
        Pipeline::new("fan")
            .with_analysis(Analysis::new(0, "start", "Dummy"))
            .with_analysis(Analysis::new(0, "work", "Dummy"))
            .with_analysis(Analysis::new(0, "sum", "Dummy"))
            .with_rule(DataflowRule::new("start", BRANCH_MAIN, DataflowTarget::analysis("work")).with_funnel("sum", None))
            .with_rule(DataflowRule::new(
                "work",
                BRANCH_MAIN,
                DataflowTarget::accumulator("vals", AccuKind::List),
            ))
    }

    fn id(graph: &JobGraph, name: &str) -> i64 {
        graph.pipeline().analysis(name).unwrap().id
    }

    fn run_to_completion(graph: &JobGraph, job_id: JobId) -> FunnelEffect {
        graph.claim(job_id, 1).unwrap();
        graph.start_compilation(job_id).unwrap();
        graph.start_run(job_id).unwrap();
        graph.complete(job_id).unwrap()
    }

    #[test]
    fn test_fan_of_three_releases_funnel_after_third() {
        let graph = graph_for(fan_pipeline());
        let start = graph.create(id(&graph, "start"), json!({}), None).unwrap();
        let emitter = graph.claim(start, 1).unwrap();

        let created = graph
            .flow(&emitter, BRANCH_MAIN, &[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})])
            .unwrap();
        assert_eq!(created.len(), 4);
        let funnel = created[0];
        let funnel_job = graph.get(funnel).unwrap();
        assert_eq!(funnel_job.status, JobStatus::Semaphored);
        assert_eq!(funnel_job.semaphore_count, 3);

        assert!(matches!(run_to_completion(&graph, created[1]), FunnelEffect::Decremented { remaining: 2, .. }));
        assert!(matches!(run_to_completion(&graph, created[2]), FunnelEffect::Decremented { remaining: 1, .. }));
        assert_eq!(run_to_completion(&graph, created[3]), FunnelEffect::Released { funnel });
        assert_eq!(graph.get(funnel).unwrap().status, JobStatus::Ready);
    }

    #[test]
    fn test_empty_fan_gives_ready_funnel() {
        let graph = graph_for(fan_pipeline());
        let start = graph.create(id(&graph, "start"), json!({}), None).unwrap();
        let emitter = graph.claim(start, 1).unwrap();
        let created = graph.flow(&emitter, BRANCH_MAIN, &[]).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(graph.get(created[0]).unwrap().status, JobStatus::Ready);
    }

    #[test]
    fn test_accumulated_values_reach_funnel() {
        let graph = graph_for(fan_pipeline());
        let start = graph.create(id(&graph, "start"), json!({}), None).unwrap();
        let emitter = graph.claim(start, 1).unwrap();
        let created = graph.flow(&emitter, BRANCH_MAIN, &[json!({}), json!({})]).unwrap();

        for (i, job_id) in created[1..].iter().enumerate() {
            let job = graph.claim(*job_id, 2).unwrap();
            graph.flow(&job, BRANCH_MAIN, &[json!({ "vals": i })]).unwrap();
        }
        assert_eq!(graph.accumulated(created[0]).unwrap()["vals"], json!([0, 1]));
    }

    #[test]
    fn test_create_semaphored_by_claimed_funnel_is_invalid() {
        let graph = graph_for(fan_pipeline());
        let start_id = id(&graph, "start");
        let funnel = graph.create(start_id, json!({}), None).unwrap();
        graph.claim(funnel, 1).unwrap();
        assert!(matches!(
            graph.create(start_id, json!({}), Some(funnel)),
            Err(ApiaryError::InvalidState(_))
        ));
    }

    #[test]
    fn test_claim_conflict() {
        let graph = graph_for(fan_pipeline());
        let job = graph.create(id(&graph, "start"), json!({}), None).unwrap();
        graph.claim(job, 1).unwrap();
        assert!(matches!(graph.claim(job, 2), Err(ApiaryError::ClaimConflict(j)) if j == job));
    }

    #[test]
    fn test_release_returns_job_without_retry() {
        let graph = graph_for(fan_pipeline());
        let job = graph.create(id(&graph, "start"), json!({}), None).unwrap();
        graph.claim(job, 1).unwrap();
        graph.release(job).unwrap();

        let released = graph.get(job).unwrap();
        assert_eq!(released.status, JobStatus::Ready);
        assert_eq!(released.retry_count, 0);
        assert!(graph.claim(job, 2).is_ok());
        assert!(matches!(graph.release(job + 100), Err(ApiaryError::InvalidState(_))));
    }

    #[test]
    fn test_claim_batch_respects_analysis_capacity() {
        let mut work = Analysis::new(0, "work", "Dummy");
        work.analysis_capacity = Some(2);
        let graph = graph_for(Pipeline::new("cap").with_analysis(work));
        let work_id = id(&graph, "work");
        for _ in 0..5 {
            graph.create(work_id, json!({}), None).unwrap();
        }
        assert_eq!(graph.claim_batch(work_id, 1, 10).unwrap().len(), 2);
        assert!(graph.claim_batch(work_id, 2, 10).unwrap().is_empty());
    }

    #[test]
    fn test_third_failure_is_permanent() {
        let graph = graph_for(Pipeline::new("retry").with_analysis(Analysis::new(0, "a", "Dummy").with_max_retry_count(3)));
        let job = graph.create(id(&graph, "a"), json!({}), None).unwrap();

        for expected in 1..=2 {
            graph.claim(job, 1).unwrap();
            let outcome = graph.fail(job, FailureReason::Recoverable("flaky".into())).unwrap();
            assert!(matches!(outcome, FailOutcome::Requeued { retry_count, .. } if retry_count == expected));
            assert_eq!(graph.get(job).unwrap().status, JobStatus::Ready);
        }

        graph.claim(job, 1).unwrap();
        let outcome = graph.fail(job, FailureReason::Recoverable("flaky".into())).unwrap();
        assert_eq!(outcome, FailOutcome::Failed { retry_count: 3 });
        let failed = graph.get(job).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(matches!(graph.claim(job, 1), Err(ApiaryError::ClaimConflict(_))));
    }

    #[test]
    fn test_fatal_failure_skips_retries() {
        let graph = graph_for(Pipeline::new("fatal").with_analysis(Analysis::new(0, "a", "Dummy")));
        let job = graph.create(id(&graph, "a"), json!({}), None).unwrap();
        graph.claim(job, 1).unwrap();
        assert_eq!(
            graph.fail(job, FailureReason::Fatal("bad input".into())).unwrap(),
            FailOutcome::Failed { retry_count: 1 }
        );
    }

    #[test]
    fn test_failure_branch_passes_on() {
        let graph = graph_for(
            Pipeline::new("pass")
                .with_analysis(Analysis::new(0, "a", "Dummy").with_max_retry_count(1))
                .with_analysis(Analysis::new(0, "rescue", "Dummy"))
                .with_rule(DataflowRule::new("a", BRANCH_ANY_FAILURE, DataflowTarget::analysis("rescue"))),
        );
        let job = graph.create(id(&graph, "a"), json!({"x": 1}), None).unwrap();
        graph.claim(job, 1).unwrap();

        let outcome = graph.fail(job, FailureReason::Recoverable("boom".into())).unwrap();
        let FailOutcome::PassedOn { branch, created } = outcome else {
            panic!("expected pass-on, got {outcome:?}");
        };
        assert_eq!(branch, BRANCH_ANY_FAILURE);
        assert_eq!(graph.get(job).unwrap().status, JobStatus::PassedOn);
        let rescued = graph.get(created[0]).unwrap();
        assert_eq!(rescued.input, json!({"x": 1}));
        assert_eq!(rescued.prev_job, Some(job));
    }

    #[test]
    fn test_fail_funnel_on_failure_propagates() {
        let mut work = Analysis::new(0, "work", "Dummy").with_max_retry_count(1);
        work.fail_funnel_on_failure = true;
        let graph = graph_for(
            Pipeline::new("prop")
                .with_analysis(Analysis::new(0, "start", "Dummy"))
                .with_analysis(work)
                .with_analysis(Analysis::new(0, "sum", "Dummy"))
                .with_rule(
                    DataflowRule::new("start", BRANCH_MAIN, DataflowTarget::analysis("work")).with_funnel("sum", None),
                ),
        );
        let start = graph.create(id(&graph, "start"), json!({}), None).unwrap();
        let emitter = graph.claim(start, 1).unwrap();
        let created = graph.flow(&emitter, BRANCH_MAIN, &[json!({})]).unwrap();

        graph.claim(created[1], 2).unwrap();
        graph.fail(created[1], FailureReason::Recoverable("boom".into())).unwrap();
        assert_eq!(graph.get(created[0]).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn test_reclaim_requeues_with_worker_lost() {
        let graph = graph_for(Pipeline::new("lost").with_analysis(Analysis::new(0, "a", "Dummy")));
        let job = graph.create(id(&graph, "a"), json!({}), None).unwrap();
        graph.claim(job, 42).unwrap();

        let reclaimed = graph.reclaim_worker_jobs(42, CauseOfDeath::KilledByUser).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].from, JobStatus::Claimed);
        assert_eq!(reclaimed[0].to(), JobStatus::Ready);
        assert!(reclaimed[0].error.is_none());
        let reclaimed = graph.get(job).unwrap();
        assert_eq!(reclaimed.status, JobStatus::Ready);
        assert_eq!(reclaimed.retry_count, 1);
        assert!(reclaimed.last_error.unwrap().contains("Worker 42 lost"));
        assert_eq!(graph.store().messages_for_job(job).unwrap().len(), 1);
    }

    #[test]
    fn test_run_limit_takes_specific_branch_immediately() {
        let graph = graph_for(
            Pipeline::new("runlimit")
                .with_analysis(Analysis::new(0, "a", "Dummy"))
                .with_analysis(Analysis::new(0, "bigger", "Dummy"))
                .with_rule(DataflowRule::new("a", BRANCH_RUNLIMIT, DataflowTarget::analysis("bigger"))),
        );
        let job = graph.create(id(&graph, "a"), json!({}), None).unwrap();
        graph.claim(job, 9).unwrap();
        let reclaimed = graph.reclaim_worker_jobs(9, CauseOfDeath::RunLimit).unwrap();
        assert!(matches!(reclaimed[0].outcome, FailOutcome::PassedOn { branch: BRANCH_RUNLIMIT, .. }));
    }

    #[test]
    fn test_reclaim_fails_job_when_failure_branch_breaks() {
        let graph = graph_for(
            Pipeline::new("rescue")
                .with_analysis(Analysis::new(0, "a", "Dummy").with_max_retry_count(1))
                .with_analysis(Analysis::new(0, "rescue", "Dummy"))
                .with_rule(DataflowRule::new(
                    "a",
                    BRANCH_ANY_FAILURE,
                    DataflowTarget::templated("rescue", json!({"x": "#missing_param#"})),
                )),
        );
        let first = graph.create(id(&graph, "a"), json!({}), None).unwrap();
        let second = graph.create(id(&graph, "a"), json!({}), None).unwrap();
        graph.claim(first, 5).unwrap();
        graph.claim(second, 5).unwrap();

        let reclaimed = graph.reclaim_worker_jobs(5, CauseOfDeath::Unknown).unwrap();
        assert_eq!(reclaimed.len(), 2);
        for job in &reclaimed {
            assert_eq!(job.to(), JobStatus::Failed);
            assert!(job.error.as_deref().unwrap().contains("missing_param"));
            assert_eq!(graph.get(job.job_id).unwrap().status, JobStatus::Failed);
        }
        assert!(graph.store().list_jobs(Some(id(&graph, "rescue")), None).unwrap().is_empty());
    }

    #[test]
    fn test_complete_requires_in_flight() {
        let graph = graph_for(fan_pipeline());
        let job = graph.create(id(&graph, "start"), json!({}), None).unwrap();
        assert!(matches!(graph.complete(job), Err(ApiaryError::InvalidState(_))));
        assert!(matches!(graph.start_run(job), Err(ApiaryError::InvalidState(_))));
    }
}
