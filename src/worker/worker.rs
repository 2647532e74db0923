//! Worker lifecycle: specialize, claim batches, run jobs, die.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::domain::{Analysis, AnalysisJob, BRANCH_MAIN, CauseOfDeath, Role, WorkerRecord, WorkerStatus};
use crate::error::{ApiaryError, Result};
use crate::jobs::{FailureReason, JobGraph};
use crate::limiter::{Limiter, LimiterToken};
use crate::meadow::{RoleSpec, WorkerHandle, WorkerLauncher};
use crate::params::ParamContainer;
use crate::worker::runnable::{JobContext, RunOutcome, Runnable, RunnableRegistry, execute};

/// Limits and habits of a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Die with JOB_LIMIT after this many jobs
    pub job_limit: Option<u32>,
    /// Die with LIFESPAN once this old
    pub life_span: Option<Duration>,
    /// Pick another analysis when the current one runs dry
    pub can_respecialize: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_limit: None,
            life_span: Some(Duration::from_secs(3600)),
            can_respecialize: true,
        }
    }
}

/// What every worker of a hive shares.
#[derive(Clone)]
pub struct WorkerContext {
    pub graph: JobGraph,
    pub registry: Arc<RunnableRegistry>,
    pub limiter: Limiter,
    pub config: WorkerConfig,
}

impl WorkerContext {
    pub fn new(graph: JobGraph, registry: Arc<RunnableRegistry>, limiter: Limiter, config: WorkerConfig) -> Self {
        Self {
            graph,
            registry,
            limiter,
            config,
        }
    }

    /// Launcher for a local meadow: each submitted worker runs in-process.
    pub fn launcher(&self) -> WorkerLauncher {
        let ctx = self.clone();
        Arc::new(move |spec: RoleSpec, handle: WorkerHandle| {
            let ctx = ctx.clone();
            async move { run_worker(ctx, handle, spec).await }.boxed()
        })
    }
}

/// Register, live and die. Returns the cause of death.
pub async fn run_worker(ctx: WorkerContext, handle: WorkerHandle, spec: RoleSpec) -> CauseOfDeath {
    match Worker::register(ctx, &handle, &spec) {
        Ok(worker) => worker.run().await,
        Err(e) => {
            error!(process_id = %handle.process_id, error = %e, "Worker could not register");
            CauseOfDeath::Unknown
        }
    }
}

struct ActiveRole {
    role: Role,
    analysis: Analysis,
    runnable: Box<dyn Runnable>,
    _token: LimiterToken,
    attempted: u32,
    done: u32,
}

pub struct Worker {
    ctx: WorkerContext,
    record: WorkerRecord,
    requested: Option<i64>,
    role: Option<ActiveRole>,
    jobs_done: u32,
    born: Instant,
}

impl Worker {
    /// Register in the store (idempotent) as UNSPECIALIZED.
    pub fn register(ctx: WorkerContext, handle: &WorkerHandle, spec: &RoleSpec) -> Result<Self> {
        let record = ctx.graph.store().register_worker(
            &handle.meadow,
            &handle.process_id,
            spec.analysis_id,
            Some(&spec.resource_class),
        )?;
        debug!(worker_id = record.id, process_id = %handle.process_id, "Worker registered");
        Ok(Self {
            ctx,
            record,
            requested: spec.analysis_id,
            role: None,
            jobs_done: 0,
            born: Instant::now(),
        })
    }

    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub async fn run(mut self) -> CauseOfDeath {
        let cause = match self.live().await {
            Ok(cause) => cause,
            Err(e @ ApiaryError::StoreUnavailable(_)) => {
                error!(worker_id = self.id(), error = %e, "Worker lost the store");
                CauseOfDeath::Unknown
            }
            Err(e) => {
                error!(worker_id = self.id(), error = %e, "Worker failed");
                CauseOfDeath::Contaminated
            }
        };
        if let Err(e) = self.die(cause) {
            error!(worker_id = self.id(), error = %e, "Worker could not record its death");
        }
        cause
    }

    async fn live(&mut self) -> Result<CauseOfDeath> {
        let requested = self.requested.take();
        if let Err(cause) = self.specialize(requested, None)? {
            return Ok(cause);
        }

        loop {
            if let Some(cause) = self.limit_reached() {
                return Ok(cause);
            }
            let Some(active) = self.role.as_ref() else {
                return Ok(CauseOfDeath::NoRole);
            };
            let analysis_id = active.analysis.id;
            let batch_size = active.analysis.effective_batch_size() as usize;

            let batch = self.ctx.graph.claim_batch(analysis_id, self.id(), batch_size)?;
            if batch.is_empty() {
                if !self.ctx.config.can_respecialize {
                    return Ok(CauseOfDeath::NoWork);
                }
                self.end_role()?;
                match self.specialize(None, Some(analysis_id))? {
                    Ok(()) => continue,
                    Err(_) => return Ok(CauseOfDeath::NoWork),
                }
            }

            self.ctx.graph.store().set_worker_status(self.id(), WorkerStatus::BatchRunning)?;
            let mut pending = batch.into_iter();
            while let Some(job) = pending.next() {
                if let Some(cause) = self.limit_reached() {
                    self.release_all(std::iter::once(job).chain(pending))?;
                    return Ok(cause);
                }
                if let Some(cause) = self.run_job(job).await? {
                    self.release_all(pending)?;
                    return Ok(cause);
                }
            }
            self.ctx.graph.store().set_worker_status(self.id(), WorkerStatus::Idle)?;
        }
    }

    /// Bind to `requested`, or to the first analysis with claimable jobs.
    /// `Err(cause)` when no role could be taken.
    fn specialize(&mut self, requested: Option<i64>, exclude: Option<i64>) -> Result<std::result::Result<(), CauseOfDeath>> {
        if let Some(analysis_id) = requested {
            let analysis = self.ctx.graph.current_analysis(analysis_id)?;
            return Ok(self.take_role(analysis)?.ok_or(CauseOfDeath::HiveOverload));
        }

        let candidates: Vec<i64> = self
            .ctx
            .graph
            .pipeline()
            .analyses
            .iter()
            .map(|a| a.id)
            .filter(|id| Some(*id) != exclude)
            .collect();
        for analysis_id in candidates {
            let analysis = self.ctx.graph.current_analysis(analysis_id)?;
            if !self.has_claimable(&analysis)? || self.ctrl_blocked(&analysis)? {
                continue;
            }
            if self.take_role(analysis)?.is_some() {
                return Ok(Ok(()));
            }
        }
        Ok(Err(CauseOfDeath::NoRole))
    }

    fn has_claimable(&self, analysis: &Analysis) -> Result<bool> {
        let now = crate::id::now_ms();
        Ok(!self.ctx.graph.store().claimable_job_ids(analysis.id, 1, now)?.is_empty())
    }

    fn ctrl_blocked(&self, analysis: &Analysis) -> Result<bool> {
        let pipeline = self.ctx.graph.pipeline();
        for rule in pipeline.ctrl_rules_for(&analysis.name) {
            let condition = pipeline.require_analysis(&rule.condition_analysis)?;
            if self.ctx.graph.store().count_jobs_by_status(condition.id)?.incomplete() > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Limiter token first, then the store's capacity check. `None` when refused.
    fn take_role(&mut self, analysis: Analysis) -> Result<Option<()>> {
        let Some(token) = self.ctx.limiter.try_acquire(&analysis.resource_class) else {
            debug!(worker_id = self.id(), resource_class = %analysis.resource_class, "Resource class full");
            return Ok(None);
        };
        let store = self.ctx.graph.store();
        if !store.specialize_worker(self.id(), analysis.id, &analysis.resource_class, analysis.hive_capacity)? {
            debug!(worker_id = self.id(), analysis = %analysis.name, "Hive capacity reached");
            return Ok(None);
        }
        let runnable = self.ctx.registry.create(&analysis.module)?;
        let role = store.start_role(self.id(), analysis.id)?;
        info!(worker_id = self.id(), role_id = role.id, analysis = %analysis.name, "Worker specialized");
        self.role = Some(ActiveRole {
            role,
            analysis,
            runnable,
            _token: token,
            attempted: 0,
            done: 0,
        });
        Ok(Some(()))
    }

    fn end_role(&mut self) -> Result<()> {
        if let Some(active) = self.role.take() {
            self.ctx
                .graph
                .store()
                .end_role(active.role.id, active.attempted, active.done)?;
            debug!(worker_id = self.id(), role_id = active.role.id, done = active.done, "Role ended");
        }
        Ok(())
    }

    fn limit_reached(&self) -> Option<CauseOfDeath> {
        if let Some(limit) = self.ctx.config.job_limit
            && self.jobs_done >= limit
        {
            return Some(CauseOfDeath::JobLimit);
        }
        if let Some(span) = self.ctx.config.life_span
            && self.born.elapsed() >= span
        {
            return Some(CauseOfDeath::Lifespan);
        }
        None
    }

    fn release_all(&self, jobs: impl IntoIterator<Item = AnalysisJob>) -> Result<()> {
        for job in jobs {
            self.ctx.graph.release(job.id)?;
            debug!(job_id = job.id, worker_id = self.id(), "Released unstarted job");
        }
        Ok(())
    }

    /// Run one claimed job to an outcome. `Some(cause)` when the worker must die.
    async fn run_job(&mut self, job: AnalysisJob) -> Result<Option<CauseOfDeath>> {
        let worker_id = self.id();
        let graph = self.ctx.graph.clone();
        let Some(active) = self.role.as_mut() else {
            return Err(ApiaryError::InvalidState(format!("worker {worker_id} has no role")));
        };
        active.attempted += 1;

        graph.start_compilation(job.id)?;
        let params = assemble_params(&graph, active.runnable.as_ref(), &active.analysis, &job)?;
        let ctx = JobContext::new(&job, &active.analysis.name, params);
        graph.start_run(job.id)?;
        debug!(job_id = job.id, worker_id, analysis = %active.analysis.name, "Running job");

        let result = match active.analysis.job_timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), execute(active.runnable.as_ref(), ctx)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(job_id = job.id, worker_id, timeout_ms = ms, "Job exceeded its run limit");
                    return Ok(Some(CauseOfDeath::RunLimit));
                }
            },
            None => execute(active.runnable.as_ref(), ctx).await,
        };

        let store = graph.store();
        for (message, is_error) in &result.messages {
            store.log_message(Some(job.id), Some(worker_id), message, *is_error)?;
        }

        match &result.outcome {
            RunOutcome::Success => {
                for event in &result.branch_events {
                    graph.flow(&job, event.branch, &event.payloads)?;
                }
                if result.autoflow && !result.flowed_on(BRANCH_MAIN) {
                    graph.flow(&job, BRANCH_MAIN, std::slice::from_ref(&job.input))?;
                }
                graph.complete(job.id)?;
                store.record_job_done(worker_id)?;
                active.done += 1;
                self.jobs_done += 1;
                debug!(job_id = job.id, worker_id, "Job done");
            }
            RunOutcome::RecoverableFailure(message) => {
                graph.fail(job.id, FailureReason::Recoverable(message.clone()))?;
            }
            RunOutcome::FatalFailure(message) => {
                graph.fail(job.id, FailureReason::Fatal(message.clone()))?;
            }
        }

        if result.lethal {
            warn!(job_id = job.id, worker_id, "Job failure is lethal for its worker");
            return Ok(Some(CauseOfDeath::Contaminated));
        }
        Ok(None)
    }

    fn die(&mut self, cause: CauseOfDeath) -> Result<()> {
        let reclaimed = self.ctx.graph.reclaim_worker_jobs(self.id(), cause)?;
        if !reclaimed.is_empty() {
            warn!(worker_id = self.id(), jobs = reclaimed.len(), cause = %cause, "Dying worker gave up its jobs");
        }
        self.end_role()?;
        if self.ctx.graph.store().mark_worker_dead(self.id(), cause)? {
            info!(worker_id = self.id(), cause = %cause, jobs_done = self.jobs_done, "Worker died");
        }
        Ok(())
    }
}

/// runnable defaults < pipeline params < analysis params < job input < accumulated data
fn assemble_params(
    graph: &JobGraph,
    runnable: &dyn Runnable,
    analysis: &Analysis,
    job: &AnalysisJob,
) -> Result<ParamContainer> {
    let defaults = Value::Object(runnable.param_defaults());
    let accumulated = Value::Object(graph.accumulated(job.id)?);
    Ok(ParamContainer::from_layers([
        &defaults,
        &graph.pipeline().params,
        &analysis.parameters,
        &job.input,
        &accumulated,
    ]))
}
