//! The Queen: liveness sweeps, scheduling passes and the beekeeper loop.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::{CauseOfDeath, JobId, JobStatus};
use crate::error::{ApiaryError, Result};
use crate::id::now_ms;
use crate::jobs::{FailOutcome, JobGraph, ReclaimedJob};
use crate::limiter::Limiter;
use crate::meadow::{Liveness, RoleSpec, Valley, WorkerHandle};
use crate::pipeline::Pipeline;
use crate::queen::beekeeper::{BeekeeperConfig, BeekeeperState};
use crate::queen::report::{DeadWorker, PassReport, PipelineReport, PipelineState, assess};
use crate::scheduler::{Allocation, AnalysisView, Headroom, Scheduler};
use crate::stats::{AnalysisHint, StatsCache, StatsConfig};

#[derive(Debug, Clone, Default)]
pub struct QueenConfig {
    pub scheduler: Scheduler,
    pub stats: StatsConfig,
    pub beekeeper: BeekeeperConfig,
}

pub struct Queen {
    graph: JobGraph,
    stats: StatsCache,
    scheduler: Scheduler,
    valley: Valley,
    limiter: Limiter,
    beekeeper: BeekeeperConfig,
    state: BeekeeperState,
}

impl Queen {
    /// Build a Queen over an installed pipeline. Resource class limits from the
    /// pipeline are applied to `limiter`, which workers share.
    pub fn new(graph: JobGraph, valley: Valley, limiter: Limiter, config: QueenConfig) -> Self {
        for rc in &graph.pipeline().resource_classes {
            limiter.set_limit(rc.name.clone(), rc.limit);
        }
        let stats = StatsCache::new(Arc::clone(graph.store()), Arc::clone(graph.pipeline()), config.stats);
        Self {
            graph,
            stats,
            scheduler: config.scheduler,
            valley,
            limiter,
            beekeeper: config.beekeeper,
            state: BeekeeperState::new(),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        self.graph.pipeline()
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    pub fn stats(&self) -> &StatsCache {
        &self.stats
    }

    pub fn state(&self) -> &BeekeeperState {
        &self.state
    }

    /// Create a job for `analysis_name`.
    pub fn seed_job(&self, analysis_name: &str, input: Value) -> Result<JobId> {
        let analysis_id = self.pipeline().require_analysis(analysis_name)?.id;
        let job_id = self.graph.create(analysis_id, input, None)?;
        self.stats.record_transition(analysis_id, None, JobStatus::Ready);
        info!(job_id, analysis = analysis_name, "Seeded job");
        Ok(job_id)
    }

    /// Create the pipeline's seed jobs.
    pub fn seed_pipeline(&self) -> Result<Vec<JobId>> {
        let pipeline = Arc::clone(self.pipeline());
        pipeline
            .seeds
            .iter()
            .map(|seed| self.seed_job(&seed.analysis, seed.input.clone()))
            .collect()
    }

    /// Change an analysis' capacities while the pipeline runs.
    pub fn set_capacity(&self, analysis_name: &str, hive_capacity: Option<u32>, analysis_capacity: Option<u32>) -> Result<()> {
        let analysis_id = self.pipeline().require_analysis(analysis_name)?.id;
        self.graph
            .store()
            .set_capacity(analysis_id, hive_capacity, analysis_capacity)?;
        self.stats.touch(analysis_id);
        info!(analysis = analysis_name, ?hive_capacity, ?analysis_capacity, "Capacity changed");
        Ok(())
    }

    /// Ask the worker's meadow to kill it. The next sweep reclaims its jobs.
    pub async fn kill_worker(&self, worker_id: i64) -> Result<()> {
        let worker = self
            .graph
            .store()
            .get_worker(worker_id)?
            .ok_or(ApiaryError::WorkerNotFound(worker_id))?;
        let meadow = self.valley.meadow_for_worker(&worker)?;
        meadow
            .kill(&WorkerHandle::new(&worker.meadow, &worker.process_id))
            .await?;
        info!(worker_id, meadow = %worker.meadow, process_id = %worker.process_id, "Kill requested");
        Ok(())
    }

    /// Bury every live worker record whose process is gone and reclaim its jobs.
    ///
    /// A worker is only judged when its meadow answered; a process the meadow
    /// does not know about is dead with cause UNKNOWN. A worker whose jobs
    /// cannot be reclaimed cleanly is buried all the same, with the errors kept
    /// on its [`DeadWorker`]. Dead processes are then forgotten by their meadow.
    pub async fn check_for_dead_workers(&self) -> Result<Vec<DeadWorker>> {
        let statuses = self.valley.status_of_all_workers().await;
        let store = self.graph.store();
        let mut dead = Vec::new();

        for worker in store.live_workers()? {
            let Some(meadow_status) = statuses.get(&worker.meadow) else {
                continue;
            };
            let cause = match meadow_status.get(&worker.process_id) {
                Some(Liveness::Alive) => continue,
                Some(Liveness::Dead(cause)) => cause.unwrap_or(CauseOfDeath::Unknown),
                None => CauseOfDeath::Unknown,
            };

            let mut errors = Vec::new();
            let reclaimed = match self.graph.reclaim_worker_jobs(worker.id, cause) {
                Ok(reclaimed) => reclaimed,
                Err(e) if e.aborts_pass() => return Err(e),
                Err(e) => {
                    warn!(worker_id = worker.id, error = %e, "Could not reclaim jobs of dead worker");
                    errors.push(e.to_string());
                    Vec::new()
                }
            };
            for job in &reclaimed {
                errors.extend(job.error.clone());
                self.record_reclaim(job)?;
            }

            if store.mark_worker_dead(worker.id, cause)? {
                warn!(
                    worker_id = worker.id,
                    meadow = %worker.meadow,
                    process_id = %worker.process_id,
                    cause = %cause,
                    reclaimed = reclaimed.len(),
                    errors = errors.len(),
                    "Buried dead worker"
                );
            }
            if let Some(analysis_id) = worker.analysis_id {
                self.stats.record_workers(analysis_id, -1);
            }
            dead.push(DeadWorker {
                worker_id: worker.id,
                meadow: worker.meadow,
                process_id: worker.process_id,
                cause: cause.to_string(),
                reclaimed_jobs: reclaimed.len(),
                errors,
            });
        }

        for (meadow, status) in &statuses {
            let gone: Vec<String> = status
                .iter()
                .filter(|(_, liveness)| !liveness.is_alive())
                .map(|(process_id, _)| process_id.clone())
                .collect();
            self.valley.forget(meadow, &gone).await;
        }
        Ok(dead)
    }

    /// Feed a reclaimed job, and any jobs its failure branch created, to the stats cache.
    fn record_reclaim(&self, job: &ReclaimedJob) -> Result<()> {
        self.stats.record_transition(job.analysis_id, Some(job.from), job.to());
        if let FailOutcome::PassedOn { created, .. } = &job.outcome {
            for id in created {
                let created = self.graph.get(*id)?;
                self.stats.record_transition(created.analysis_id, None, created.status);
            }
        }
        Ok(())
    }

    /// One scheduling pass. A store failure aborts the pass and drops the
    /// stats cache; the caller retries on the next tick.
    pub async fn run_pass(&mut self) -> Result<PassReport> {
        self.state.tick();
        match self.pass().await {
            Ok(report) => {
                self.state.buried(report.dead_workers.len(), report.jobs_reclaimed());
                self.state.submitted(report.workers_submitted());
                Ok(report)
            }
            Err(e) => {
                if e.aborts_pass() {
                    warn!(pass = self.state.passes, error = %e, "Pass aborted");
                    self.stats.invalidate_all();
                    self.state.aborted();
                }
                Err(e)
            }
        }
    }

    async fn pass(&self) -> Result<PassReport> {
        let dead_workers = self.check_for_dead_workers().await?;

        let pipeline = Arc::clone(self.pipeline());
        let live = self.graph.store().live_workers()?;
        let mut live_by_analysis: HashMap<i64, u32> = HashMap::new();
        let mut live_by_meadow: HashMap<String, usize> = HashMap::new();
        let mut live_by_class: HashMap<String, usize> = HashMap::new();
        for worker in &live {
            if let Some(analysis_id) = worker.analysis_id {
                *live_by_analysis.entry(analysis_id).or_default() += 1;
            }
            *live_by_meadow.entry(worker.meadow.clone()).or_default() += 1;
            if let Some(rc) = &worker.resource_class {
                *live_by_class.entry(rc.clone()).or_default() += 1;
            }
        }

        let mut views = Vec::with_capacity(pipeline.analyses.len());
        for analysis in &pipeline.analyses {
            let current = self.graph.current_analysis(analysis.id)?;
            let stats = self.stats.get(analysis.id)?;
            let mut view = AnalysisView::new(analysis.id, &analysis.name);
            // Jobs still in retry backoff are READY but not claimable yet
            view.ready_jobs = if stats.hint == AnalysisHint::Failed || stats.counts.ready == 0 {
                0
            } else {
                self.graph.store().count_claimable(analysis.id, now_ms())?
            };
            view.in_flight_jobs = stats.counts.in_flight();
            view.incomplete_jobs = stats.counts.incomplete();
            view.live_workers = live_by_analysis.get(&analysis.id).copied().unwrap_or(0);
            view.hive_capacity = current.hive_capacity;
            view.analysis_capacity = current.analysis_capacity;
            view.batch_size = current.effective_batch_size();
            view.resource_class = current.resource_class.clone();
            view.meadow = self.valley.meadow_name_for(&current)?;
            views.push(view);
        }

        let mut headroom = Headroom {
            global: self.scheduler.global_headroom(live.len()),
            meadows: self.valley.headroom(&live_by_meadow),
            resource_classes: HashMap::new(),
        };
        for name in pipeline.resource_class_names() {
            if let Some(limit) = self.limiter.limit(&name) {
                let used = self
                    .limiter
                    .in_use(&name)
                    .max(live_by_class.get(&name).copied().unwrap_or(0));
                headroom.resource_classes.insert(name, limit.saturating_sub(used));
            }
        }

        let plan = self.scheduler.plan(&views, &pipeline.ctrl_rules, &headroom);
        let mut submitted = Vec::with_capacity(plan.len());
        for allocation in plan {
            if let Some(done) = self.submit(&pipeline, allocation).await? {
                submitted.push(done);
            }
        }

        let report = PassReport {
            pass: self.state.passes,
            dead_workers,
            submitted,
            live_workers: live.len(),
        };
        debug!(
            pass = report.pass,
            live = report.live_workers,
            submitted = report.workers_submitted(),
            buried = report.dead_workers.len(),
            "Pass complete"
        );
        Ok(report)
    }

    /// Submit one allocation and register the workers the meadow accepted.
    /// A meadow refusing is logged, never fatal.
    async fn submit(&self, pipeline: &Pipeline, allocation: Allocation) -> Result<Option<Allocation>> {
        let Some(meadow) = self.valley.meadow(&allocation.meadow) else {
            warn!(meadow = %allocation.meadow, analysis = %allocation.analysis_name, "No such meadow");
            return Ok(None);
        };
        let rc = pipeline.resource_class(&allocation.resource_class);
        let spec = RoleSpec::new(&pipeline.name, &rc.name)
            .for_analysis(allocation.analysis_id, &allocation.analysis_name)
            .with_description(rc.description_for(meadow.meadow_type().as_str()));

        let handles = match meadow.submit(allocation.workers as usize, &spec).await {
            Ok(handles) => handles,
            Err(e) => {
                warn!(meadow = %allocation.meadow, analysis = %allocation.analysis_name, error = %e, "Submission failed");
                return Ok(None);
            }
        };
        if handles.is_empty() {
            return Ok(None);
        }

        let store = self.graph.store();
        for handle in &handles {
            store.register_worker(&handle.meadow, &handle.process_id, Some(allocation.analysis_id), Some(&rc.name))?;
        }
        self.stats.record_workers(allocation.analysis_id, handles.len() as i64);
        info!(
            analysis = %allocation.analysis_name,
            meadow = %allocation.meadow,
            workers = handles.len(),
            "Submitted workers"
        );
        Ok(Some(Allocation {
            workers: handles.len() as u32,
            ..allocation
        }))
    }

    /// Per-analysis counts, as cached, and the pipeline state.
    pub fn pipeline_report(&self) -> Result<PipelineReport> {
        let stats = self.stats.get_all()?;
        let store = self.graph.store();
        let live = store.live_workers()?.len();
        let pipeline = self.pipeline().refreshed(store.as_ref())?;
        Ok(assess(&pipeline, &stats, live))
    }

    /// The pipeline report after a full recount.
    pub fn fresh_pipeline_report(&self) -> Result<PipelineReport> {
        self.stats.invalidate_all();
        self.pipeline_report()
    }

    /// Run passes until the pipeline is DONE or BLOCKED, or `max_passes` (or the
    /// configured limit) is used up.
    pub async fn run_until_done(&mut self, max_passes: Option<u64>) -> Result<PipelineReport> {
        let max_passes = max_passes.or(self.beekeeper.max_passes);
        info!(pipeline = %self.pipeline().name, ?max_passes, "Beekeeper started");

        loop {
            match self.run_pass().await {
                Ok(_) => {}
                Err(e) if e.aborts_pass() => {}
                Err(e) => return Err(e),
            }

            // A verdict other than RUNNING is only trusted after a recount
            let report = match self.pipeline_report() {
                Ok(report) if report.state != PipelineState::Running => self.fresh_pipeline_report(),
                other => other,
            };
            match report {
                Ok(report) if report.state != PipelineState::Running => {
                    info!(pipeline = %report.pipeline, state = %report.state, passes = self.state.passes, "Beekeeper finished");
                    return Ok(report);
                }
                Ok(report) if self.state.out_of_passes(max_passes) => {
                    info!(pipeline = %report.pipeline, passes = self.state.passes, "Beekeeper out of passes");
                    return Ok(report);
                }
                Ok(_) => {}
                Err(e) if e.aborts_pass() && !self.state.out_of_passes(max_passes) => {
                    warn!(error = %e, "Report unavailable, retrying next tick");
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(self.beekeeper.tick_interval).await;
        }
    }
}
