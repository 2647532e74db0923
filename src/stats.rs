//! Per-analysis job statistics with a sync-if-stale policy.
//!
//! Most passes read cached counts plus the in-memory deltas recorded since the
//! last sync. A full recount against the store happens when an entry is dirty,
//! older than `max_staleness`, or has drifted by more than `drift_tolerance`
//! transitions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{JobStatus, StatusCounts};
use crate::error::{ApiaryError, Result};
use crate::pipeline::Pipeline;
use crate::store::HiveStore;

/// Scheduling hint derived from an analysis' counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisHint {
    /// No jobs at all
    Empty,
    /// Held back by a control rule or waiting on funnels
    Blocked,
    /// Claimable jobs and no workers
    Ready,
    /// Claimable jobs with workers on them
    Working,
    /// Nothing claimable, jobs in flight
    AllClaimed,
    Done,
    /// Permanent failures beyond the analysis' tolerance
    Failed,
}

impl AnalysisHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisHint::Empty => "EMPTY",
            AnalysisHint::Blocked => "BLOCKED",
            AnalysisHint::Ready => "READY",
            AnalysisHint::Working => "WORKING",
            AnalysisHint::AllClaimed => "ALL_CLAIMED",
            AnalysisHint::Done => "DONE",
            AnalysisHint::Failed => "FAILED",
        }
    }

    /// Whether the scheduler may give this analysis workers.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, AnalysisHint::Ready | AnalysisHint::Working)
    }
}

impl std::fmt::Display for AnalysisHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of one analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisStats {
    pub analysis_id: i64,
    pub counts: StatusCounts,
    /// Live workers bound to the analysis at the last sync
    pub live_workers: u32,
    pub hint: AnalysisHint,
    /// Transitions recorded since the last sync
    pub drift: u64,
    /// Milliseconds since the last full recount
    pub age_ms: u64,
}

/// Derive the hint from counts.
pub fn derive_hint(counts: &StatusCounts, live_workers: u32, ctrl_blocked: bool, failure_exceeded: bool) -> AnalysisHint {
    let total = counts.total();
    if total == 0 {
        return AnalysisHint::Empty;
    }
    if failure_exceeded {
        return AnalysisHint::Failed;
    }
    let pending = counts.semaphored + counts.ready + counts.in_flight();
    if pending == 0 {
        return AnalysisHint::Done;
    }
    if ctrl_blocked {
        return AnalysisHint::Blocked;
    }
    if counts.ready > 0 {
        return if live_workers > 0 {
            AnalysisHint::Working
        } else {
            AnalysisHint::Ready
        };
    }
    if counts.in_flight() > 0 {
        return AnalysisHint::AllClaimed;
    }
    AnalysisHint::Blocked
}

#[derive(Debug, Clone)]
pub struct StatsConfig {
    pub max_staleness: Duration,
    pub drift_tolerance: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            max_staleness: Duration::from_millis(2000),
            drift_tolerance: 50,
        }
    }
}

impl StatsConfig {
    pub fn new(max_staleness: Duration, drift_tolerance: u64) -> Self {
        Self {
            max_staleness,
            drift_tolerance,
        }
    }
}

#[derive(Debug)]
struct Entry {
    base: StatusCounts,
    live_workers: u32,
    deltas: HashMap<JobStatus, i64>,
    drift: u64,
    dirty: bool,
    synced_at: Instant,
}

/// Cache of per-analysis stats, scoped to one Queen.
pub struct StatsCache {
    store: Arc<dyn HiveStore>,
    pipeline: Arc<Pipeline>,
    config: StatsConfig,
    entries: Mutex<HashMap<i64, Entry>>,
}

impl StatsCache {
    pub fn new(store: Arc<dyn HiveStore>, pipeline: Arc<Pipeline>, config: StatsConfig) -> Self {
        Self {
            store,
            pipeline,
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Stats for an analysis, recounting first if the entry is stale.
    pub fn get(&self, analysis_id: i64) -> Result<AnalysisStats> {
        let (counts, live_workers, drift, age_ms) = self.current(analysis_id)?;
        let analysis = self.pipeline.require_analysis_by_id(analysis_id)?;
        let ctrl_blocked = self.ctrl_blocked(&analysis.name)?;
        let failure_exceeded = analysis.failure_tolerance_exceeded(counts.failed, counts.total());
        Ok(AnalysisStats {
            analysis_id,
            counts,
            live_workers,
            hint: derive_hint(&counts, live_workers, ctrl_blocked, failure_exceeded),
            drift,
            age_ms,
        })
    }

    /// Stats for every analysis of the pipeline, in creation order.
    pub fn get_all(&self) -> Result<Vec<AnalysisStats>> {
        self.pipeline.analyses.iter().map(|a| self.get(a.id)).collect()
    }

    /// Whether a control rule holds `analysis` back.
    pub fn ctrl_blocked(&self, analysis: &str) -> Result<bool> {
        for rule in self.pipeline.ctrl_rules_for(analysis) {
            let condition = self.pipeline.require_analysis(&rule.condition_analysis)?;
            let (counts, ..) = self.current(condition.id)?;
            if counts.incomplete() > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Force a recount on the next `get`.
    pub fn touch(&self, analysis_id: i64) {
        if let Some(entry) = self.lock().get_mut(&analysis_id) {
            entry.dirty = true;
        }
    }

    /// Record a status change observed outside a sync.
    pub fn record_transition(&self, analysis_id: i64, from: Option<JobStatus>, to: JobStatus) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&analysis_id) else {
            return;
        };
        if let Some(from) = from {
            *entry.deltas.entry(from).or_insert(0) -= 1;
        }
        *entry.deltas.entry(to).or_insert(0) += 1;
        entry.drift += 1;
    }

    /// Record workers started (`delta > 0`) or buried (`delta < 0`) for an analysis.
    pub fn record_workers(&self, analysis_id: i64, delta: i64) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&analysis_id) else {
            return;
        };
        entry.live_workers = (entry.live_workers as i64 + delta).max(0) as u32;
        entry.drift += delta.unsigned_abs();
    }

    /// Recount an analysis from the store.
    pub fn sync(&self, analysis_id: i64) -> Result<StatusCounts> {
        let counts = self.store.count_jobs_by_status(analysis_id)?;
        let live_workers = self
            .store
            .live_workers()?
            .iter()
            .filter(|w| w.analysis_id == Some(analysis_id))
            .count() as u32;

        self.lock().insert(
            analysis_id,
            Entry {
                base: counts,
                live_workers,
                deltas: HashMap::new(),
                drift: 0,
                dirty: false,
                synced_at: Instant::now(),
            },
        );
        debug!(analysis_id, total = counts.total(), live_workers, "Synced analysis stats");
        Ok(counts)
    }

    /// Drop every cached entry.
    pub fn invalidate_all(&self) {
        self.lock().clear();
    }

    fn current(&self, analysis_id: i64) -> Result<(StatusCounts, u32, u64, u64)> {
        if self.needs_sync(analysis_id) {
            self.sync(analysis_id)?;
        }
        let entries = self.lock();
        let entry = entries
            .get(&analysis_id)
            .ok_or_else(|| ApiaryError::InvalidState(format!("no stats for analysis {analysis_id}")))?;

        let mut counts = entry.base;
        for (status, delta) in &entry.deltas {
            let slot = counts.get_mut(*status);
            let value = *slot as i64 + delta;
            if value < 0 {
                warn!(analysis_id, status = %status, value, "Stats drifted below zero, clamping");
            }
            *slot = value.max(0) as u64;
        }
        let age_ms = entry.synced_at.elapsed().as_millis() as u64;
        Ok((counts, entry.live_workers, entry.drift, age_ms))
    }

    fn needs_sync(&self, analysis_id: i64) -> bool {
        match self.lock().get(&analysis_id) {
            None => true,
            Some(entry) => {
                entry.dirty
                    || entry.synced_at.elapsed() > self.config.max_staleness
                    || entry.drift > self.config.drift_tolerance
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Analysis, AnalysisCtrlRule, NewJob};
    use crate::store::{JobBatch, JobRepository, SqliteStore};
    use serde_json::json;

    fn setup(config: StatsConfig) -> (Arc<SqliteStore>, Arc<Pipeline>, StatsCache) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let pipeline = Pipeline::new("stats")
            .with_analysis(Analysis::new(0, "a", "Dummy"))
            .with_analysis(Analysis::new(0, "b", "Dummy"))
            .with_ctrl_rule(AnalysisCtrlRule::new("a", "b"))
            .install(store.as_ref())
            .unwrap();
        let pipeline = Arc::new(pipeline);
        let cache = StatsCache::new(store.clone(), pipeline.clone(), config);
        (store, pipeline, cache)
    }

    fn add_job(store: &SqliteStore, analysis_id: i64) -> i64 {
        store.insert_batch(JobBatch::single(NewJob::new(analysis_id, json!({})))).unwrap().fan[0]
    }

    #[test]
    fn test_derive_hint() {
        let empty = StatusCounts::default();
        assert_eq!(derive_hint(&empty, 0, false, false), AnalysisHint::Empty);

        let ready = StatusCounts { ready: 2, ..Default::default() };
        assert_eq!(derive_hint(&ready, 0, false, false), AnalysisHint::Ready);
        assert_eq!(derive_hint(&ready, 1, false, false), AnalysisHint::Working);
        assert_eq!(derive_hint(&ready, 0, true, false), AnalysisHint::Blocked);

        let claimed = StatusCounts { run: 1, ..Default::default() };
        assert_eq!(derive_hint(&claimed, 1, false, false), AnalysisHint::AllClaimed);

        let waiting = StatusCounts { semaphored: 1, ..Default::default() };
        assert_eq!(derive_hint(&waiting, 0, false, false), AnalysisHint::Blocked);

        let done = StatusCounts { done: 3, passed_on: 1, ..Default::default() };
        assert_eq!(derive_hint(&done, 0, false, false), AnalysisHint::Done);
        assert_eq!(derive_hint(&done, 0, false, true), AnalysisHint::Failed);
    }

    #[test]
    fn test_cached_counts_until_touched() {
        let (store, pipeline, cache) = setup(StatsConfig::new(Duration::from_secs(60), 100));
        let a = pipeline.analysis("a").unwrap().id;
        add_job(&store, a);
        assert_eq!(cache.get(a).unwrap().counts.ready, 1);

        add_job(&store, a);
        assert_eq!(cache.get(a).unwrap().counts.ready, 1);

        cache.touch(a);
        assert_eq!(cache.get(a).unwrap().counts.ready, 2);
    }

    #[test]
    fn test_deltas_applied_between_syncs() {
        let (store, pipeline, cache) = setup(StatsConfig::new(Duration::from_secs(60), 100));
        let a = pipeline.analysis("a").unwrap().id;
        add_job(&store, a);
        cache.get(a).unwrap();

        cache.record_transition(a, Some(JobStatus::Ready), JobStatus::Claimed);
        let stats = cache.get(a).unwrap();
        assert_eq!(stats.counts.ready, 0);
        assert_eq!(stats.counts.claimed, 1);
        assert_eq!(stats.drift, 1);
    }

    #[test]
    fn test_drift_beyond_tolerance_forces_resync() {
        let (store, pipeline, cache) = setup(StatsConfig::new(Duration::from_secs(60), 1));
        let a = pipeline.analysis("a").unwrap().id;
        add_job(&store, a);
        cache.get(a).unwrap();

        cache.record_transition(a, None, JobStatus::Ready);
        cache.record_transition(a, None, JobStatus::Ready);
        let stats = cache.get(a).unwrap();
        assert_eq!(stats.counts.ready, 1);
        assert_eq!(stats.drift, 0);
    }

    #[test]
    fn test_staleness_forces_resync() {
        let (store, pipeline, cache) = setup(StatsConfig::new(Duration::from_millis(50), 100));
        let a = pipeline.analysis("a").unwrap().id;
        cache.get(a).unwrap();
        add_job(&store, a);
        assert_eq!(cache.get(a).unwrap().counts.ready, 0);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.get(a).unwrap().counts.ready, 1);
    }

    #[test]
    fn test_worker_deltas_drive_hint() {
        let (store, pipeline, cache) = setup(StatsConfig::new(Duration::from_secs(60), 100));
        let a = pipeline.analysis("a").unwrap().id;
        add_job(&store, a);
        assert_eq!(cache.get(a).unwrap().hint, AnalysisHint::Ready);

        cache.record_workers(a, 2);
        let stats = cache.get(a).unwrap();
        assert_eq!(stats.live_workers, 2);
        assert_eq!(stats.hint, AnalysisHint::Working);

        cache.record_workers(a, -3);
        assert_eq!(cache.get(a).unwrap().live_workers, 0);
    }

    #[test]
    fn test_negative_counts_clamped() {
        let (_store, pipeline, cache) = setup(StatsConfig::new(Duration::from_secs(60), 100));
        let a = pipeline.analysis("a").unwrap().id;
        cache.get(a).unwrap();
        cache.record_transition(a, Some(JobStatus::Ready), JobStatus::Claimed);
        let stats = cache.get(a).unwrap();
        assert_eq!(stats.counts.ready, 0);
        assert_eq!(stats.counts.claimed, 1);
    }

    #[test]
    fn test_ctrl_rule_blocks_until_condition_complete() {
        let (store, pipeline, cache) = setup(StatsConfig::new(Duration::ZERO, 100));
        let a = pipeline.analysis("a").unwrap().id;
        let b = pipeline.analysis("b").unwrap().id;
        let job_a = add_job(&store, a);
        add_job(&store, b);
        assert_eq!(cache.get(b).unwrap().hint, AnalysisHint::Blocked);

        store.claim_job(job_a, 1, crate::id::now_ms()).unwrap();
        store.finish_job(job_a, JobStatus::Done).unwrap();
        assert_eq!(cache.get(b).unwrap().hint, AnalysisHint::Ready);
        assert_eq!(cache.get(a).unwrap().hint, AnalysisHint::Done);
    }

    #[test]
    fn test_invalidate_all() {
        let (store, pipeline, cache) = setup(StatsConfig::new(Duration::from_secs(60), 100));
        let a = pipeline.analysis("a").unwrap().id;
        cache.get(a).unwrap();
        add_job(&store, a);
        cache.invalidate_all();
        assert_eq!(cache.get(a).unwrap().counts.ready, 1);
        assert_eq!(cache.get_all().unwrap().len(), 2);
    }
}
