//! What a pass did and where the pipeline stands.

use serde::Serialize;

use crate::domain::StatusCounts;
use crate::pipeline::Pipeline;
use crate::scheduler::Allocation;
use crate::stats::{AnalysisHint, AnalysisStats};

/// Outcome of one Queen pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassReport {
    pub pass: u64,
    /// Workers the liveness sweep found dead
    pub dead_workers: Vec<DeadWorker>,
    /// Allocations actually submitted, with the worker count the meadow accepted
    pub submitted: Vec<Allocation>,
    /// Live workers before submitting
    pub live_workers: usize,
}

impl PassReport {
    pub fn workers_submitted(&self) -> usize {
        self.submitted.iter().map(|a| a.workers as usize).sum()
    }

    pub fn jobs_reclaimed(&self) -> usize {
        self.dead_workers.iter().map(|d| d.reclaimed_jobs).sum()
    }
}

/// A worker buried by the liveness sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadWorker {
    pub worker_id: i64,
    pub meadow: String,
    pub process_id: String,
    pub cause: String,
    pub reclaimed_jobs: usize,
    /// Reclaims that went wrong; the worker was buried regardless
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PipelineState {
    Done,
    Running,
    Blocked,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Done => "DONE",
            PipelineState::Running => "RUNNING",
            PipelineState::Blocked => "BLOCKED",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub analysis_id: i64,
    pub name: String,
    pub hint: AnalysisHint,
    pub counts: StatusCounts,
    pub live_workers: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub pipeline: String,
    pub state: PipelineState,
    /// Why the pipeline is blocked; empty otherwise
    pub reasons: Vec<String>,
    pub analyses: Vec<AnalysisReport>,
    pub live_workers: usize,
}

impl PipelineReport {
    pub fn analysis(&self, name: &str) -> Option<&AnalysisReport> {
        self.analyses.iter().find(|a| a.name == name)
    }

    pub fn total(&self) -> StatusCounts {
        let mut total = StatusCounts::default();
        for a in &self.analyses {
            total.semaphored += a.counts.semaphored;
            total.ready += a.counts.ready;
            total.claimed += a.counts.claimed;
            total.compilation += a.counts.compilation;
            total.run += a.counts.run;
            total.done += a.counts.done;
            total.failed += a.counts.failed;
            total.passed_on += a.counts.passed_on;
        }
        total
    }
}

/// Judge the pipeline from fresh stats. `pipeline` should carry the analyses'
/// current capacities.
///
/// DONE when every analysis is empty or done. RUNNING while anything is in
/// flight, claimable by an analysis allowed workers, or a worker is alive.
/// BLOCKED otherwise, with reasons.
pub fn assess(pipeline: &Pipeline, stats: &[AnalysisStats], live_workers: usize) -> PipelineReport {
    let analyses: Vec<AnalysisReport> = stats
        .iter()
        .filter_map(|s| {
            let analysis = pipeline.analysis_by_id(s.analysis_id)?;
            Some(AnalysisReport {
                analysis_id: s.analysis_id,
                name: analysis.name.clone(),
                hint: s.hint,
                counts: s.counts,
                live_workers: s.live_workers,
            })
        })
        .collect();

    let done = analyses
        .iter()
        .all(|a| matches!(a.hint, AnalysisHint::Empty | AnalysisHint::Done));
    let active = live_workers > 0
        || analyses.iter().any(|a| {
            a.counts.in_flight() > 0 || (a.counts.ready > 0 && a.hint.is_schedulable() && !shut_off(pipeline, a))
        });

    let (state, reasons) = if done {
        (PipelineState::Done, Vec::new())
    } else if active {
        (PipelineState::Running, Vec::new())
    } else {
        (PipelineState::Blocked, blocked_reasons(pipeline, &analyses))
    };

    PipelineReport {
        pipeline: pipeline.name.clone(),
        state,
        reasons,
        analyses,
        live_workers,
    }
}

/// `hive_capacity: 0` means no worker may ever take the analysis' jobs.
fn shut_off(pipeline: &Pipeline, report: &AnalysisReport) -> bool {
    pipeline
        .analysis_by_id(report.analysis_id)
        .is_some_and(|a| a.hive_capacity == Some(0))
}

fn blocked_reasons(pipeline: &Pipeline, analyses: &[AnalysisReport]) -> Vec<String> {
    let incomplete = |name: &str| {
        analyses
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.counts.incomplete())
            .unwrap_or(0)
    };

    let mut reasons = Vec::new();
    for a in analyses {
        if a.hint == AnalysisHint::Failed {
            reasons.push(format!(
                "analysis '{}' exceeded its failure tolerance: {} of {} jobs failed",
                a.name,
                a.counts.failed,
                a.counts.total()
            ));
        } else if a.counts.failed > 0 {
            reasons.push(format!("analysis '{}' has {} permanently failed jobs", a.name, a.counts.failed));
        }
        if a.counts.semaphored > 0 {
            reasons.push(format!(
                "analysis '{}' has {} semaphored jobs with nothing left to release them",
                a.name, a.counts.semaphored
            ));
        }
        if a.counts.ready > 0 && shut_off(pipeline, a) {
            reasons.push(format!(
                "analysis '{}' has {} ready jobs but hive_capacity 0",
                a.name, a.counts.ready
            ));
        }
        if a.counts.ready > 0 {
            for rule in pipeline.ctrl_rules_for(&a.name) {
                let pending = incomplete(&rule.condition_analysis);
                if pending > 0 {
                    reasons.push(format!(
                        "analysis '{}' waits on '{}', which has {} incomplete jobs",
                        a.name, rule.condition_analysis, pending
                    ));
                }
            }
        }
    }
    reasons
}
