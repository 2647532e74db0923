//! Allocation of workers to analyses.
//!
//! Each pass the scheduler decides how many workers every analysis should get,
//! based on:
//! - Claimable jobs and batch size
//! - Capacities (`hive_capacity` on workers, `analysis_capacity` on in-flight jobs)
//! - Control rules (an analysis waits while its condition analyses are incomplete)
//! - Resource-class, meadow and global headroom
//!
//! The computation is pure: everything it needs is passed in, and an empty plan
//! is the normal idle answer.

use std::collections::HashMap;

use serde::Serialize;

use crate::domain::{AnalysisCtrlRule, DEFAULT_RESOURCE_CLASS};
use crate::scheduler::priority::PriorityPolicy;

/// What the scheduler knows about one analysis this pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisView {
    pub analysis_id: i64,
    pub name: String,
    pub ready_jobs: u64,
    pub in_flight_jobs: u64,
    /// Jobs neither DONE nor PASSED_ON (for control rules)
    pub incomplete_jobs: u64,
    pub live_workers: u32,
    pub hive_capacity: Option<u32>,
    pub analysis_capacity: Option<u32>,
    pub batch_size: u32,
    pub resource_class: String,
    pub meadow: String,
}

impl AnalysisView {
    pub fn new(analysis_id: i64, name: impl Into<String>) -> Self {
        Self {
            analysis_id,
            name: name.into(),
            ready_jobs: 0,
            in_flight_jobs: 0,
            incomplete_jobs: 0,
            live_workers: 0,
            hive_capacity: None,
            analysis_capacity: None,
            batch_size: 1,
            resource_class: DEFAULT_RESOURCE_CLASS.to_string(),
            meadow: String::new(),
        }
    }

    /// Workers this analysis could use ignoring shared headroom.
    pub fn desired_workers(&self) -> u32 {
        let batch = self.batch_size.max(1) as u64;
        let mut desired = self.ready_jobs.div_ceil(batch);
        if let Some(cap) = self.hive_capacity {
            desired = desired.min(cap.saturating_sub(self.live_workers) as u64);
        }
        if let Some(cap) = self.analysis_capacity {
            let job_headroom = (cap as u64).saturating_sub(self.in_flight_jobs);
            desired = desired.min(job_headroom.div_ceil(batch));
        }
        desired.min(u32::MAX as u64) as u32
    }
}

/// Headroom shared between analyses this pass.
#[derive(Debug, Clone, Default)]
pub struct Headroom {
    /// Workers the whole hive may still start
    pub global: usize,
    /// Per meadow name; a meadow missing here has no room
    pub meadows: HashMap<String, usize>,
    /// Per resource class; a class missing here is unlimited
    pub resource_classes: HashMap<String, usize>,
}

/// Workers to submit for one analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub analysis_id: i64,
    pub analysis_name: String,
    pub meadow: String,
    pub resource_class: String,
    pub workers: u32,
}

/// Compute the allocation plan for one pass.
pub fn schedule(
    views: &[AnalysisView],
    ctrl_rules: &[AnalysisCtrlRule],
    headroom: &Headroom,
    policy: PriorityPolicy,
) -> Vec<Allocation> {
    let incomplete: HashMap<&str, u64> = views.iter().map(|v| (v.name.as_str(), v.incomplete_jobs)).collect();
    let blocked = |view: &AnalysisView| {
        ctrl_rules
            .iter()
            .filter(|rule| rule.ctrled_analysis == view.name)
            .any(|rule| incomplete.get(rule.condition_analysis.as_str()).copied().unwrap_or(0) > 0)
    };

    let mut candidates: Vec<&AnalysisView> = views
        .iter()
        .filter(|v| v.ready_jobs > 0)
        .filter(|v| {
            let is_blocked = blocked(v);
            if is_blocked {
                tracing::debug!(analysis = %v.name, "Blocked by control rule");
            }
            !is_blocked
        })
        .filter(|v| v.desired_workers() > 0)
        .collect();
    policy.rank(&mut candidates);

    let mut remaining: Vec<u32> = candidates.iter().map(|v| v.desired_workers()).collect();
    let mut granted: Vec<u32> = vec![0; candidates.len()];
    let mut global = headroom.global;
    let mut meadows = headroom.meadows.clone();
    let mut classes = headroom.resource_classes.clone();

    // One worker at a time, round-robin over the ranking.
    loop {
        let mut progressed = false;
        for (i, view) in candidates.iter().enumerate() {
            if global == 0 {
                break;
            }
            if remaining[i] == 0 {
                continue;
            }
            let meadow_left = meadows.get(&view.meadow).copied().unwrap_or(0);
            if meadow_left == 0 {
                continue;
            }
            if let Some(class_left) = classes.get(&view.resource_class)
                && *class_left == 0
            {
                continue;
            }

            remaining[i] -= 1;
            granted[i] += 1;
            global -= 1;
            meadows.insert(view.meadow.clone(), meadow_left - 1);
            if let Some(class_left) = classes.get_mut(&view.resource_class) {
                *class_left -= 1;
            }
            progressed = true;
        }
        if !progressed || global == 0 {
            break;
        }
    }

    candidates
        .iter()
        .zip(granted)
        .filter(|(_, workers)| *workers > 0)
        .map(|(view, workers)| Allocation {
            analysis_id: view.analysis_id,
            analysis_name: view.name.clone(),
            meadow: view.meadow.clone(),
            resource_class: view.resource_class.clone(),
            workers,
        })
        .collect()
}

/// Scheduler configuration, carried by the Queen.
#[derive(Debug, Clone)]
pub struct Scheduler {
    /// Maximum live workers across the hive
    max_workers: usize,
    policy: PriorityPolicy,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            max_workers: 50,
            policy: PriorityPolicy::default(),
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_priority(mut self, policy: PriorityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn policy(&self) -> PriorityPolicy {
        self.policy
    }

    /// Global headroom given the number of live workers.
    pub fn global_headroom(&self, live_workers: usize) -> usize {
        self.max_workers.saturating_sub(live_workers)
    }

    /// Plan a pass with this scheduler's policy.
    pub fn plan(&self, views: &[AnalysisView], ctrl_rules: &[AnalysisCtrlRule], headroom: &Headroom) -> Vec<Allocation> {
        let plan = schedule(views, ctrl_rules, headroom, self.policy);
        if plan.is_empty() {
            tracing::debug!("Nothing to schedule");
        }
        plan
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
