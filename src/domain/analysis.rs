//! Analyses (pipeline stages) and resource classes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Resource class used when an analysis doesn't name one.
pub const DEFAULT_RESOURCE_CLASS: &str = "default";

/// A pipeline stage.
///
/// Read-mostly at run time; only the capacities may be edited while the
/// pipeline runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Analysis {
    /// Store id; also the creation order used to break scheduling ties
    pub id: i64,

    /// Unique name ("logic_name")
    pub name: String,

    /// Runnable identifier looked up in the runnable registry
    pub module: String,

    /// Analysis-wide parameters (JSON object)
    pub parameters: serde_json::Value,

    /// Max concurrent workers, None = unlimited
    pub hive_capacity: Option<u32>,

    /// Max concurrent in-flight jobs, None = unlimited
    pub analysis_capacity: Option<u32>,

    pub resource_class: String,

    /// Jobs claimed per batch (>= 1)
    pub batch_size: u32,

    /// Failures before a job is marked permanently FAILED
    pub max_retry_count: u32,

    /// Backoff before a retried job becomes claimable again
    pub retry_delay_ms: u64,

    /// Percentage of permanently failed jobs tolerated before the analysis
    /// counts as failed
    pub failed_job_tolerance: u32,

    /// Propagate a permanent failure to the funnel this job semaphores
    pub fail_funnel_on_failure: bool,

    /// Meadow to submit workers to (None = the valley's default)
    pub meadow: Option<String>,

    /// Per-job run limit
    pub job_timeout_ms: Option<u64>,
}

impl Default for Analysis {
    fn default() -> Self {
        Self::new(0, "", "Dummy")
    }
}

impl Analysis {
    pub fn new(id: i64, name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            module: module.into(),
            parameters: serde_json::Value::Object(Default::default()),
            hive_capacity: None,
            analysis_capacity: None,
            resource_class: DEFAULT_RESOURCE_CLASS.to_string(),
            batch_size: 1,
            max_retry_count: 3,
            retry_delay_ms: 0,
            failed_job_tolerance: 0,
            fail_funnel_on_failure: false,
            meadow: None,
            job_timeout_ms: None,
        }
    }

    pub fn with_hive_capacity(mut self, capacity: u32) -> Self {
        self.hive_capacity = Some(capacity);
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_retry_count(mut self, max_retry_count: u32) -> Self {
        self.max_retry_count = max_retry_count;
        self
    }

    pub fn with_resource_class(mut self, resource_class: impl Into<String>) -> Self {
        self.resource_class = resource_class.into();
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Batch size, never zero.
    pub fn effective_batch_size(&self) -> u32 {
        self.batch_size.max(1)
    }

    /// Workers this analysis may still take given `live` workers, None = unlimited.
    pub fn worker_headroom(&self, live: u32) -> Option<u32> {
        self.hive_capacity.map(|cap| cap.saturating_sub(live))
    }

    /// Whether `failed` permanently failed jobs out of `total` exceed the tolerance.
    pub fn failure_tolerance_exceeded(&self, failed: u64, total: u64) -> bool {
        if failed == 0 || total == 0 {
            return false;
        }
        failed * 100 > total * self.failed_job_tolerance as u64
    }
}

/// Per-meadow-type resource requirements.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceDescription {
    /// Extra arguments for the backend's submit command (e.g. `--mem=4G`)
    pub submission_args: String,
    /// Extra arguments passed to the worker process
    pub worker_args: String,
}

/// A named resource requirement profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceClass {
    pub name: String,
    /// Max concurrent workers holding this class, None = unlimited
    pub limit: Option<usize>,
    /// Keyed by meadow type ("LOCAL", "CLUSTER")
    pub descriptions: HashMap<String, ResourceDescription>,
}

impl ResourceClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limit: None,
            descriptions: HashMap::new(),
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_description(mut self, meadow_type: &str, description: ResourceDescription) -> Self {
        self.descriptions.insert(meadow_type.to_string(), description);
        self
    }

    /// Resolve the description for a meadow type; unknown types get an empty description.
    pub fn description_for(&self, meadow_type: &str) -> ResourceDescription {
        self.descriptions.get(meadow_type).cloned().unwrap_or_default()
    }
}
