//! Execution backends ("meadows") and their registry.
//!
//! A meadow launches workers and reports which of them are still alive. The
//! scheduling logic only ever talks to the [`Meadow`] trait, so the same Queen
//! can drive local tokio tasks and a cluster queue side by side.

mod cluster;
mod local;
mod valley;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{CauseOfDeath, ResourceDescription};
use crate::error::Result;

pub use cluster::{ClusterClient, ClusterCommands, ClusterMeadow, CommandClusterClient};
pub use local::{LocalMeadow, WorkerLauncher};
pub use valley::Valley;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum MeadowType {
    Local,
    Cluster,
}

impl MeadowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeadowType::Local => "LOCAL",
            MeadowType::Cluster => "CLUSTER",
        }
    }
}

impl std::fmt::Display for MeadowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A backend's view of one of its processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Gone, with the cause when the backend knows it
    Dead(Option<CauseOfDeath>),
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        matches!(self, Liveness::Alive)
    }
}

/// What a submitted worker should become.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleSpec {
    pub pipeline: String,
    /// Analysis to specialize into; `None` lets the worker pick
    pub analysis_id: Option<i64>,
    pub analysis_name: Option<String>,
    pub resource_class: String,
    /// Resolved for the target meadow's type
    pub description: ResourceDescription,
}

impl RoleSpec {
    pub fn new(pipeline: impl Into<String>, resource_class: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            analysis_id: None,
            analysis_name: None,
            resource_class: resource_class.into(),
            description: ResourceDescription::default(),
        }
    }

    pub fn for_analysis(mut self, analysis_id: i64, analysis_name: impl Into<String>) -> Self {
        self.analysis_id = Some(analysis_id);
        self.analysis_name = Some(analysis_name.into());
        self
    }

    pub fn with_description(mut self, description: ResourceDescription) -> Self {
        self.description = description;
        self
    }
}

/// A submitted worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub meadow: String,
    pub process_id: String,
}

impl WorkerHandle {
    pub fn new(meadow: impl Into<String>, process_id: impl Into<String>) -> Self {
        Self {
            meadow: meadow.into(),
            process_id: process_id.into(),
        }
    }
}

/// Contract every execution backend implements.
#[async_trait]
pub trait Meadow: Send + Sync {
    fn name(&self) -> &str;

    fn meadow_type(&self) -> MeadowType;

    /// Most workers this meadow runs at once
    fn max_workers(&self) -> usize;

    /// Launch up to `n` workers. May return fewer when the backend is full.
    async fn submit(&self, n: usize, spec: &RoleSpec) -> Result<Vec<WorkerHandle>>;

    /// Liveness of every process this meadow knows about, keyed by process id.
    async fn status_of_all_workers(&self) -> Result<HashMap<String, Liveness>>;

    /// Fire-and-forget; the liveness sweep notices the death.
    async fn kill(&self, handle: &WorkerHandle) -> Result<()>;

    /// Drop what the meadow remembers about finished processes once their
    /// deaths have been recorded.
    async fn forget(&self, _process_ids: &[String]) -> Result<()> {
        Ok(())
    }

    /// Workers currently alive.
    async fn count_running(&self) -> Result<usize> {
        Ok(self.status_of_all_workers().await?.values().filter(|l| l.is_alive()).count())
    }
}
