//! Worker records, roles and causes of death.

use serde::{Deserialize, Serialize};

/// Worker lifecycle.
///
/// `UNSPECIALIZED -> SPECIALIZED -> {BATCH_RUNNING <-> IDLE} -> DEAD`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Submitted to a meadow, not yet bound to an analysis
    Unspecialized,
    /// Bound to an analysis, about to claim
    Specialized,
    /// Running a batch of jobs
    BatchRunning,
    /// Between batches
    Idle,
    Dead,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Unspecialized => "UNSPECIALIZED",
            WorkerStatus::Specialized => "SPECIALIZED",
            WorkerStatus::BatchRunning => "BATCH_RUNNING",
            WorkerStatus::Idle => "IDLE",
            WorkerStatus::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            WorkerStatus::Unspecialized,
            WorkerStatus::Specialized,
            WorkerStatus::BatchRunning,
            WorkerStatus::Idle,
            WorkerStatus::Dead,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self, WorkerStatus::Dead)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CauseOfDeath {
    /// No analysis could take the worker
    NoRole,
    /// Its analysis ran out of claimable jobs
    NoWork,
    /// Reached its job limit
    JobLimit,
    /// Reached its life span
    Lifespan,
    /// Specialization refused: hive capacity or resource limit reached
    HiveOverload,
    /// A runnable failure marked the worker unusable
    Contaminated,
    /// A job exceeded its run limit
    RunLimit,
    /// A job exceeded its memory limit
    MemLimit,
    /// Killed through the meadow
    KilledByUser,
    /// Disappeared without registering a cause
    Unknown,
}

impl CauseOfDeath {
    pub fn as_str(&self) -> &'static str {
        match self {
            CauseOfDeath::NoRole => "NO_ROLE",
            CauseOfDeath::NoWork => "NO_WORK",
            CauseOfDeath::JobLimit => "JOB_LIMIT",
            CauseOfDeath::Lifespan => "LIFESPAN",
            CauseOfDeath::HiveOverload => "HIVE_OVERLOAD",
            CauseOfDeath::Contaminated => "CONTAMINATED",
            CauseOfDeath::RunLimit => "RUN_LIMIT",
            CauseOfDeath::MemLimit => "MEM_LIMIT",
            CauseOfDeath::KilledByUser => "KILLED_BY_USER",
            CauseOfDeath::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            CauseOfDeath::NoRole,
            CauseOfDeath::NoWork,
            CauseOfDeath::JobLimit,
            CauseOfDeath::Lifespan,
            CauseOfDeath::HiveOverload,
            CauseOfDeath::Contaminated,
            CauseOfDeath::RunLimit,
            CauseOfDeath::MemLimit,
            CauseOfDeath::KilledByUser,
            CauseOfDeath::Unknown,
        ]
        .into_iter()
        .find(|cause| cause.as_str() == s)
    }

    /// Abnormal deaths leave jobs behind that must be reclaimed.
    pub fn is_abnormal(&self) -> bool {
        matches!(
            self,
            CauseOfDeath::Contaminated
                | CauseOfDeath::RunLimit
                | CauseOfDeath::MemLimit
                | CauseOfDeath::KilledByUser
                | CauseOfDeath::Unknown
        )
    }
}

impl std::fmt::Display for CauseOfDeath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A live (or dead) execution process as recorded in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRecord {
    pub id: i64,
    pub meadow: String,
    /// Backend process handle
    pub process_id: String,
    pub status: WorkerStatus,
    /// Analysis of the current role (or the one it was submitted for)
    pub analysis_id: Option<i64>,
    pub resource_class: Option<String>,
    pub jobs_done: u32,
    pub cause_of_death: Option<CauseOfDeath>,
    pub born_at: i64,
    pub last_check_in: i64,
    pub died_at: Option<i64>,
}

/// A worker's binding to one analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Role {
    pub id: i64,
    pub worker_id: i64,
    pub analysis_id: i64,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub attempted_jobs: u32,
    pub done_jobs: u32,
}
