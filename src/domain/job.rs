//! Analysis jobs and their state machine.

use serde::{Deserialize, Serialize};

/// Store-allocated job identifier
pub type JobId = i64;

/// Job status state machine.
///
/// ```text
/// SEMAPHORED -> READY -> CLAIMED -> COMPILATION -> RUN -> DONE
///                 ^                                  |
///                 +------------- fail ---------------+-> FAILED | PASSED_ON
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Blocked until its semaphore count drops to zero
    Semaphored,
    /// Claimable
    Ready,
    /// Owned by a worker, not started yet
    Claimed,
    /// Parameters being assembled
    Compilation,
    /// Runnable executing
    Run,
    /// Finished successfully
    Done,
    /// Failed past the retry threshold
    Failed,
    /// Skipped; its input flowed down a failure branch instead
    PassedOn,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Semaphored,
        JobStatus::Ready,
        JobStatus::Claimed,
        JobStatus::Compilation,
        JobStatus::Run,
        JobStatus::Done,
        JobStatus::Failed,
        JobStatus::PassedOn,
    ];

    /// Statuses a worker holds a job in
    pub const IN_FLIGHT: [JobStatus; 3] = [JobStatus::Claimed, JobStatus::Compilation, JobStatus::Run];

    /// Get the string representation stored in the job table.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Semaphored => "SEMAPHORED",
            JobStatus::Ready => "READY",
            JobStatus::Claimed => "CLAIMED",
            JobStatus::Compilation => "COMPILATION",
            JobStatus::Run => "RUN",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
            JobStatus::PassedOn => "PASSED_ON",
        }
    }

    /// Parse the stored string representation.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// DONE, FAILED and PASSED_ON never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::PassedOn)
    }

    /// Held by a worker.
    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }

    /// Counts towards "incomplete" for control rules.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Done | Self::PassedOn)
    }

    /// Check whether the state machine allows moving from `self` to `next`.
    ///
    /// `FAILED -> READY` is not listed: a retried job goes straight from its in-flight
    /// state back to READY, and a FAILED job is terminal.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Semaphored, Ready) => true,
            (Ready, Semaphored) => true,
            (Ready, Claimed) => true,
            (Claimed, Compilation) => true,
            (Compilation, Run) => true,
            (Claimed | Compilation | Run, Done) => true,
            (Claimed | Compilation | Run, Ready) => true,
            (Claimed | Compilation | Run, Failed) => true,
            (Claimed | Compilation | Run, PassedOn) => true,
            (Semaphored, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of work belonging to an analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisJob {
    pub id: JobId,

    pub analysis_id: i64,

    /// Immutable input parameters
    pub input: serde_json::Value,

    pub status: JobStatus,

    /// Failures so far
    pub retry_count: u32,

    /// The funnel job this job releases when it completes
    pub semaphored_by: Option<JobId>,

    /// Number of still-incomplete jobs this job is a funnel for
    pub semaphore_count: u32,

    /// Job whose dataflow created this one
    pub prev_job: Option<JobId>,

    /// Worker currently holding the job
    pub worker_id: Option<i64>,

    /// Not claimable before this time (retry backoff)
    pub available_at: i64,

    /// Last failure message
    pub last_error: Option<String>,

    pub created_at: i64,

    pub updated_at: i64,
}

impl AnalysisJob {
    /// The input as a JSON object (non-object inputs yield an empty map).
    pub fn input_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.input.as_object().cloned().unwrap_or_default()
    }
}

/// A job to be inserted by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub analysis_id: i64,
    pub input: serde_json::Value,
    pub semaphored_by: Option<JobId>,
    pub prev_job: Option<JobId>,
}

impl NewJob {
    pub fn new(analysis_id: i64, input: serde_json::Value) -> Self {
        Self {
            analysis_id,
            input,
            semaphored_by: None,
            prev_job: None,
        }
    }

    pub fn semaphored_by(mut self, funnel: Option<JobId>) -> Self {
        self.semaphored_by = funnel;
        self
    }

    pub fn from_job(mut self, prev_job: JobId) -> Self {
        self.prev_job = Some(prev_job);
        self
    }
}

/// Job counts by status for one analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub semaphored: u64,
    pub ready: u64,
    pub claimed: u64,
    pub compilation: u64,
    pub run: u64,
    pub done: u64,
    pub failed: u64,
    pub passed_on: u64,
}

impl StatusCounts {
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Semaphored => self.semaphored,
            JobStatus::Ready => self.ready,
            JobStatus::Claimed => self.claimed,
            JobStatus::Compilation => self.compilation,
            JobStatus::Run => self.run,
            JobStatus::Done => self.done,
            JobStatus::Failed => self.failed,
            JobStatus::PassedOn => self.passed_on,
        }
    }

    pub fn get_mut(&mut self, status: JobStatus) -> &mut u64 {
        match status {
            JobStatus::Semaphored => &mut self.semaphored,
            JobStatus::Ready => &mut self.ready,
            JobStatus::Claimed => &mut self.claimed,
            JobStatus::Compilation => &mut self.compilation,
            JobStatus::Run => &mut self.run,
            JobStatus::Done => &mut self.done,
            JobStatus::Failed => &mut self.failed,
            JobStatus::PassedOn => &mut self.passed_on,
        }
    }

    pub fn total(&self) -> u64 {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }

    pub fn in_flight(&self) -> u64 {
        self.claimed + self.compilation + self.run
    }

    /// Jobs that are neither DONE nor PASSED_ON.
    pub fn incomplete(&self) -> u64 {
        self.total() - self.done - self.passed_on
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_roundtrip() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("BOGUS"), None);
    }

    #[test]
    fn test_status_serde_matches_as_str() {
        let json = serde_json::to_string(&JobStatus::PassedOn).unwrap();
        assert_eq!(json, "\"PASSED_ON\"");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::PassedOn.is_terminal());
        assert!(!JobStatus::Ready.is_terminal());
        assert!(!JobStatus::Semaphored.is_terminal());
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(JobStatus::Ready.can_transition_to(JobStatus::Claimed));
        assert!(JobStatus::Claimed.can_transition_to(JobStatus::Compilation));
        assert!(JobStatus::Compilation.can_transition_to(JobStatus::Run));
        assert!(JobStatus::Run.can_transition_to(JobStatus::Done));
        assert!(JobStatus::Run.can_transition_to(JobStatus::Ready));
        assert!(JobStatus::Semaphored.can_transition_to(JobStatus::Ready));
    }

    #[test]
    fn test_forbidden_transitions() {
        assert!(!JobStatus::Semaphored.can_transition_to(JobStatus::Claimed));
        assert!(!JobStatus::Done.can_transition_to(JobStatus::Ready));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Ready));
        assert!(!JobStatus::Ready.can_transition_to(JobStatus::Done));
    }

    #[test]
    fn test_status_counts_totals() {
        let counts = StatusCounts {
            semaphored: 1,
            ready: 2,
            claimed: 1,
            run: 1,
            done: 4,
            passed_on: 1,
            ..Default::default()
        };
        assert_eq!(counts.total(), 10);
        assert_eq!(counts.in_flight(), 2);
        assert_eq!(counts.incomplete(), 5);
    }
}
