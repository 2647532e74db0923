//! Static dataflow and control rules.

use serde::{Deserialize, Serialize};

/// Default branch a successful job autoflows on
pub const BRANCH_MAIN: i32 = 1;
/// Taken by a permanently failing job instead of being marked FAILED
pub const BRANCH_ANY_FAILURE: i32 = -1;
/// Taken by a job whose worker hit its memory limit
pub const BRANCH_MEMLIMIT: i32 = -2;
/// Taken by a job whose worker hit its run limit
pub const BRANCH_RUNLIMIT: i32 = -3;

/// How an accumulator stores values in the funnel job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AccuKind {
    /// Last value wins
    Scalar,
    /// Values appended in arrival order
    List,
    /// Values keyed by one of the emitting job's parameters
    Map { key_param: String },
}

/// Where a dataflow event goes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DataflowTarget {
    /// Create a job in the named analysis
    Analysis {
        name: String,
        /// Input template substituted against the emitter's params overlaid with the payload.
        #[serde(default)]
        template: Option<serde_json::Value>,
    },
    /// Store `payload[name]` into the emitter's funnel job
    Accumulator { name: String, accu: AccuKind },
}

impl DataflowTarget {
    pub fn analysis(name: impl Into<String>) -> Self {
        DataflowTarget::Analysis {
            name: name.into(),
            template: None,
        }
    }

    pub fn templated(name: impl Into<String>, template: serde_json::Value) -> Self {
        DataflowTarget::Analysis {
            name: name.into(),
            template: Some(template),
        }
    }

    pub fn accumulator(name: impl Into<String>, accu: AccuKind) -> Self {
        DataflowTarget::Accumulator {
            name: name.into(),
            accu,
        }
    }
}

/// The funnel half of a fan-out/fan-in rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunnelSpec {
    /// Analysis of the funnel job
    pub analysis: String,
    /// Template for the funnel's input; the emitter's input is used when absent
    #[serde(default)]
    pub template: Option<serde_json::Value>,
}

/// Static edge from a source analysis' numbered branch to a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataflowRule {
    pub from_analysis: String,
    #[serde(default = "default_branch")]
    pub branch: i32,
    pub target: DataflowTarget,
    /// When present, every job flowed along this rule semaphores one funnel job.
    #[serde(default)]
    pub funnel: Option<FunnelSpec>,
}

fn default_branch() -> i32 {
    BRANCH_MAIN
}

impl DataflowRule {
    pub fn new(from_analysis: impl Into<String>, branch: i32, target: DataflowTarget) -> Self {
        Self {
            from_analysis: from_analysis.into(),
            branch,
            target,
            funnel: None,
        }
    }

    pub fn with_funnel(mut self, analysis: impl Into<String>, template: Option<serde_json::Value>) -> Self {
        self.funnel = Some(FunnelSpec {
            analysis: analysis.into(),
            template,
        });
        self
    }

    pub fn matches(&self, analysis: &str, branch: i32) -> bool {
        self.from_analysis == analysis && self.branch == branch
    }
}

/// "`ctrled_analysis` must not be scheduled while `condition_analysis` has incomplete jobs".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisCtrlRule {
    pub condition_analysis: String,
    pub ctrled_analysis: String,
}

impl AnalysisCtrlRule {
    pub fn new(condition_analysis: impl Into<String>, ctrled_analysis: impl Into<String>) -> Self {
        Self {
            condition_analysis: condition_analysis.into(),
            ctrled_analysis: ctrled_analysis.into(),
        }
    }
}
