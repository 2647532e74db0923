//! Ranking of schedulable analyses.
//!
//! Which analysis gets a worker first when headroom is short:
//! - `FewestWorkersFirst` (default): analyses with the fewest live workers first,
//!   so newly-ready stages are not starved by busy ones
//! - `CreationOrder`: pipeline order, earliest analysis first
//!
//! Ties are always broken by creation order (analysis id).

use serde::{Deserialize, Serialize};

use crate::scheduler::select::AnalysisView;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PriorityPolicy {
    #[default]
    FewestWorkersFirst,
    CreationOrder,
}

impl PriorityPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityPolicy::FewestWorkersFirst => "fewest_workers_first",
            PriorityPolicy::CreationOrder => "creation_order",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fewest_workers_first" => Some(PriorityPolicy::FewestWorkersFirst),
            "creation_order" => Some(PriorityPolicy::CreationOrder),
            _ => None,
        }
    }

    /// Sort views into scheduling order.
    pub fn rank(&self, views: &mut [&AnalysisView]) {
        match self {
            PriorityPolicy::FewestWorkersFirst => {
                views.sort_by_key(|v| (v.live_workers, v.analysis_id));
            }
            PriorityPolicy::CreationOrder => {
                views.sort_by_key(|v| v.analysis_id);
            }
        }
    }
}

impl std::fmt::Display for PriorityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
