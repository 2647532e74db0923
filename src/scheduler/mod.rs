//! Scheduler module for worker allocation.
//!
//! This module provides:
//! - **Priority policy**: Orders analyses competing for scarce headroom.
//! - **Scheduler**: Turns per-analysis views and shared headroom into a plan of
//!   how many workers to submit for which analysis on which meadow.
//!
//! # Architecture
//!
//! The Queen polls the hive once per pass:
//! 1. Stats are refreshed into [`AnalysisView`]s
//! 2. The scheduler computes an allocation plan
//! 3. The Queen submits the planned workers to their meadows

mod priority;
mod select;

pub use priority::PriorityPolicy;
pub use select::{Allocation, AnalysisView, Headroom, Scheduler, schedule};
