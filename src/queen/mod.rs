//! Queen - decides how many workers each analysis gets and keeps the hive honest.
//!
//! A pass sweeps for dead workers, syncs stats, plans allocations with the
//! [`Scheduler`](crate::scheduler::Scheduler), submits workers through the
//! [`Valley`](crate::meadow::Valley) and registers them in the store. The
//! beekeeper loop repeats passes until the pipeline is done or blocked.

mod beekeeper;
mod queen;
mod report;

pub use beekeeper::{BeekeeperConfig, BeekeeperState};
pub use queen::{Queen, QueenConfig};
pub use report::{AnalysisReport, DeadWorker, PassReport, PipelineReport, PipelineState, assess};
