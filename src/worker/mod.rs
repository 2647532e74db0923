//! Workers and the code they run.
//!
//! - [`runnable`]: the `Runnable` contract, `JobContext`, and the registry of modules
//! - [`builtin`]: runnables shipped with apiary
//! - `Worker`: specialization into a role, batch claiming, per-job execution

pub mod builtin;
pub mod runnable;
mod worker;

pub use runnable::{
    BranchEvent, JobContext, JobError, RunOutcome, RunResult, Runnable, RunnableRegistry, execute,
};
pub use worker::{Worker, WorkerConfig, WorkerContext, run_worker};
