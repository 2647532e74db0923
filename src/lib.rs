//! Apiary - a job-scheduling engine for data pipelines
//!
//! A pipeline is a graph of analyses. Jobs flow between analyses along dataflow
//! rules; fan-out/fan-in is expressed with semaphored funnel jobs that become
//! claimable only when every job of their fan has completed. A Queen decides how
//! many workers each analysis gets and submits them to meadows; workers claim
//! batches of jobs from the shared store and run them.

pub mod domain;
pub mod error;
pub mod id;
pub mod jobs;
pub mod limiter;
pub mod meadow;
pub mod params;
pub mod pipeline;
pub mod queen;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod worker;

pub use error::{ApiaryError, Result};
