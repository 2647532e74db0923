//! CLI command definitions using clap.
//!
//! - run: install a pipeline, seed it and run the beekeeper until done
//! - status: report on one hive, or every hive found locally
//! - seed: add a job to an installed pipeline
//! - worker: run a single worker against an installed pipeline

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Apiary - a job-scheduling engine for data pipelines
#[derive(Parser, Debug)]
#[command(name = "apiary")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Hive database, overriding the configured or per-pipeline default
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install a pipeline and run it until done or blocked
    Run {
        /// Pipeline definition (YAML)
        pipeline: PathBuf,

        /// Do not create the pipeline's seed jobs
        #[arg(long)]
        no_seed: bool,

        /// Stop after this many Queen passes
        #[arg(long)]
        max_passes: Option<u64>,
    },

    /// Show the state of a pipeline
    Status {
        /// Pipeline name; every local hive when omitted
        #[arg(short, long)]
        pipeline: Option<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a job for an analysis of an installed pipeline
    Seed {
        /// Pipeline name
        #[arg(short, long)]
        pipeline: String,

        /// Analysis to seed
        analysis: String,

        /// Job input as a JSON object
        #[arg(short, long, default_value = "{}")]
        input: String,
    },

    /// Run one worker until it dies
    Worker {
        /// Pipeline name
        #[arg(short, long)]
        pipeline: String,

        /// Analysis to specialize into; any analysis with work when omitted
        #[arg(short, long)]
        analysis: Option<String>,

        /// Meadow the worker was submitted to
        #[arg(short, long)]
        meadow: Option<String>,

        /// Process id within the meadow; read from the environment when omitted
        #[arg(long)]
        process_id: Option<String>,
    },
}
