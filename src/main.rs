use apiary::domain::DEFAULT_RESOURCE_CLASS;
use apiary::id::generate_process_id;
use apiary::jobs::JobGraph;
use apiary::limiter::Limiter;
use apiary::meadow::{ClusterMeadow, CommandClusterClient, LocalMeadow, Meadow, RoleSpec, Valley, WorkerHandle};
use apiary::pipeline::Pipeline;
use apiary::queen::{PipelineReport, PipelineState, Queen, assess};
use apiary::stats::{StatsCache, StatsConfig};
use apiary::store::{JobRepository, SqliteStore, WorkerRepository, default_store_path};
use apiary::worker::{RunnableRegistry, WorkerContext, run_worker};
use chrono::{DateTime, Local};
use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod cli;
mod config;

use cli::Cli;
use cli::commands::Commands;
use config::Config;

fn setup_logging(log_level: Option<&str>) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("apiary")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("apiary.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let env = env_logger::Env::default().default_filter_or(log_level.unwrap_or("info"));
    env_logger::Builder::from_env(env)
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Run {
            pipeline,
            no_seed,
            max_passes,
        } => handle_run_command(cli, config, pipeline, *no_seed, *max_passes).await,
        Commands::Status { pipeline, json } => handle_status_command(cli, config, pipeline.as_deref(), *json),
        Commands::Seed {
            pipeline,
            analysis,
            input,
        } => handle_seed_command(cli, config, pipeline, analysis, input),
        Commands::Worker {
            pipeline,
            analysis,
            meadow,
            process_id,
        } => {
            handle_worker_command(cli, config, pipeline, analysis.as_deref(), meadow.as_deref(), process_id.as_deref())
                .await
        }
    }
}

/// Explicit `--db`, then the configured path, then the per-pipeline default.
fn store_path(cli: &Cli, config: &Config, pipeline_name: &str) -> Result<PathBuf> {
    if let Some(path) = cli.db.as_ref().or(config.store.path.as_ref()) {
        return Ok(path.clone());
    }
    Ok(default_store_path(pipeline_name)?)
}

fn open_existing_hive(path: &Path) -> Result<Arc<SqliteStore>> {
    if !path.exists() {
        return Err(eyre!("No hive at {}", path.display()));
    }
    let store = SqliteStore::open_at(path).context(format!("Failed to open hive {}", path.display()))?;
    Ok(Arc::new(store))
}

fn build_valley(config: &Config, ctx: &WorkerContext) -> Result<Valley> {
    let local: Arc<dyn Meadow> = match config.meadows.local.max_workers {
        Some(max) => Arc::new(LocalMeadow::with_max_workers("local", ctx.launcher(), max)),
        None => Arc::new(LocalMeadow::new("local", ctx.launcher())),
    };
    let mut meadows = vec![local];
    if let Some(cluster) = &config.meadows.cluster {
        let client = Arc::new(CommandClusterClient::new(cluster.commands.clone()));
        meadows.push(Arc::new(ClusterMeadow::new(&cluster.name, client, cluster.queue_limit)));
    }

    let default_index = meadows
        .iter()
        .position(|m| m.name() == config.meadows.default)
        .ok_or_else(|| eyre!("Default meadow '{}' is not configured", config.meadows.default))?;
    let default = meadows.remove(default_index);
    Ok(meadows.into_iter().fold(Valley::new(default), Valley::with_meadow))
}

async fn handle_run_command(
    cli: &Cli,
    config: &Config,
    pipeline_path: &Path,
    no_seed: bool,
    max_passes: Option<u64>,
) -> Result<()> {
    info!("Running pipeline from: {}", pipeline_path.display());
    let pipeline = Pipeline::load(pipeline_path).context(format!("Failed to load {}", pipeline_path.display()))?;

    let registry = Arc::new(RunnableRegistry::with_builtins());
    if let Some(unknown) = pipeline.analyses.iter().find(|a| !registry.contains(&a.module)) {
        return Err(eyre!(
            "Analysis '{}' uses unknown module '{}' (known: {})",
            unknown.name,
            unknown.module,
            registry.modules().join(", ")
        ));
    }

    let path = store_path(cli, config, &pipeline.name)?;
    let store = Arc::new(SqliteStore::open_at(&path).context(format!("Failed to open hive {}", path.display()))?);
    let fresh = store.list_jobs(None, None)?.is_empty();
    let pipeline = Arc::new(pipeline.install(store.as_ref())?);
    println!("{} {} ({})", "Hive:".green(), pipeline.name, path.display());

    let graph = JobGraph::new(store, Arc::clone(&pipeline));
    let limiter = Limiter::new();
    let ctx = WorkerContext::new(graph.clone(), registry, limiter.clone(), config.worker_config());
    let valley = build_valley(config, &ctx)?;
    let mut queen = Queen::new(graph, valley, limiter, config.queen_config()?);

    if !fresh {
        println!("{}", "Resuming existing hive, seed jobs not recreated".yellow());
    } else if !no_seed {
        let seeded = queen.seed_pipeline()?;
        println!("{} {} job(s)", "Seeded:".green(), seeded.len());
    }

    let finished = tokio::select! {
        report = queen.run_until_done(max_passes) => Some(report),
        _ = tokio::signal::ctrl_c() => None,
    };
    let report = match finished {
        Some(report) => report?,
        None => {
            println!("{}", "Interrupted".yellow());
            queen.fresh_pipeline_report()?
        }
    };

    let state = queen.state();
    info!(
        "Beekeeper stopped after {} passes: {} workers submitted, {} buried",
        state.passes, state.workers_submitted, state.workers_buried
    );
    print_report(&report, None);
    match report.state {
        PipelineState::Blocked => Err(eyre!("Pipeline '{}' is blocked", report.pipeline)),
        _ => Ok(()),
    }
}

fn handle_status_command(cli: &Cli, config: &Config, pipeline: Option<&str>, json: bool) -> Result<()> {
    let paths = match (cli.db.as_ref().or(config.store.path.as_ref()), pipeline) {
        (Some(path), _) => vec![path.clone()],
        (None, Some(name)) => vec![default_store_path(name)?],
        (None, None) => find_hives()?,
    };
    if paths.is_empty() {
        println!("{}", "No hives found".yellow());
        return Ok(());
    }

    for path in paths {
        let store = open_existing_hive(&path)?;
        let pipeline = Arc::new(Pipeline::from_store(store.as_ref())?);
        let stats = StatsCache::new(store.clone(), Arc::clone(&pipeline), StatsConfig::default());
        let report = assess(&pipeline, &stats.get_all()?, store.live_workers()?.len());
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            let modified = fs::metadata(&path).and_then(|m| m.modified()).ok().map(DateTime::<Local>::from);
            print_report(&report, modified);
        }
    }
    Ok(())
}

/// Every hive database under the local data directory.
fn find_hives() -> Result<Vec<PathBuf>> {
    let base = dirs::data_local_dir().ok_or_else(|| eyre!("Cannot determine local data directory"))?;
    let pattern = base.join("apiary").join("*").join("hive.db");
    let mut paths: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .context("Invalid hive search pattern")?
        .filter_map(|entry| entry.ok())
        .collect();
    paths.sort();
    Ok(paths)
}

fn handle_seed_command(cli: &Cli, config: &Config, pipeline: &str, analysis: &str, input: &str) -> Result<()> {
    let input: serde_json::Value = serde_json::from_str(input).context("Job input is not valid JSON")?;
    if !input.is_object() {
        return Err(eyre!("Job input must be a JSON object"));
    }

    let store = open_existing_hive(&store_path(cli, config, pipeline)?)?;
    let pipeline = Arc::new(Pipeline::from_store(store.as_ref())?);
    let analysis_id = pipeline.require_analysis(analysis)?.id;
    let job_id = JobGraph::new(store, pipeline).create(analysis_id, input, None)?;

    info!("Seeded job {} for analysis {}", job_id, analysis);
    println!("{} job {} for {}", "Seeded:".green(), job_id, analysis);
    Ok(())
}

async fn handle_worker_command(
    cli: &Cli,
    config: &Config,
    pipeline: &str,
    analysis: Option<&str>,
    meadow: Option<&str>,
    process_id: Option<&str>,
) -> Result<()> {
    let store = open_existing_hive(&store_path(cli, config, pipeline)?)?;
    let pipeline = Arc::new(Pipeline::from_store(store.as_ref())?);

    let limiter = Limiter::with_limits(pipeline.resource_classes.iter().map(|rc| (rc.name.clone(), rc.limit)));
    let registry = Arc::new(RunnableRegistry::with_builtins());
    let ctx = WorkerContext::new(
        JobGraph::new(store, Arc::clone(&pipeline)),
        registry,
        limiter,
        config.worker_config(),
    );

    let meadow = meadow
        .map(String::from)
        .or_else(|| config.meadows.cluster.as_ref().map(|c| c.name.clone()))
        .unwrap_or_else(|| config.meadows.default.clone());
    let process_id = process_id
        .map(String::from)
        .or_else(|| std::env::var("APIARY_PROCESS_ID").ok())
        .or_else(|| std::env::var("SLURM_JOB_ID").ok())
        .unwrap_or_else(|| generate_process_id(&meadow));

    let spec = match analysis {
        Some(name) => {
            let analysis = pipeline.require_analysis(name)?;
            RoleSpec::new(&pipeline.name, &analysis.resource_class).for_analysis(analysis.id, &analysis.name)
        }
        None => RoleSpec::new(&pipeline.name, DEFAULT_RESOURCE_CLASS),
    };

    info!("Starting worker {} on meadow {}", process_id, meadow);
    let cause = run_worker(ctx, WorkerHandle::new(&meadow, &process_id), spec).await;
    if cause.is_abnormal() {
        println!("{} {} ({})", "Worker died:".red(), process_id, cause);
    } else {
        println!("{} {} ({})", "Worker finished:".green(), process_id, cause);
    }
    Ok(())
}

fn print_report(report: &PipelineReport, modified: Option<DateTime<Local>>) {
    let state = match report.state {
        PipelineState::Done => report.state.to_string().green(),
        PipelineState::Running => report.state.to_string().yellow(),
        PipelineState::Blocked => report.state.to_string().red(),
    };
    match modified {
        Some(time) => println!(
            "{} {} [{}] updated {}",
            "Pipeline:".cyan(),
            report.pipeline,
            state,
            time.format("%Y-%m-%d %H:%M:%S")
        ),
        None => println!("{} {} [{}]", "Pipeline:".cyan(), report.pipeline, state),
    }

    for a in &report.analyses {
        println!(
            "  {:<24} {:<12} ready={} in_flight={} semaphored={} done={} failed={} workers={}",
            a.name,
            a.hint.to_string(),
            a.counts.ready,
            a.counts.in_flight(),
            a.counts.semaphored,
            a.counts.done + a.counts.passed_on,
            a.counts.failed,
            a.live_workers
        );
    }
    for reason in &report.reasons {
        println!("  {} {}", "Blocked:".red(), reason);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // Setup logging once the level is known
    setup_logging(config.log_level.as_deref()).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
