//! Long multiplication integration tests
//!
//! Runs the three-analysis long multiplication pipeline end to end against a
//! file-backed hive, with local workers driven by the Queen.

use std::sync::Arc;
use std::time::Duration;

use apiary::jobs::JobGraph;
use apiary::limiter::Limiter;
use apiary::meadow::{LocalMeadow, Valley};
use apiary::pipeline::Pipeline;
use apiary::queen::{BeekeeperConfig, PipelineState, Queen, QueenConfig};
use apiary::scheduler::Scheduler;
use apiary::stats::StatsConfig;
use apiary::store::{AnalysisRepository, JobRepository, SqliteStore};
use apiary::worker::{RunnableRegistry, WorkerConfig, WorkerContext};
use apiary::Result;
use tempfile::TempDir;

const LONG_MULT: &str = r##"
name: long_mult
params:
  take_time: 0
analyses:
  - name: take_b_apart
    module: DigitFactory
  - name: part_multiply
    module: PartMultiply
    hive_capacity: 4
  - name: add_together
    module: AddTogether
  - name: final_result
    module: Dummy
dataflow_rules:
  - from_analysis: take_b_apart
    branch: 2
    target:
      type: analysis
      name: part_multiply
      template:
        a_multiplier: "#a_multiplier#"
        digit: "#digit#"
    funnel:
      analysis: add_together
  - from_analysis: part_multiply
    target:
      type: accumulator
      name: partial_product
      accu:
        kind: map
        key_param: digit
  - from_analysis: add_together
    target:
      type: analysis
      name: final_result
seeds:
  - analysis: take_b_apart
    input:
      a_multiplier: "9650156169"
      b_multiplier: "327358788"
"##;

fn queen_over(store: Arc<SqliteStore>, pipeline: Pipeline, max_workers: usize) -> Result<Queen> {
    let pipeline = Arc::new(pipeline.install(store.as_ref())?);
    let graph = JobGraph::new(store, pipeline);
    let limiter = Limiter::new();
    let ctx = WorkerContext::new(
        graph.clone(),
        Arc::new(RunnableRegistry::with_builtins()),
        limiter.clone(),
        WorkerConfig::default(),
    );
    let meadow = LocalMeadow::with_max_workers("local", ctx.launcher(), max_workers);
    let config = QueenConfig {
        scheduler: Scheduler::new().with_max_workers(max_workers),
        stats: StatsConfig::new(Duration::ZERO, 0),
        beekeeper: BeekeeperConfig::new(Duration::from_millis(10)).with_max_passes(1000),
    };
    Ok(Queen::new(graph, Valley::new(Arc::new(meadow)), limiter, config))
}

/// Integration test: the pipeline computes the product and every analysis ends DONE
#[tokio::test]
async fn test_long_mult_end_to_end() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = Arc::new(SqliteStore::open_at(&temp_dir.path().join("long_mult.db"))?);
    let mut queen = queen_over(Arc::clone(&store), Pipeline::from_yaml(LONG_MULT)?, 4)?;
    queen.seed_pipeline()?;

    let report = queen.run_until_done(None).await?;
    assert_eq!(report.state, PipelineState::Done, "reasons: {:?}", report.reasons);

    // 327358788 has the distinct digits 2, 3, 5, 7 and 8 once 0 and 1 are dropped
    assert_eq!(report.analysis("take_b_apart").unwrap().counts.done, 1);
    assert_eq!(report.analysis("part_multiply").unwrap().counts.done, 5);
    assert_eq!(report.analysis("add_together").unwrap().counts.done, 1);
    assert_eq!(report.analysis("final_result").unwrap().counts.done, 1);
    assert_eq!(report.total().failed, 0);

    let final_id = queen.pipeline().require_analysis("final_result")?.id;
    let finals = store.list_jobs(Some(final_id), None)?;
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].input["result"], "3159063427494563172");
    Ok(())
}

/// Integration test: a worker process can rebuild the pipeline from the hive alone
#[tokio::test]
async fn test_installed_pipeline_survives_reopen() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("long_mult.db");

    {
        let store = SqliteStore::open_at(&db_path)?;
        Pipeline::from_yaml(LONG_MULT)?.install(&store)?;
    }

    let store = SqliteStore::open_at(&db_path)?;
    let pipeline = Pipeline::from_store(&store)?;
    assert_eq!(pipeline.name, "long_mult");
    assert_eq!(pipeline.analyses.len(), 4);
    assert_eq!(pipeline.rules_for("take_b_apart", 2).count(), 1);

    let stored = store.find_analysis("part_multiply")?.unwrap();
    assert_eq!(stored.id, pipeline.analysis("part_multiply").unwrap().id);
    assert_eq!(stored.hive_capacity, Some(4));
    Ok(())
}

/// Integration test: a second run over a finished hive finds nothing to do
#[tokio::test]
async fn test_resume_over_finished_hive() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("long_mult.db");

    {
        let store = Arc::new(SqliteStore::open_at(&db_path)?);
        let mut queen = queen_over(store, Pipeline::from_yaml(LONG_MULT)?, 4)?;
        queen.seed_pipeline()?;
        let report = queen.run_until_done(None).await?;
        assert_eq!(report.state, PipelineState::Done);
    }

    let store = Arc::new(SqliteStore::open_at(&db_path)?);
    let mut queen = queen_over(store, Pipeline::from_yaml(LONG_MULT)?, 4)?;
    let report = queen.run_until_done(None).await?;
    assert_eq!(report.state, PipelineState::Done);
    assert_eq!(report.total().done, 8);
    assert_eq!(queen.state().workers_submitted, 0);
    Ok(())
}
