//! Shared hive integration tests
//!
//! Several connections to one file-backed hive, as separate worker processes
//! would hold, racing over claims and funnel semaphores.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

use apiary::domain::{Analysis, BRANCH_MAIN, DataflowRule, DataflowTarget, JobStatus};
use apiary::jobs::JobGraph;
use apiary::pipeline::Pipeline;
use apiary::store::{FunnelEffect, JobRepository, SqliteStore};
use apiary::{ApiaryError, Result};
use serde_json::json;
use tempfile::TempDir;

const CONNECTIONS: usize = 4;

fn fan_pipeline() -> Pipeline {
    Pipeline::new("fan")
        .with_analysis(Analysis::new(0, "start", "Dummy"))
        .with_analysis(Analysis::new(0, "work", "Dummy"))
        .with_analysis(Analysis::new(0, "sum", "Dummy"))
        .with_rule(DataflowRule::new("start", BRANCH_MAIN, DataflowTarget::analysis("work")).with_funnel("sum", None))
}

/// One graph per connection, all over the same database file.
fn graphs_over(db_path: &Path, pipeline: Pipeline, count: usize) -> Result<Vec<JobGraph>> {
    let first = Arc::new(SqliteStore::open_at(db_path)?);
    let pipeline = Arc::new(pipeline.install(first.as_ref())?);
    let mut graphs = vec![JobGraph::new(first, Arc::clone(&pipeline))];
    for _ in 1..count {
        let store = Arc::new(SqliteStore::open_at(db_path)?);
        graphs.push(JobGraph::new(store, Arc::clone(&pipeline)));
    }
    Ok(graphs)
}

fn analysis_id(graph: &JobGraph, name: &str) -> i64 {
    graph.pipeline().analysis(name).unwrap().id
}

/// Integration test: one READY job raced by every connection is claimed once
#[test]
fn test_concurrent_claim_is_at_most_once() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let graphs = graphs_over(&temp_dir.path().join("hive.db"), fan_pipeline(), CONNECTIONS)?;
    let job_id = graphs[0].create(analysis_id(&graphs[0], "start"), json!({}), None)?;

    let barrier = Arc::new(Barrier::new(CONNECTIONS));
    let handles: Vec<_> = graphs
        .into_iter()
        .enumerate()
        .map(|(i, graph)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                graph.claim(job_id, i as i64 + 1)
            })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        match handle.join().unwrap() {
            Ok(job) => winners.push(job.worker_id),
            Err(ApiaryError::ClaimConflict(id)) => assert_eq!(id, job_id),
            Err(e) => panic!("unexpected claim error: {e}"),
        }
    }
    assert_eq!(winners.len(), 1);
    Ok(())
}

/// Integration test: concurrent batch claims never hand the same job out twice
#[test]
fn test_concurrent_batches_are_disjoint() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let graphs = graphs_over(&temp_dir.path().join("hive.db"), fan_pipeline(), CONNECTIONS)?;
    let start = analysis_id(&graphs[0], "start");
    for n in 0..40 {
        graphs[0].create(start, json!({ "n": n }), None)?;
    }

    let barrier = Arc::new(Barrier::new(CONNECTIONS));
    let handles: Vec<_> = graphs
        .into_iter()
        .enumerate()
        .map(|(i, graph)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<Vec<i64>> {
                barrier.wait();
                let mut mine = Vec::new();
                loop {
                    let batch = graph.claim_batch(start, i as i64 + 1, 3)?;
                    if batch.is_empty() {
                        return Ok(mine);
                    }
                    mine.extend(batch.into_iter().map(|job| job.id));
                }
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for job_id in handle.join().unwrap()? {
            assert!(seen.insert(job_id), "job {job_id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 40);
    Ok(())
}

/// Integration test: workers on separate connections never push an analysis past its capacity
#[test]
fn test_analysis_capacity_holds_across_connections() -> Result<()> {
    const CAPACITY: u64 = 2;
    let temp_dir = TempDir::new()?;
    let mut capped = Analysis::new(0, "capped", "Dummy");
    capped.analysis_capacity = Some(CAPACITY as u32);
    let graphs = graphs_over(
        &temp_dir.path().join("hive.db"),
        Pipeline::new("capped").with_analysis(capped),
        CONNECTIONS,
    )?;
    let capped = analysis_id(&graphs[0], "capped");
    for n in 0..20 {
        graphs[0].create(capped, json!({ "n": n }), None)?;
    }

    let barrier = Arc::new(Barrier::new(CONNECTIONS));
    let handles: Vec<_> = graphs
        .into_iter()
        .enumerate()
        .map(|(i, graph)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<(usize, u64)> {
                barrier.wait();
                let (mut done, mut peak) = (0, 0);
                loop {
                    let batch = graph.claim_batch(capped, i as i64 + 1, 3)?;
                    peak = peak.max(graph.store().count_jobs_by_status(capped)?.in_flight());
                    if batch.is_empty() {
                        if graph.store().count_claimable(capped, i64::MAX)? == 0 {
                            return Ok((done, peak));
                        }
                        thread::yield_now();
                        continue;
                    }
                    for job in batch {
                        graph.start_compilation(job.id)?;
                        graph.start_run(job.id)?;
                        graph.complete(job.id)?;
                        done += 1;
                    }
                }
            })
        })
        .collect();

    let mut total_done = 0;
    for handle in handles {
        let (done, peak) = handle.join().unwrap()?;
        assert!(peak <= CAPACITY, "{peak} jobs in flight with capacity {CAPACITY}");
        total_done += done;
    }
    assert_eq!(total_done, 20);
    Ok(())
}

/// Integration test: a fan finished from several connections releases its funnel once
#[test]
fn test_funnel_released_once_by_concurrent_fan() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let graphs = graphs_over(&temp_dir.path().join("hive.db"), fan_pipeline(), CONNECTIONS)?;
    let start = graphs[0].create(analysis_id(&graphs[0], "start"), json!({}), None)?;
    let emitter = graphs[0].claim(start, 99)?;

    let payloads: Vec<_> = (0..12).map(|n| json!({ "n": n })).collect();
    let created = graphs[0].flow(&emitter, BRANCH_MAIN, &payloads)?;
    let funnel = created[0];
    assert_eq!(graphs[0].get(funnel)?.semaphore_count, 12);

    let chunks: Vec<Vec<i64>> = created[1..].chunks(3).map(|c| c.to_vec()).collect();
    let barrier = Arc::new(Barrier::new(CONNECTIONS));
    let handles: Vec<_> = graphs
        .iter()
        .cloned()
        .zip(chunks)
        .enumerate()
        .map(|(i, (graph, jobs))| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<Vec<FunnelEffect>> {
                barrier.wait();
                let mut effects = Vec::new();
                for job_id in jobs {
                    graph.claim(job_id, i as i64 + 1)?;
                    graph.start_compilation(job_id)?;
                    graph.start_run(job_id)?;
                    effects.push(graph.complete(job_id)?);
                }
                Ok(effects)
            })
        })
        .collect();

    let mut released = 0;
    for handle in handles {
        for effect in handle.join().unwrap()? {
            match effect {
                FunnelEffect::Released { funnel: f } => {
                    assert_eq!(f, funnel);
                    released += 1;
                }
                FunnelEffect::Decremented { funnel: f, .. } => assert_eq!(f, funnel),
                FunnelEffect::None => panic!("fan job was not semaphoring the funnel"),
            }
        }
    }
    assert_eq!(released, 1);

    let funnel_job = graphs[0].get(funnel)?;
    assert_eq!(funnel_job.status, JobStatus::Ready);
    assert_eq!(funnel_job.semaphore_count, 0);
    Ok(())
}

/// Integration test: a funnel stays SEMAPHORED while any fan job is unfinished
#[test]
fn test_funnel_waits_for_last_fan_job() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let graphs = graphs_over(&temp_dir.path().join("hive.db"), fan_pipeline(), 2)?;
    let (graph, other) = (&graphs[0], &graphs[1]);
    let start = graph.create(analysis_id(graph, "start"), json!({}), None)?;
    let emitter = graph.claim(start, 1)?;
    let created = graph.flow(&emitter, BRANCH_MAIN, &[json!({}), json!({})])?;
    let funnel = created[0];

    graph.claim(created[1], 1)?;
    graph.start_compilation(created[1])?;
    graph.start_run(created[1])?;
    graph.complete(created[1])?;

    // The second fan job has been retried, but is still unfinished
    other.claim(created[2], 2)?;
    other.start_compilation(created[2])?;
    other.fail(created[2], apiary::jobs::FailureReason::Recoverable("flaky".to_string()))?;
    assert_eq!(other.get(created[2])?.status, JobStatus::Ready);
    assert_eq!(other.get(funnel)?.status, JobStatus::Semaphored);

    let work = analysis_id(graph, "work");
    let sum = analysis_id(graph, "sum");
    assert!(graph.store().claimable_job_ids(sum, 10, i64::MAX)?.is_empty());
    assert_eq!(graph.store().claimable_job_ids(work, 10, i64::MAX)?, vec![created[2]]);

    other.claim(created[2], 2)?;
    other.start_compilation(created[2])?;
    other.start_run(created[2])?;
    assert_eq!(other.complete(created[2])?, FunnelEffect::Released { funnel });
    assert_eq!(graph.get(funnel)?.status, JobStatus::Ready);
    Ok(())
}
