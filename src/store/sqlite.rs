//! SQLite-backed job store.
//!
//! A single connection behind a mutex serves the whole process; other processes
//! sharing the same database file are serialized by SQLite itself (WAL mode with a
//! busy timeout, transactions taking the write lock up front). Every state change
//! that must be observed atomically is either a single conditional `UPDATE` or a
//! transaction.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params, params_from_iter};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::domain::{
    Analysis, AnalysisJob, CauseOfDeath, JobId, JobStatus, NewJob, Role, StatusCounts, WorkerRecord, WorkerStatus,
};
use crate::error::{ApiaryError, Result};
use crate::id::now_ms;
use crate::store::traits::{
    AccuEntry, AnalysisRepository, BatchIds, BoundedClaim, FunnelEffect, JobBatch, JobRepository, LogMessage,
    WorkerRepository,
};

const JOB_COLUMNS: &str = "job_id, analysis_id, input_json, status, retry_count, semaphored_by, semaphore_count, \
     prev_job_id, worker_id, available_at, last_error, created_at, updated_at";

const WORKER_COLUMNS: &str = "worker_id, meadow, process_id, status, analysis_id, resource_class, jobs_done, \
     cause_of_death, born_at, last_check_in, died_at";

const ROLE_COLUMNS: &str = "role_id, worker_id, analysis_id, started_at, ended_at, attempted_jobs, done_jobs";

const IN_FLIGHT_SQL: &str = "('CLAIMED', 'COMPILATION', 'RUN')";

/// Job store on a SQLite database.
pub struct SqliteStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the store at `db_path`.
    pub fn open_at(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(path = %db_path.display(), journal_mode = %mode, "Opened job store");

        Self::init_schema(&conn)?;
        Ok(Self {
            path: Some(db_path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    /// Open the default store for a pipeline under the local data directory.
    pub fn open_for_pipeline(pipeline_name: &str) -> Result<Self> {
        Self::open_at(&default_store_path(pipeline_name)?)
    }

    /// A private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    /// Database file, None for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_base (
                analysis_id INTEGER PRIMARY KEY AUTOINCREMENT,
                logic_name TEXT NOT NULL UNIQUE,
                json_data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job (
                job_id INTEGER PRIMARY KEY AUTOINCREMENT,
                analysis_id INTEGER NOT NULL,
                input_json TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                semaphored_by INTEGER,
                semaphore_count INTEGER NOT NULL DEFAULT 0,
                prev_job_id INTEGER,
                worker_id INTEGER,
                available_at INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_job_analysis_status ON job(analysis_id, status);
            CREATE INDEX IF NOT EXISTS idx_job_semaphored_by ON job(semaphored_by);
            CREATE INDEX IF NOT EXISTS idx_job_worker ON job(worker_id);

            CREATE TABLE IF NOT EXISTS accu (
                accu_id INTEGER PRIMARY KEY AUTOINCREMENT,
                funnel_job_id INTEGER NOT NULL,
                struct_name TEXT NOT NULL,
                kind TEXT NOT NULL,
                key_signature TEXT,
                value_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_accu_funnel ON accu(funnel_job_id);

            CREATE TABLE IF NOT EXISTS worker (
                worker_id INTEGER PRIMARY KEY AUTOINCREMENT,
                meadow TEXT NOT NULL,
                process_id TEXT NOT NULL,
                status TEXT NOT NULL,
                analysis_id INTEGER,
                resource_class TEXT,
                jobs_done INTEGER NOT NULL DEFAULT 0,
                cause_of_death TEXT,
                born_at INTEGER NOT NULL,
                last_check_in INTEGER NOT NULL,
                died_at INTEGER,
                UNIQUE(meadow, process_id)
            );

            CREATE INDEX IF NOT EXISTS idx_worker_status ON worker(status);

            CREATE TABLE IF NOT EXISTS role (
                role_id INTEGER PRIMARY KEY AUTOINCREMENT,
                worker_id INTEGER NOT NULL,
                analysis_id INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                attempted_jobs INTEGER NOT NULL DEFAULT 0,
                done_jobs INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS hive_meta (
                meta_key TEXT PRIMARY KEY,
                meta_value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS log_message (
                message_id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER,
                worker_id INTEGER,
                time INTEGER NOT NULL,
                message TEXT NOT NULL,
                is_error INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ApiaryError::StoreUnavailable("store connection lock poisoned".to_string()))
    }
}

/// Default database location for a pipeline: `<data_local_dir>/apiary/<hash>/hive.db`.
pub fn default_store_path(pipeline_name: &str) -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .ok_or_else(|| ApiaryError::Config("cannot determine local data directory".to_string()))?;
    Ok(base.join("apiary").join(compute_pipeline_hash(pipeline_name)).join("hive.db"))
}

/// Short stable hash of a pipeline name.
pub fn compute_pipeline_hash(pipeline_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pipeline_name.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<AnalysisJob> {
    let input: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(AnalysisJob {
        id: row.get(0)?,
        analysis_id: row.get(1)?,
        input: serde_json::from_str(&input).map_err(|e| conversion_error(2, e.to_string()))?,
        status: JobStatus::parse(&status).ok_or_else(|| conversion_error(3, format!("unknown job status {status}")))?,
        retry_count: row.get(4)?,
        semaphored_by: row.get(5)?,
        semaphore_count: row.get(6)?,
        prev_job: row.get(7)?,
        worker_id: row.get(8)?,
        available_at: row.get(9)?,
        last_error: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn row_to_worker(row: &Row<'_>) -> rusqlite::Result<WorkerRecord> {
    let status: String = row.get(3)?;
    let cause: Option<String> = row.get(7)?;
    Ok(WorkerRecord {
        id: row.get(0)?,
        meadow: row.get(1)?,
        process_id: row.get(2)?,
        status: WorkerStatus::parse(&status)
            .ok_or_else(|| conversion_error(3, format!("unknown worker status {status}")))?,
        analysis_id: row.get(4)?,
        resource_class: row.get(5)?,
        jobs_done: row.get(6)?,
        cause_of_death: cause.as_deref().and_then(CauseOfDeath::parse),
        born_at: row.get(8)?,
        last_check_in: row.get(9)?,
        died_at: row.get(10)?,
    })
}

fn row_to_role(row: &Row<'_>) -> rusqlite::Result<Role> {
    Ok(Role {
        id: row.get(0)?,
        worker_id: row.get(1)?,
        analysis_id: row.get(2)?,
        started_at: row.get(3)?,
        ended_at: row.get(4)?,
        attempted_jobs: row.get(5)?,
        done_jobs: row.get(6)?,
    })
}

fn row_to_analysis(row: &Row<'_>) -> rusqlite::Result<Analysis> {
    let id: i64 = row.get(0)?;
    let json: String = row.get(1)?;
    let mut analysis: Analysis = serde_json::from_str(&json).map_err(|e| conversion_error(1, e.to_string()))?;
    analysis.id = id;
    Ok(analysis)
}

fn insert_job(
    tx: &Transaction<'_>,
    job: &NewJob,
    status: JobStatus,
    semaphored_by: Option<JobId>,
    semaphore_count: i64,
    now: i64,
) -> Result<JobId> {
    tx.execute(
        r#"
        INSERT INTO job
        (analysis_id, input_json, status, retry_count, semaphored_by, semaphore_count, prev_job_id,
         available_at, created_at, updated_at)
        VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, 0, ?7, ?7)
        "#,
        params![
            job.analysis_id,
            serde_json::to_string(&job.input)?,
            status.as_str(),
            semaphored_by,
            semaphore_count,
            job.prev_job,
            now,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn insert_accu(conn: &Connection, entry: &AccuEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO accu (funnel_job_id, struct_name, kind, key_signature, value_json) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.funnel_job_id,
            entry.name,
            entry.kind,
            entry.key,
            serde_json::to_string(&entry.value)?
        ],
    )?;
    Ok(())
}

/// Add one to a funnel's count. An unclaimed READY funnel goes back to SEMAPHORED;
/// a funnel already claimed or finished cannot be blocked any more.
fn raise_semaphore(tx: &Transaction<'_>, funnel: JobId, now: i64) -> Result<()> {
    let status: Option<String> = tx
        .query_row("SELECT status FROM job WHERE job_id = ?1", params![funnel], |row| row.get(0))
        .optional()?;
    let status = status
        .as_deref()
        .and_then(JobStatus::parse)
        .ok_or(ApiaryError::JobNotFound(funnel))?;

    match status {
        JobStatus::Semaphored | JobStatus::Ready => {
            tx.execute(
                "UPDATE job SET semaphore_count = semaphore_count + 1, status = 'SEMAPHORED', updated_at = ?2 \
                 WHERE job_id = ?1",
                params![funnel, now],
            )?;
            Ok(())
        }
        other => Err(ApiaryError::InvalidState(format!(
            "cannot semaphore job {funnel}: it is already {other}"
        ))),
    }
}

/// Subtract one from a funnel's count, releasing it at zero.
fn lower_semaphore(tx: &Transaction<'_>, funnel: JobId, released_by: JobId, now: i64) -> Result<FunnelEffect> {
    let row: Option<(u32, String)> = tx
        .query_row(
            "SELECT semaphore_count, status FROM job WHERE job_id = ?1",
            params![funnel],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (count, status) = row.ok_or(ApiaryError::JobNotFound(funnel))?;

    if count == 0 {
        return Err(ApiaryError::SemaphoreUnderflow {
            funnel_job_id: funnel,
            job_id: released_by,
        });
    }

    let remaining = count - 1;
    if remaining == 0 && status == JobStatus::Semaphored.as_str() {
        tx.execute(
            "UPDATE job SET semaphore_count = 0, status = 'READY', updated_at = ?2 WHERE job_id = ?1",
            params![funnel, now],
        )?;
        return Ok(FunnelEffect::Released { funnel });
    }

    tx.execute(
        "UPDATE job SET semaphore_count = ?2, updated_at = ?3 WHERE job_id = ?1",
        params![funnel, remaining, now],
    )?;
    Ok(FunnelEffect::Decremented { funnel, remaining })
}

impl AnalysisRepository for SqliteStore {
    fn store_analysis(&self, analysis: &Analysis) -> Result<i64> {
        let conn = self.conn()?;
        let json = serde_json::to_string(analysis)?;
        conn.execute(
            r#"
            INSERT INTO analysis_base (logic_name, json_data) VALUES (?1, ?2)
            ON CONFLICT(logic_name) DO UPDATE SET json_data = excluded.json_data
            "#,
            params![analysis.name, json],
        )?;
        let id = conn.query_row(
            "SELECT analysis_id FROM analysis_base WHERE logic_name = ?1",
            params![analysis.name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn get_analysis(&self, id: i64) -> Result<Option<Analysis>> {
        let conn = self.conn()?;
        let analysis = conn
            .query_row(
                "SELECT analysis_id, json_data FROM analysis_base WHERE analysis_id = ?1",
                params![id],
                row_to_analysis,
            )
            .optional()?;
        Ok(analysis)
    }

    fn find_analysis(&self, name: &str) -> Result<Option<Analysis>> {
        let conn = self.conn()?;
        let analysis = conn
            .query_row(
                "SELECT analysis_id, json_data FROM analysis_base WHERE logic_name = ?1",
                params![name],
                row_to_analysis,
            )
            .optional()?;
        Ok(analysis)
    }

    fn list_analyses(&self) -> Result<Vec<Analysis>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT analysis_id, json_data FROM analysis_base ORDER BY analysis_id")?;
        let analyses = stmt.query_map([], row_to_analysis)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(analyses)
    }

    fn set_capacity(&self, id: i64, hive_capacity: Option<u32>, analysis_capacity: Option<u32>) -> Result<()> {
        let mut analysis = self
            .get_analysis(id)?
            .ok_or_else(|| ApiaryError::AnalysisNotFound(id.to_string()))?;
        analysis.hive_capacity = hive_capacity;
        analysis.analysis_capacity = analysis_capacity;

        let conn = self.conn()?;
        conn.execute(
            "UPDATE analysis_base SET json_data = ?2 WHERE analysis_id = ?1",
            params![id, serde_json::to_string(&analysis)?],
        )?;
        Ok(())
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO hive_meta (meta_key, meta_value) VALUES (?1, ?2) \
             ON CONFLICT(meta_key) DO UPDATE SET meta_value = excluded.meta_value",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT meta_value FROM hive_meta WHERE meta_key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }
}

impl JobRepository for SqliteStore {
    fn apply_flow(&self, batches: &[JobBatch], accus: &[AccuEntry]) -> Result<Vec<BatchIds>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ms();
        let mut all_ids = Vec::with_capacity(batches.len());

        for batch in batches {
            let mut ids = BatchIds::default();
            if let Some(funnel) = &batch.funnel {
                if let Some(outer) = funnel.semaphored_by {
                    raise_semaphore(&tx, outer, now)?;
                }
                let count = batch.fan.len() as i64;
                let status = if count > 0 { JobStatus::Semaphored } else { JobStatus::Ready };
                ids.funnel = Some(insert_job(&tx, funnel, status, funnel.semaphored_by, count, now)?);
            }

            for job in &batch.fan {
                let semaphored_by = match ids.funnel {
                    Some(funnel) => Some(funnel),
                    None => {
                        if let Some(funnel) = job.semaphored_by {
                            raise_semaphore(&tx, funnel, now)?;
                        }
                        job.semaphored_by
                    }
                };
                ids.fan.push(insert_job(&tx, job, JobStatus::Ready, semaphored_by, 0, now)?);
            }
            all_ids.push(ids);
        }

        for entry in accus {
            insert_accu(&tx, entry)?;
        }

        tx.commit()?;
        Ok(all_ids)
    }

    fn get_job(&self, id: JobId) -> Result<Option<AnalysisJob>> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM job WHERE job_id = ?1"),
                params![id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn list_jobs(&self, analysis_id: Option<i64>, status: Option<JobStatus>) -> Result<Vec<AnalysisJob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM job \
             WHERE (?1 IS NULL OR analysis_id = ?1) AND (?2 IS NULL OR status = ?2) \
             ORDER BY job_id"
        ))?;
        let jobs = stmt
            .query_map(params![analysis_id, status.map(|s| s.as_str())], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn claimable_job_ids(&self, analysis_id: i64, limit: usize, now: i64) -> Result<Vec<JobId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT job_id FROM job WHERE analysis_id = ?1 AND status = 'READY' AND available_at <= ?2 \
             ORDER BY job_id LIMIT ?3",
        )?;
        let ids = stmt
            .query_map(params![analysis_id, now, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn count_claimable(&self, analysis_id: i64, now: i64) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM job WHERE analysis_id = ?1 AND status = 'READY' AND available_at <= ?2",
            params![analysis_id, now],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn claim_job(&self, id: JobId, worker_id: i64, now: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE job SET status = 'CLAIMED', worker_id = ?2, updated_at = ?3 \
             WHERE job_id = ?1 AND status = 'READY' AND available_at <= ?3",
            params![id, worker_id, now],
        )?;
        Ok(changed == 1)
    }

    fn claim_job_within(&self, id: JobId, worker_id: i64, now: i64, capacity: u32) -> Result<BoundedClaim> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let in_flight: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM job WHERE status IN {IN_FLIGHT_SQL} \
                 AND analysis_id = (SELECT analysis_id FROM job WHERE job_id = ?1)"
            ),
            params![id],
            |row| row.get(0),
        )?;
        if in_flight >= capacity as i64 {
            return Ok(BoundedClaim::AtCapacity);
        }

        let changed = tx.execute(
            "UPDATE job SET status = 'CLAIMED', worker_id = ?2, updated_at = ?3 \
             WHERE job_id = ?1 AND status = 'READY' AND available_at <= ?3",
            params![id, worker_id, now],
        )?;
        tx.commit()?;
        Ok(if changed == 1 { BoundedClaim::Claimed } else { BoundedClaim::Conflict })
    }

    fn update_job_status(&self, id: JobId, from: &[JobStatus], to: JobStatus) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let placeholders = (0..from.len()).map(|i| format!("?{}", i + 4)).collect::<Vec<_>>().join(", ");
        let sql = format!("UPDATE job SET status = ?2, updated_at = ?3 WHERE job_id = ?1 AND status IN ({placeholders})");

        let mut values: Vec<rusqlite::types::Value> = vec![
            id.into(),
            to.as_str().to_string().into(),
            now_ms().into(),
        ];
        values.extend(from.iter().map(|s| rusqlite::types::Value::from(s.as_str().to_string())));

        let conn = self.conn()?;
        let changed = conn.execute(&sql, params_from_iter(values))?;
        Ok(changed == 1)
    }

    fn finish_job(&self, id: JobId, terminal: JobStatus) -> Result<Option<FunnelEffect>> {
        if !matches!(terminal, JobStatus::Done | JobStatus::PassedOn) {
            return Err(ApiaryError::InvalidState(format!("{terminal} is not a completion status")));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ms();

        let changed = tx.execute(
            &format!("UPDATE job SET status = ?2, updated_at = ?3 WHERE job_id = ?1 AND status IN {IN_FLIGHT_SQL}"),
            params![id, terminal.as_str(), now],
        )?;
        if changed == 0 {
            return Ok(None);
        }

        let semaphored_by: Option<JobId> =
            tx.query_row("SELECT semaphored_by FROM job WHERE job_id = ?1", params![id], |row| row.get(0))?;
        let effect = match semaphored_by {
            Some(funnel) => lower_semaphore(&tx, funnel, id, now)?,
            None => FunnelEffect::None,
        };

        tx.commit()?;
        Ok(Some(effect))
    }

    fn requeue_job(&self, id: JobId, retry_count: u32, available_at: i64, message: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE job SET status = 'READY', retry_count = ?2, available_at = ?3, last_error = ?4, \
                 worker_id = NULL, updated_at = ?5 WHERE job_id = ?1 AND status IN {IN_FLIGHT_SQL}"
            ),
            params![id, retry_count, available_at, message, now_ms()],
        )?;
        Ok(changed == 1)
    }

    fn fail_job(&self, id: JobId, retry_count: u32, message: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE job SET status = 'FAILED', retry_count = ?2, last_error = ?3, updated_at = ?4 \
             WHERE job_id = ?1 AND status IN ('SEMAPHORED', 'CLAIMED', 'COMPILATION', 'RUN')",
            params![id, retry_count, message, now_ms()],
        )?;
        Ok(changed == 1)
    }

    fn jobs_held_by_worker(&self, worker_id: i64) -> Result<Vec<AnalysisJob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE worker_id = ?1 AND status IN {IN_FLIGHT_SQL} ORDER BY job_id"
        ))?;
        let jobs = stmt
            .query_map(params![worker_id], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn count_jobs_by_status(&self, analysis_id: i64) -> Result<StatusCounts> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM job WHERE analysis_id = ?1 GROUP BY status")?;
        let rows = stmt
            .query_map(params![analysis_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match JobStatus::parse(&status) {
                Some(status) => *counts.get_mut(status) = count.max(0) as u64,
                None => warn!(analysis_id, status = %status, "Ignoring unknown job status"),
            }
        }
        Ok(counts)
    }

    fn accu_for(&self, funnel_job_id: JobId) -> Result<Vec<AccuEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT funnel_job_id, struct_name, kind, key_signature, value_json FROM accu \
             WHERE funnel_job_id = ?1 ORDER BY accu_id",
        )?;
        let entries = stmt
            .query_map(params![funnel_job_id], |row| {
                let value: String = row.get(4)?;
                Ok(AccuEntry {
                    funnel_job_id: row.get(0)?,
                    name: row.get(1)?,
                    kind: row.get(2)?,
                    key: row.get(3)?,
                    value: serde_json::from_str(&value).map_err(|e| conversion_error(4, e.to_string()))?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn log_message(&self, job_id: Option<JobId>, worker_id: Option<i64>, message: &str, is_error: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO log_message (job_id, worker_id, time, message, is_error) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job_id, worker_id, now_ms(), message, is_error],
        )?;
        Ok(())
    }

    fn messages_for_job(&self, job_id: JobId) -> Result<Vec<LogMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT job_id, worker_id, time, message, is_error FROM log_message WHERE job_id = ?1 ORDER BY message_id",
        )?;
        let messages = stmt
            .query_map(params![job_id], |row| {
                Ok(LogMessage {
                    job_id: row.get(0)?,
                    worker_id: row.get(1)?,
                    time: row.get(2)?,
                    message: row.get(3)?,
                    is_error: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }
}

impl WorkerRepository for SqliteStore {
    fn register_worker(
        &self,
        meadow: &str,
        process_id: &str,
        analysis_id: Option<i64>,
        resource_class: Option<&str>,
    ) -> Result<WorkerRecord> {
        let conn = self.conn()?;
        let now = now_ms();
        conn.execute(
            "INSERT OR IGNORE INTO worker \
             (meadow, process_id, status, analysis_id, resource_class, jobs_done, born_at, last_check_in) \
             VALUES (?1, ?2, 'UNSPECIALIZED', ?3, ?4, 0, ?5, ?5)",
            params![meadow, process_id, analysis_id, resource_class, now],
        )?;
        let worker = conn.query_row(
            &format!("SELECT {WORKER_COLUMNS} FROM worker WHERE meadow = ?1 AND process_id = ?2"),
            params![meadow, process_id],
            row_to_worker,
        )?;
        Ok(worker)
    }

    fn get_worker(&self, id: i64) -> Result<Option<WorkerRecord>> {
        let conn = self.conn()?;
        let worker = conn
            .query_row(
                &format!("SELECT {WORKER_COLUMNS} FROM worker WHERE worker_id = ?1"),
                params![id],
                row_to_worker,
            )
            .optional()?;
        Ok(worker)
    }

    fn find_worker(&self, meadow: &str, process_id: &str) -> Result<Option<WorkerRecord>> {
        let conn = self.conn()?;
        let worker = conn
            .query_row(
                &format!("SELECT {WORKER_COLUMNS} FROM worker WHERE meadow = ?1 AND process_id = ?2"),
                params![meadow, process_id],
                row_to_worker,
            )
            .optional()?;
        Ok(worker)
    }

    fn live_workers(&self) -> Result<Vec<WorkerRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKER_COLUMNS} FROM worker WHERE status != 'DEAD' ORDER BY worker_id"
        ))?;
        let workers = stmt.query_map([], row_to_worker)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(workers)
    }

    fn specialize_worker(
        &self,
        worker_id: i64,
        analysis_id: i64,
        resource_class: &str,
        hive_capacity: Option<u32>,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(capacity) = hive_capacity {
            let bound: i64 = tx.query_row(
                "SELECT COUNT(*) FROM worker WHERE analysis_id = ?1 AND worker_id != ?2 \
                 AND status NOT IN ('DEAD', 'UNSPECIALIZED')",
                params![analysis_id, worker_id],
                |row| row.get(0),
            )?;
            if bound >= capacity as i64 {
                return Ok(false);
            }
        }

        let changed = tx.execute(
            "UPDATE worker SET analysis_id = ?2, resource_class = ?3, status = 'SPECIALIZED', last_check_in = ?4 \
             WHERE worker_id = ?1 AND status != 'DEAD'",
            params![worker_id, analysis_id, resource_class, now_ms()],
        )?;
        tx.commit()?;
        Ok(changed == 1)
    }

    fn set_worker_status(&self, id: i64, status: WorkerStatus) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE worker SET status = ?2, last_check_in = ?3 WHERE worker_id = ?1 AND status != 'DEAD'",
            params![id, status.as_str(), now_ms()],
        )?;
        Ok(())
    }

    fn record_job_done(&self, worker_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE worker SET jobs_done = jobs_done + 1, last_check_in = ?2 WHERE worker_id = ?1",
            params![worker_id, now_ms()],
        )?;
        Ok(())
    }

    fn mark_worker_dead(&self, id: i64, cause: CauseOfDeath) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_ms();
        let changed = conn.execute(
            "UPDATE worker SET status = 'DEAD', cause_of_death = ?2, died_at = ?3, last_check_in = ?3 \
             WHERE worker_id = ?1 AND status != 'DEAD'",
            params![id, cause.as_str(), now],
        )?;
        Ok(changed == 1)
    }

    fn start_role(&self, worker_id: i64, analysis_id: i64) -> Result<Role> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO role (worker_id, analysis_id, started_at) VALUES (?1, ?2, ?3)",
            params![worker_id, analysis_id, now_ms()],
        )?;
        let id = conn.last_insert_rowid();
        let role = conn.query_row(
            &format!("SELECT {ROLE_COLUMNS} FROM role WHERE role_id = ?1"),
            params![id],
            row_to_role,
        )?;
        Ok(role)
    }

    fn end_role(&self, role_id: i64, attempted_jobs: u32, done_jobs: u32) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE role SET ended_at = ?2, attempted_jobs = ?3, done_jobs = ?4 WHERE role_id = ?1",
            params![role_id, now_ms(), attempted_jobs, done_jobs],
        )?;
        Ok(())
    }
}
