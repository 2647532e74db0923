//! In-process meadow: every worker is a tokio task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::CauseOfDeath;
use crate::error::{ApiaryError, Result};
use crate::id::generate_process_id;
use crate::meadow::{Liveness, Meadow, MeadowType, RoleSpec, WorkerHandle};

/// Runs one worker to completion and reports why it stopped.
pub type WorkerLauncher = Arc<dyn Fn(RoleSpec, WorkerHandle) -> BoxFuture<'static, CauseOfDeath> + Send + Sync>;

pub struct LocalMeadow {
    name: String,
    max_workers: usize,
    launcher: WorkerLauncher,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    finished: Arc<Mutex<HashMap<String, CauseOfDeath>>>,
}

impl LocalMeadow {
    /// A local meadow bounded by the number of available CPUs.
    pub fn new(name: impl Into<String>, launcher: WorkerLauncher) -> Self {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::with_max_workers(name, launcher, cpus)
    }

    pub fn with_max_workers(name: impl Into<String>, launcher: WorkerLauncher, max_workers: usize) -> Self {
        Self {
            name: name.into(),
            max_workers,
            launcher,
            tasks: Mutex::new(HashMap::new()),
            finished: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_tasks(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>>> {
        self.tasks
            .lock()
            .map_err(|_| ApiaryError::Meadow(format!("{}: task table poisoned", self.name)))
    }

    fn running(&self) -> Result<usize> {
        Ok(self.lock_tasks()?.values().filter(|t| !t.is_finished()).count())
    }
}

#[async_trait]
impl Meadow for LocalMeadow {
    fn name(&self) -> &str {
        &self.name
    }

    fn meadow_type(&self) -> MeadowType {
        MeadowType::Local
    }

    fn max_workers(&self) -> usize {
        self.max_workers
    }

    async fn submit(&self, n: usize, spec: &RoleSpec) -> Result<Vec<WorkerHandle>> {
        let room = self.max_workers.saturating_sub(self.running()?);
        if room < n {
            warn!(meadow = %self.name, requested = n, room, "Local meadow full, submitting fewer workers");
        }

        let mut handles = Vec::with_capacity(n.min(room));
        let mut tasks = self.lock_tasks()?;
        for _ in 0..n.min(room) {
            let handle = WorkerHandle::new(&self.name, generate_process_id(&self.name));
            let run = (self.launcher)(spec.clone(), handle.clone());
            let finished = Arc::clone(&self.finished);
            let process_id = handle.process_id.clone();
            let task = tokio::spawn(async move {
                let cause = run.await;
                debug!(process_id = %process_id, cause = %cause, "Local worker exited");
                if let Ok(mut finished) = finished.lock() {
                    finished.insert(process_id, cause);
                }
            });
            tasks.insert(handle.process_id.clone(), task);
            handles.push(handle);
        }
        info!(meadow = %self.name, submitted = handles.len(), analysis = ?spec.analysis_name, "Submitted local workers");
        Ok(handles)
    }

    async fn status_of_all_workers(&self) -> Result<HashMap<String, Liveness>> {
        let tasks = self.lock_tasks()?;
        let finished = self
            .finished
            .lock()
            .map_err(|_| ApiaryError::Meadow(format!("{}: exit table poisoned", self.name)))?;
        Ok(tasks
            .iter()
            .map(|(process_id, task)| {
                // A killed task may not have unwound yet; a panicked one never records a cause
                let liveness = match finished.get(process_id) {
                    Some(cause) => Liveness::Dead(Some(*cause)),
                    None if task.is_finished() => Liveness::Dead(None),
                    None => Liveness::Alive,
                };
                (process_id.clone(), liveness)
            })
            .collect())
    }

    async fn forget(&self, process_ids: &[String]) -> Result<()> {
        let mut tasks = self.lock_tasks()?;
        let mut finished = self
            .finished
            .lock()
            .map_err(|_| ApiaryError::Meadow(format!("{}: exit table poisoned", self.name)))?;
        for process_id in process_ids {
            if tasks.get(process_id).is_some_and(|task| !task.is_finished()) {
                continue;
            }
            tasks.remove(process_id);
            finished.remove(process_id);
        }
        debug!(meadow = %self.name, forgotten = process_ids.len(), "Forgot finished local workers");
        Ok(())
    }

    async fn kill(&self, handle: &WorkerHandle) -> Result<()> {
        let tasks = self.lock_tasks()?;
        let task = tasks
            .get(&handle.process_id)
            .ok_or_else(|| ApiaryError::Meadow(format!("{}: unknown process {}", self.name, handle.process_id)))?;
        if !task.is_finished() {
            task.abort();
            if let Ok(mut finished) = self.finished.lock() {
                finished.insert(handle.process_id.clone(), CauseOfDeath::KilledByUser);
            }
            info!(process_id = %handle.process_id, "Killed local worker");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn launcher_returning(cause: CauseOfDeath, delay: Duration) -> WorkerLauncher {
        Arc::new(move |_spec, _handle| {
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                cause
            })
        })
    }

    fn spec() -> RoleSpec {
        RoleSpec::new("test", "default").for_analysis(1, "work")
    }

    #[tokio::test]
    async fn test_submit_respects_max_workers() {
        let meadow = LocalMeadow::with_max_workers(
            "local",
            launcher_returning(CauseOfDeath::NoWork, Duration::from_secs(5)),
            2,
        );
        let handles = meadow.submit(5, &spec()).await.unwrap();
        assert_eq!(handles.len(), 2);
        assert!(handles.iter().all(|h| h.meadow == "local"));
        assert_eq!(meadow.count_running().await.unwrap(), 2);

        let more = meadow.submit(1, &spec()).await.unwrap();
        assert!(more.is_empty());
    }

    #[tokio::test]
    async fn test_finished_worker_reports_cause() {
        let meadow = LocalMeadow::with_max_workers(
            "local",
            launcher_returning(CauseOfDeath::JobLimit, Duration::from_millis(1)),
            4,
        );
        let handles = meadow.submit(1, &spec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = meadow.status_of_all_workers().await.unwrap();
        assert_eq!(
            status.get(&handles[0].process_id),
            Some(&Liveness::Dead(Some(CauseOfDeath::JobLimit)))
        );
    }

    #[tokio::test]
    async fn test_kill_marks_killed_by_user() {
        let meadow = LocalMeadow::with_max_workers(
            "local",
            launcher_returning(CauseOfDeath::NoWork, Duration::from_secs(30)),
            4,
        );
        let handles = meadow.submit(1, &spec()).await.unwrap();
        meadow.kill(&handles[0]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = meadow.status_of_all_workers().await.unwrap();
        assert_eq!(
            status.get(&handles[0].process_id),
            Some(&Liveness::Dead(Some(CauseOfDeath::KilledByUser)))
        );
        assert_eq!(meadow.count_running().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_forget_drops_only_finished_workers() {
        let meadow = LocalMeadow::with_max_workers(
            "local",
            launcher_returning(CauseOfDeath::NoWork, Duration::from_millis(1)),
            4,
        );
        let quick = meadow.submit(2, &spec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let slow = LocalMeadow::with_max_workers(
            "local",
            launcher_returning(CauseOfDeath::NoWork, Duration::from_secs(30)),
            4,
        );
        let running = slow.submit(1, &spec()).await.unwrap();

        let ids: Vec<String> = quick.iter().map(|h| h.process_id.clone()).collect();
        meadow.forget(&ids).await.unwrap();
        assert!(meadow.status_of_all_workers().await.unwrap().is_empty());

        slow.forget(&[running[0].process_id.clone()]).await.unwrap();
        assert_eq!(slow.status_of_all_workers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_kill_unknown_process_is_error() {
        let meadow = LocalMeadow::with_max_workers(
            "local",
            launcher_returning(CauseOfDeath::NoWork, Duration::from_millis(1)),
            1,
        );
        let result = meadow.kill(&WorkerHandle::new("local", "nope")).await;
        assert!(matches!(result, Err(ApiaryError::Meadow(_))));
    }

    #[test]
    fn test_default_bound_is_cpu_count() {
        let meadow = LocalMeadow::new("local", launcher_returning(CauseOfDeath::NoWork, Duration::ZERO));
        assert!(meadow.max_workers() >= 1);
        assert_eq!(meadow.meadow_type(), MeadowType::Local);
    }
}
