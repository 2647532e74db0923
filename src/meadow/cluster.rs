//! Cluster meadow: workers are jobs in an external batch queue.
//!
//! The queue is reached through [`ClusterClient`]. [`CommandClusterClient`]
//! drives any scheduler with a CLI by running configured command templates:
//!
//! - `submit`: prints one process id per line
//! - `status`: prints `<process_id> <STATE>` per line
//! - `kill`: exit status only
//!
//! Templates use `{name}` placeholders: `{count}`, `{submission_name}`,
//! `{pipeline}`, `{analysis}`, `{resource_class}`, `{submission_args}`,
//! `{worker_args}` and `{process_id}`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::CauseOfDeath;
use crate::error::{ApiaryError, Result};
use crate::id::generate_submission_name;
use crate::meadow::{Liveness, Meadow, MeadowType, RoleSpec, WorkerHandle};

/// Queue states that count as alive.
const ALIVE_STATES: [&str; 6] = ["PENDING", "RUNNING", "CONFIGURING", "COMPLETING", "SUSPENDED", "REQUEUED"];

/// Access to a cluster's batch queue.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Submit `count` workers under one submission name; returns their process ids.
    async fn submit(&self, submission_name: &str, count: usize, spec: &RoleSpec) -> Result<Vec<String>>;

    async fn status(&self) -> Result<HashMap<String, Liveness>>;

    async fn kill(&self, process_id: &str) -> Result<()>;
}

/// Command templates for [`CommandClusterClient`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterCommands {
    pub submit: String,
    pub status: String,
    pub kill: String,
    pub timeout_ms: u64,
}

impl Default for ClusterCommands {
    fn default() -> Self {
        Self {
            submit: "for i in $(seq 1 {count}); do sbatch --parsable --job-name={submission_name} {submission_args} \
                     --wrap 'apiary worker --pipeline {pipeline} --analysis {analysis} {worker_args}'; done"
                .to_string(),
            status: "squeue --noheader --format='%i %T'".to_string(),
            kill: "scancel {process_id}".to_string(),
            timeout_ms: 30000,
        }
    }
}

/// Fill `{name}` placeholders; unknown placeholders are left as they are.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{name}}}"), value)
    })
}

/// Parse `status` output lines into liveness.
pub fn parse_status_output(output: &str) -> HashMap<String, Liveness> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let process_id = parts.next()?;
            let state = parts.next().unwrap_or("UNKNOWN").to_uppercase();
            let liveness = if ALIVE_STATES.contains(&state.as_str()) {
                Liveness::Alive
            } else if state == "TIMEOUT" {
                Liveness::Dead(Some(CauseOfDeath::RunLimit))
            } else if state == "OUT_OF_MEMORY" {
                Liveness::Dead(Some(CauseOfDeath::MemLimit))
            } else if state == "CANCELLED" {
                Liveness::Dead(Some(CauseOfDeath::KilledByUser))
            } else {
                Liveness::Dead(None)
            };
            Some((process_id.to_string(), liveness))
        })
        .collect()
}

pub struct CommandClusterClient {
    commands: ClusterCommands,
}

impl CommandClusterClient {
    pub fn new(commands: ClusterCommands) -> Self {
        Self { commands }
    }

    async fn run(&self, command: &str) -> Result<String> {
        debug!(command, "Running cluster command");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let timeout = Duration::from_millis(self.commands.timeout_ms);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ApiaryError::Meadow(format!("'{command}' timed out after {}ms", self.commands.timeout_ms)))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ApiaryError::Meadow(format!(
                "'{command}' exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ClusterClient for CommandClusterClient {
    async fn submit(&self, submission_name: &str, count: usize, spec: &RoleSpec) -> Result<Vec<String>> {
        let count_str = count.to_string();
        let command = render_template(
            &self.commands.submit,
            &[
                ("count", &count_str),
                ("submission_name", submission_name),
                ("pipeline", &spec.pipeline),
                ("analysis", spec.analysis_name.as_deref().unwrap_or("")),
                ("resource_class", &spec.resource_class),
                ("submission_args", &spec.description.submission_args),
                ("worker_args", &spec.description.worker_args),
            ],
        );
        let stdout = self.run(&command).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn status(&self) -> Result<HashMap<String, Liveness>> {
        Ok(parse_status_output(&self.run(&self.commands.status).await?))
    }

    async fn kill(&self, process_id: &str) -> Result<()> {
        self.run(&render_template(&self.commands.kill, &[("process_id", process_id)]))
            .await
            .map(|_| ())
    }
}

pub struct ClusterMeadow {
    name: String,
    queue_limit: usize,
    client: Arc<dyn ClusterClient>,
}

impl ClusterMeadow {
    pub fn new(name: impl Into<String>, client: Arc<dyn ClusterClient>, queue_limit: usize) -> Self {
        Self {
            name: name.into(),
            queue_limit,
            client,
        }
    }
}

#[async_trait]
impl Meadow for ClusterMeadow {
    fn name(&self) -> &str {
        &self.name
    }

    fn meadow_type(&self) -> MeadowType {
        MeadowType::Cluster
    }

    fn max_workers(&self) -> usize {
        self.queue_limit
    }

    async fn submit(&self, n: usize, spec: &RoleSpec) -> Result<Vec<WorkerHandle>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let submission_name =
            generate_submission_name(&spec.pipeline, spec.analysis_name.as_deref().unwrap_or("any"));
        let process_ids = self.client.submit(&submission_name, n, spec).await?;
        if process_ids.len() != n {
            warn!(meadow = %self.name, requested = n, got = process_ids.len(), "Cluster accepted a different worker count");
        }
        info!(meadow = %self.name, submission = %submission_name, submitted = process_ids.len(), "Submitted cluster workers");
        Ok(process_ids
            .into_iter()
            .map(|process_id| WorkerHandle::new(&self.name, process_id))
            .collect())
    }

    async fn status_of_all_workers(&self) -> Result<HashMap<String, Liveness>> {
        self.client.status().await
    }

    async fn kill(&self, handle: &WorkerHandle) -> Result<()> {
        self.client.kill(&handle.process_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeClient {
        next_id: Mutex<u32>,
        jobs: Mutex<HashMap<String, Liveness>>,
    }

    #[async_trait]
    impl ClusterClient for FakeClient {
        async fn submit(&self, _name: &str, count: usize, _spec: &RoleSpec) -> Result<Vec<String>> {
            let mut next = self.next_id.lock().unwrap();
            let mut jobs = self.jobs.lock().unwrap();
            Ok((0..count)
                .map(|_| {
                    *next += 1;
                    let id = format!("job{}", *next);
                    jobs.insert(id.clone(), Liveness::Alive);
                    id
                })
                .collect())
        }

        async fn status(&self) -> Result<HashMap<String, Liveness>> {
            Ok(self.jobs.lock().unwrap().clone())
        }

        async fn kill(&self, process_id: &str) -> Result<()> {
            self.jobs
                .lock()
                .unwrap()
                .insert(process_id.to_string(), Liveness::Dead(Some(CauseOfDeath::KilledByUser)));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cluster_meadow_with_fake_client() {
        let meadow = ClusterMeadow::new("farm", Arc::new(FakeClient::default()), 100);
        let spec = RoleSpec::new("longmult", "default").for_analysis(2, "part_multiply");

        let handles = meadow.submit(3, &spec).await.unwrap();
        assert_eq!(handles.len(), 3);
        assert_eq!(meadow.count_running().await.unwrap(), 3);

        meadow.kill(&handles[1]).await.unwrap();
        let status = meadow.status_of_all_workers().await.unwrap();
        assert_eq!(
            status.get(&handles[1].process_id),
            Some(&Liveness::Dead(Some(CauseOfDeath::KilledByUser)))
        );
        assert_eq!(meadow.count_running().await.unwrap(), 2);
        assert_eq!(meadow.meadow_type(), MeadowType::Cluster);
    }

    #[test]
    fn test_render_template() {
        let out = render_template("scancel {process_id} {other}", &[("process_id", "42")]);
        assert_eq!(out, "scancel 42 {other}");
    }

    #[test]
    fn test_parse_status_output() {
        let status = parse_status_output("101 RUNNING\n102 pending\n103 TIMEOUT\n104 COMPLETED\n\n");
        assert_eq!(status.len(), 4);
        assert_eq!(status["101"], Liveness::Alive);
        assert_eq!(status["102"], Liveness::Alive);
        assert_eq!(status["103"], Liveness::Dead(Some(CauseOfDeath::RunLimit)));
        assert_eq!(status["104"], Liveness::Dead(None));
    }

    #[tokio::test]
    async fn test_command_client_runs_templates() {
        let client = CommandClusterClient::new(ClusterCommands {
            submit: "for i in $(seq 1 {count}); do echo {submission_name}.$i; done".to_string(),
            status: "printf '7 RUNNING\\n8 FAILED\\n'".to_string(),
            kill: "test {process_id} = 7".to_string(),
            timeout_ms: 5000,
        });
        let spec = RoleSpec::new("p", "default");

        let ids = client.submit("batch", 2, &spec).await.unwrap();
        assert_eq!(ids, vec!["batch.1".to_string(), "batch.2".to_string()]);

        let status = client.status().await.unwrap();
        assert_eq!(status["7"], Liveness::Alive);
        assert_eq!(status["8"], Liveness::Dead(None));

        assert!(client.kill("7").await.is_ok());
        assert!(matches!(client.kill("9").await, Err(ApiaryError::Meadow(_))));
    }
}
