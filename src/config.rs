use apiary::meadow::ClusterCommands;
use apiary::queen::{BeekeeperConfig, QueenConfig};
use apiary::scheduler::{PriorityPolicy, Scheduler};
use apiary::stats::StatsConfig;
use apiary::worker::WorkerConfig;
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub stats: StatsSection,
    pub worker: WorkerSection,
    pub meadows: MeadowsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Hive database; None = one per pipeline under the local data directory
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub tick_interval_ms: u64,
    pub priority_policy: String,
    pub max_passes: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 50,
            tick_interval_ms: 1000,
            priority_policy: PriorityPolicy::default().as_str().to_string(),
            max_passes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSection {
    pub max_staleness_ms: u64,
    pub drift_tolerance: u64,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            max_staleness_ms: 2000,
            drift_tolerance: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub job_limit: Option<u32>,
    pub life_span_secs: Option<u64>,
    pub can_respecialize: bool,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            job_limit: None,
            life_span_secs: Some(3600),
            can_respecialize: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeadowsConfig {
    /// Meadow analyses run on unless they name one
    pub default: String,
    pub local: LocalMeadowConfig,
    pub cluster: Option<ClusterMeadowConfig>,
}

impl Default for MeadowsConfig {
    fn default() -> Self {
        Self {
            default: "local".to_string(),
            local: LocalMeadowConfig::default(),
            cluster: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalMeadowConfig {
    /// None = number of CPUs
    pub max_workers: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterMeadowConfig {
    pub name: String,
    pub queue_limit: usize,
    #[serde(flatten)]
    pub commands: ClusterCommands,
}

impl Default for ClusterMeadowConfig {
    fn default() -> Self {
        Self {
            name: "cluster".to_string(),
            queue_limit: 100,
            commands: ClusterCommands::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            stats: StatsSection::default(),
            worker: WorkerSection::default(),
            meadows: MeadowsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn priority_policy(&self) -> Result<PriorityPolicy> {
        PriorityPolicy::parse(&self.scheduler.priority_policy)
            .ok_or_else(|| eyre!("Unknown priority policy: {}", self.scheduler.priority_policy))
    }

    pub fn queen_config(&self) -> Result<QueenConfig> {
        let scheduler = Scheduler::new()
            .with_max_workers(self.scheduler.max_workers)
            .with_priority(self.priority_policy()?);
        let stats = StatsConfig::new(
            Duration::from_millis(self.stats.max_staleness_ms),
            self.stats.drift_tolerance,
        );
        let mut beekeeper = BeekeeperConfig::new(Duration::from_millis(self.scheduler.tick_interval_ms));
        beekeeper.max_passes = self.scheduler.max_passes;
        Ok(QueenConfig {
            scheduler,
            stats,
            beekeeper,
        })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            job_limit: self.worker.job_limit,
            life_span: self.worker.life_span_secs.map(Duration::from_secs),
            can_respecialize: self.worker.can_respecialize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scheduler.max_workers, 50);
        assert_eq!(config.meadows.default, "local");
        assert!(config.meadows.cluster.is_none());
        assert_eq!(config.priority_policy().unwrap(), PriorityPolicy::FewestWorkersFirst);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("apiary.yml");
        fs::write(
            &path,
            "scheduler:\n  max_workers: 8\n  priority_policy: creation_order\nworker:\n  job_limit: 5\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.max_workers, 8);
        assert_eq!(config.scheduler.tick_interval_ms, 1000);
        assert_eq!(config.worker.job_limit, Some(5));
        assert!(config.worker.can_respecialize);

        let queen = config.queen_config().unwrap();
        assert_eq!(queen.scheduler.max_workers(), 8);
        assert_eq!(queen.scheduler.policy(), PriorityPolicy::CreationOrder);
        assert_eq!(config.worker_config().job_limit, Some(5));
    }

    #[test]
    fn test_cluster_section() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("apiary.yml");
        fs::write(
            &path,
            "meadows:\n  default: farm\n  cluster:\n    name: farm\n    queue_limit: 7\n    kill: \"qdel {process_id}\"\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        let cluster = config.meadows.cluster.unwrap();
        assert_eq!(cluster.name, "farm");
        assert_eq!(cluster.queue_limit, 7);
        assert_eq!(cluster.commands.kill, "qdel {process_id}");
        assert_eq!(cluster.commands.status, ClusterCommands::default().status);
    }

    #[test]
    fn test_unknown_priority_policy() {
        let mut config = Config::default();
        config.scheduler.priority_policy = "loudest_first".to_string();
        assert!(config.queen_config().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(Config::load(Some(&PathBuf::from("/nonexistent/apiary.yml"))).is_err());
    }
}
