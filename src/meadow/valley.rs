//! Registry of meadows available to a Queen.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::warn;

use crate::domain::{Analysis, WorkerRecord};
use crate::error::{ApiaryError, Result};
use crate::meadow::{Liveness, Meadow};

pub struct Valley {
    meadows: HashMap<String, Arc<dyn Meadow>>,
    default_meadow: String,
}

impl Valley {
    pub fn new(default_meadow: Arc<dyn Meadow>) -> Self {
        let name = default_meadow.name().to_string();
        Self {
            meadows: HashMap::from([(name.clone(), default_meadow)]),
            default_meadow: name,
        }
    }

    pub fn with_meadow(mut self, meadow: Arc<dyn Meadow>) -> Self {
        self.meadows.insert(meadow.name().to_string(), meadow);
        self
    }

    pub fn default_meadow(&self) -> &Arc<dyn Meadow> {
        &self.meadows[&self.default_meadow]
    }

    pub fn default_meadow_name(&self) -> &str {
        &self.default_meadow
    }

    pub fn meadow(&self, name: &str) -> Option<&Arc<dyn Meadow>> {
        self.meadows.get(name)
    }

    /// Meadow names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.meadows.keys().cloned().collect();
        names.sort();
        names
    }

    /// The meadow an analysis runs on: its own, else the default.
    pub fn meadow_for(&self, analysis: &Analysis) -> Result<&Arc<dyn Meadow>> {
        match &analysis.meadow {
            Some(name) => self.meadows.get(name).ok_or_else(|| {
                ApiaryError::Meadow(format!("analysis '{}' wants unknown meadow '{name}'", analysis.name))
            }),
            None => Ok(self.default_meadow()),
        }
    }

    /// Name of the meadow an analysis is routed to.
    pub fn meadow_name_for(&self, analysis: &Analysis) -> Result<String> {
        Ok(self.meadow_for(analysis)?.name().to_string())
    }

    /// The meadow that launched a worker.
    pub fn meadow_for_worker(&self, worker: &WorkerRecord) -> Result<&Arc<dyn Meadow>> {
        self.meadows
            .get(&worker.meadow)
            .ok_or_else(|| ApiaryError::Meadow(format!("worker {} runs on unknown meadow '{}'", worker.id, worker.meadow)))
    }

    /// Room left per meadow given live worker counts from the store.
    pub fn headroom(&self, live_by_meadow: &HashMap<String, usize>) -> HashMap<String, usize> {
        self.meadows
            .iter()
            .map(|(name, meadow)| {
                let live = live_by_meadow.get(name).copied().unwrap_or(0);
                (name.clone(), meadow.max_workers().saturating_sub(live))
            })
            .collect()
    }

    /// Tell `meadow` to drop finished processes. Failures are only logged.
    pub async fn forget(&self, meadow: &str, process_ids: &[String]) {
        if process_ids.is_empty() {
            return;
        }
        let Some(m) = self.meadows.get(meadow) else {
            return;
        };
        if let Err(e) = m.forget(process_ids).await {
            warn!(meadow, error = %e, "Could not forget finished workers");
        }
    }

    /// Ask every meadow for its workers' liveness. A meadow that cannot answer is
    /// left out, so its workers are not mistaken for dead.
    pub async fn status_of_all_workers(&self) -> HashMap<String, HashMap<String, Liveness>> {
        let polls = self
            .meadows
            .iter()
            .map(|(name, meadow)| async move { (name, meadow.status_of_all_workers().await) });

        let mut all = HashMap::new();
        for (name, result) in join_all(polls).await {
            match result {
                Ok(status) => {
                    all.insert(name.clone(), status);
                }
                Err(e) => warn!(meadow = %name, error = %e, "Meadow status unavailable, skipping sweep"),
            }
        }
        all
    }
}
