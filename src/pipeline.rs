//! Static pipeline definition.
//!
//! A pipeline is plain data: analyses, dataflow and control rules, resource
//! classes and seed jobs. It is loaded from YAML or built in code, validated once
//! and then shared read-only (`Arc<Pipeline>`) by the Queen and every worker.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    Analysis, AnalysisCtrlRule, BRANCH_ANY_FAILURE, DEFAULT_RESOURCE_CLASS, DataflowRule, DataflowTarget,
    ResourceClass,
};
use crate::error::{ApiaryError, Result};
use crate::store::HiveStore;

const PIPELINE_META_KEY: &str = "pipeline";

/// A job created when the pipeline is seeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeedJob {
    pub analysis: String,
    #[serde(default = "empty_object")]
    pub input: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pipeline {
    pub name: String,

    /// Pipeline-wide parameters, below analysis parameters
    #[serde(default = "empty_object")]
    pub params: Value,

    pub analyses: Vec<Analysis>,

    #[serde(default)]
    pub dataflow_rules: Vec<DataflowRule>,

    #[serde(default)]
    pub ctrl_rules: Vec<AnalysisCtrlRule>,

    #[serde(default)]
    pub resource_classes: Vec<ResourceClass>,

    #[serde(default)]
    pub seeds: Vec<SeedJob>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: empty_object(),
            analyses: Vec::new(),
            dataflow_rules: Vec::new(),
            ctrl_rules: Vec::new(),
            resource_classes: Vec::new(),
            seeds: Vec::new(),
        }
    }

    /// Parse and validate a YAML definition.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let pipeline: Self = serde_yaml::from_str(yaml)?;
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let pipeline = Self::from_yaml(&content)?;
        log::info!("Loaded pipeline '{}' from: {}", pipeline.name, path.display());
        Ok(pipeline)
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_analysis(mut self, analysis: Analysis) -> Self {
        self.analyses.push(analysis);
        self
    }

    pub fn with_rule(mut self, rule: DataflowRule) -> Self {
        self.dataflow_rules.push(rule);
        self
    }

    pub fn with_ctrl_rule(mut self, rule: AnalysisCtrlRule) -> Self {
        self.ctrl_rules.push(rule);
        self
    }

    pub fn with_resource_class(mut self, class: ResourceClass) -> Self {
        self.resource_classes.push(class);
        self
    }

    pub fn with_seed(mut self, analysis: impl Into<String>, input: Value) -> Self {
        self.seeds.push(SeedJob {
            analysis: analysis.into(),
            input,
        });
        self
    }

    /// Check names and references. Run once before the pipeline is installed.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ApiaryError::Config("pipeline name is empty".to_string()));
        }

        let mut names = HashSet::new();
        for analysis in &self.analyses {
            if analysis.name.trim().is_empty() {
                return Err(ApiaryError::Config("analysis with an empty name".to_string()));
            }
            if !names.insert(analysis.name.as_str()) {
                return Err(ApiaryError::Config(format!("duplicate analysis '{}'", analysis.name)));
            }
            if !analysis.parameters.is_object() {
                return Err(ApiaryError::Config(format!(
                    "parameters of analysis '{}' must be a mapping",
                    analysis.name
                )));
            }
        }

        let known = |name: &str| -> Result<()> {
            if names.contains(name) {
                Ok(())
            } else {
                Err(ApiaryError::AnalysisNotFound(name.to_string()))
            }
        };

        for rule in &self.dataflow_rules {
            known(&rule.from_analysis)?;
            if let DataflowTarget::Analysis { name, .. } = &rule.target {
                known(name)?;
            }
            if let Some(funnel) = &rule.funnel {
                known(&funnel.analysis)?;
                if matches!(rule.target, DataflowTarget::Accumulator { .. }) {
                    return Err(ApiaryError::Config(format!(
                        "rule from '{}' branch {} cannot both accumulate and open a funnel",
                        rule.from_analysis, rule.branch
                    )));
                }
            }
        }
        for rule in &self.ctrl_rules {
            known(&rule.condition_analysis)?;
            known(&rule.ctrled_analysis)?;
        }
        for seed in &self.seeds {
            known(&seed.analysis)?;
        }
        Ok(())
    }

    /// Store every analysis and return a copy carrying the store-assigned ids.
    pub fn install(mut self, store: &dyn HiveStore) -> Result<Self> {
        self.validate()?;
        for analysis in &mut self.analyses {
            analysis.id = store.store_analysis(analysis)?;
        }
        self.analyses.sort_by_key(|a| a.id);
        store.set_meta(PIPELINE_META_KEY, &serde_json::to_string(&self)?)?;
        tracing::info!(pipeline = %self.name, analyses = self.analyses.len(), "Installed pipeline");
        Ok(self)
    }

    /// The pipeline last installed into `store`, with its ids.
    pub fn from_store(store: &dyn HiveStore) -> Result<Self> {
        let json = store
            .get_meta(PIPELINE_META_KEY)?
            .ok_or_else(|| ApiaryError::Config("no pipeline installed in this hive".to_string()))?;
        let installed: Self = serde_json::from_str(&json)?;
        installed.refreshed(store)
    }

    /// A copy carrying the analyses as currently stored, with capacities
    /// changed since install.
    pub fn refreshed(&self, store: &dyn HiveStore) -> Result<Self> {
        let mut pipeline = self.clone();
        for analysis in &mut pipeline.analyses {
            if let Some(current) = store.get_analysis(analysis.id)? {
                *analysis = current;
            }
        }
        Ok(pipeline)
    }

    pub fn analysis(&self, name: &str) -> Option<&Analysis> {
        self.analyses.iter().find(|a| a.name == name)
    }

    pub fn analysis_by_id(&self, id: i64) -> Option<&Analysis> {
        self.analyses.iter().find(|a| a.id == id)
    }

    pub fn require_analysis(&self, name: &str) -> Result<&Analysis> {
        self.analysis(name)
            .ok_or_else(|| ApiaryError::AnalysisNotFound(name.to_string()))
    }

    pub fn require_analysis_by_id(&self, id: i64) -> Result<&Analysis> {
        self.analysis_by_id(id)
            .ok_or_else(|| ApiaryError::AnalysisNotFound(id.to_string()))
    }

    /// Rules leaving `analysis` on `branch`, in definition order.
    pub fn rules_for<'a>(&'a self, analysis: &'a str, branch: i32) -> impl Iterator<Item = &'a DataflowRule> + 'a {
        self.dataflow_rules.iter().filter(move |r| r.matches(analysis, branch))
    }

    /// Failure branch a permanently failing job of `analysis` should take, if any.
    ///
    /// A specific branch (run limit, memory limit) wins over the catch-all.
    pub fn failure_branch(&self, analysis: &str, specific: Option<i32>) -> Option<i32> {
        if let Some(branch) = specific
            && self.rules_for(analysis, branch).next().is_some()
        {
            return Some(branch);
        }
        self.rules_for(analysis, BRANCH_ANY_FAILURE)
            .next()
            .map(|_| BRANCH_ANY_FAILURE)
    }

    /// Control rules gating `analysis`.
    pub fn ctrl_rules_for<'a>(&'a self, analysis: &'a str) -> impl Iterator<Item = &'a AnalysisCtrlRule> + 'a {
        self.ctrl_rules.iter().filter(move |r| r.ctrled_analysis == analysis)
    }

    /// Resource class by name; unknown names get an unlimited class.
    pub fn resource_class(&self, name: &str) -> ResourceClass {
        self.resource_classes
            .iter()
            .find(|rc| rc.name == name)
            .cloned()
            .unwrap_or_else(|| ResourceClass::new(name))
    }

    /// Names of every resource class in use, configured or not.
    pub fn resource_class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resource_classes.iter().map(|rc| rc.name.clone()).collect();
        for analysis in &self.analyses {
            if !names.contains(&analysis.resource_class) {
                names.push(analysis.resource_class.clone());
            }
        }
        if names.is_empty() {
            names.push(DEFAULT_RESOURCE_CLASS.to_string());
        }
        names
    }
}
