//! The runnable contract and the per-job context handed to it.
//!
//! A job's life inside a runnable is a fixed sequence of steps:
//! `pre_cleanup` (retries only), `fetch_input`, `run`, `write_output`, and
//! finally `post_cleanup`, which runs even when an earlier step failed. Only
//! `run` is mandatory.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::{AnalysisJob, JobId};
use crate::error::{ApiaryError, Result};
use crate::params::{ParamContainer, ParamError};

/// How a runnable step failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// Worth retrying
    #[error("{0}")]
    Recoverable(String),

    /// Retrying cannot help
    #[error("{0}")]
    Fatal(String),

    /// The job failed and the worker must not run anything else
    #[error("{0}")]
    Lethal(String),

    /// Stop here and count the job as done
    #[error("{0}")]
    CompleteEarly(String),
}

impl From<ParamError> for JobError {
    fn from(err: ParamError) -> Self {
        JobError::Fatal(err.to_string())
    }
}

/// Output events of one branch.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchEvent {
    pub branch: i32,
    pub payloads: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    RecoverableFailure(String),
    FatalFailure(String),
}

/// What the worker applies after a job ran.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub branch_events: Vec<BranchEvent>,
    pub outcome: RunOutcome,
    /// Flow the job's input on branch 1 unless the runnable did
    pub autoflow: bool,
    /// The worker dies CONTAMINATED after recording the failure
    pub lethal: bool,
    /// `(message, is_error)` in the order they were raised
    pub messages: Vec<(String, bool)>,
}

impl RunResult {
    pub fn flowed_on(&self, branch: i32) -> bool {
        self.branch_events.iter().any(|e| e.branch == branch)
    }
}

/// Parameters and outputs of the job being run.
#[derive(Debug)]
pub struct JobContext {
    job_id: JobId,
    analysis: String,
    retry_count: u32,
    params: ParamContainer,
    events: Vec<BranchEvent>,
    messages: Vec<(String, bool)>,
    autoflow: bool,
}

impl JobContext {
    pub fn new(job: &AnalysisJob, analysis: impl Into<String>, params: ParamContainer) -> Self {
        Self {
            job_id: job.id,
            analysis: analysis.into(),
            retry_count: job.retry_count,
            params,
            events: Vec::new(),
            messages: Vec::new(),
            autoflow: true,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn analysis(&self) -> &str {
        &self.analysis
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Optional parameter; `None` when undefined.
    pub fn param(&mut self, name: &str) -> std::result::Result<Option<Value>, JobError> {
        Ok(self.params.optional(name)?)
    }

    /// Parameter that must be defined and non-null.
    pub fn param_required(&mut self, name: &str) -> std::result::Result<Value, JobError> {
        Ok(self.params.required(name)?)
    }

    /// Required parameter as a string; numbers are stringified.
    pub fn param_string(&mut self, name: &str) -> std::result::Result<String, JobError> {
        match self.param_required(name)? {
            Value::String(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }

    /// Optional numeric parameter, accepting numeric strings.
    pub fn param_f64(&mut self, name: &str) -> std::result::Result<Option<f64>, JobError> {
        match self.param(name)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| JobError::Fatal(format!("parameter '{name}' is not a number: {s:?}"))),
            Some(other) => Err(JobError::Fatal(format!("parameter '{name}' is not a number: {other}"))),
        }
    }

    pub fn set_param(&mut self, name: &str, value: Value) -> std::result::Result<(), JobError> {
        Ok(self.params.set(name, value)?)
    }

    pub fn param_exists(&self, name: &str) -> bool {
        self.params.has(name)
    }

    /// Emit payloads on a branch. Applied only if the job succeeds.
    pub fn dataflow(&mut self, branch: i32, payloads: Vec<Value>) {
        match self.events.iter_mut().find(|e| e.branch == branch) {
            Some(event) => event.payloads.extend(payloads),
            None => self.events.push(BranchEvent { branch, payloads }),
        }
    }

    pub fn dataflow_one(&mut self, branch: i32, payload: Value) {
        self.dataflow(branch, vec![payload]);
    }

    /// Record a message in the job's log.
    pub fn warning(&mut self, message: impl Into<String>, is_error: bool) {
        self.messages.push((message.into(), is_error));
    }

    pub fn disable_autoflow(&mut self) {
        self.autoflow = false;
    }

    fn finish(self, outcome: RunOutcome, lethal: bool) -> RunResult {
        RunResult {
            branch_events: self.events,
            outcome,
            autoflow: self.autoflow,
            lethal,
            messages: self.messages,
        }
    }
}

/// A stage's code.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Lowest-precedence parameters.
    fn param_defaults(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Runs before `fetch_input` when the job is being retried.
    async fn pre_cleanup(&self, _ctx: &mut JobContext) -> std::result::Result<(), JobError> {
        Ok(())
    }

    async fn fetch_input(&self, _ctx: &mut JobContext) -> std::result::Result<(), JobError> {
        Ok(())
    }

    async fn run(&self, ctx: &mut JobContext) -> std::result::Result<(), JobError>;

    async fn write_output(&self, _ctx: &mut JobContext) -> std::result::Result<(), JobError> {
        Ok(())
    }

    async fn post_cleanup(&self, _ctx: &mut JobContext) -> std::result::Result<(), JobError> {
        Ok(())
    }
}

/// Drive a runnable through one job's steps.
pub async fn execute(runnable: &dyn Runnable, mut ctx: JobContext) -> RunResult {
    let steps = async {
        if ctx.retry_count > 0 {
            runnable.pre_cleanup(&mut ctx).await?;
        }
        runnable.fetch_input(&mut ctx).await?;
        runnable.run(&mut ctx).await?;
        runnable.write_output(&mut ctx).await
    }
    .await;

    let mut failure = match steps {
        Ok(()) => None,
        Err(JobError::CompleteEarly(msg)) => {
            ctx.warning(msg, false);
            None
        }
        Err(e) => Some(e),
    };

    if let Err(e) = runnable.post_cleanup(&mut ctx).await {
        ctx.warning(format!("post_cleanup: {e}"), true);
        if failure.is_none() && !matches!(e, JobError::CompleteEarly(_)) {
            failure = Some(e);
        }
    }

    match failure {
        None => ctx.finish(RunOutcome::Success, false),
        Some(JobError::Recoverable(msg)) => ctx.finish(RunOutcome::RecoverableFailure(msg), false),
        Some(JobError::Fatal(msg)) => ctx.finish(RunOutcome::FatalFailure(msg), false),
        Some(JobError::Lethal(msg)) => ctx.finish(RunOutcome::RecoverableFailure(msg), true),
        Some(JobError::CompleteEarly(_)) => ctx.finish(RunOutcome::Success, false),
    }
}

type RunnableCtor = Arc<dyn Fn() -> Box<dyn Runnable> + Send + Sync>;

/// Runnable constructors by module name.
#[derive(Clone, Default)]
pub struct RunnableRegistry {
    ctors: HashMap<String, RunnableCtor>,
}

impl RunnableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in runnable.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtin::register_all(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, module: impl Into<String>, ctor: F)
    where
        F: Fn() -> Box<dyn Runnable> + Send + Sync + 'static,
    {
        self.ctors.insert(module.into(), Arc::new(ctor));
    }

    pub fn contains(&self, module: &str) -> bool {
        self.ctors.contains_key(module)
    }

    pub fn create(&self, module: &str) -> Result<Box<dyn Runnable>> {
        self.ctors
            .get(module)
            .map(|ctor| ctor())
            .ok_or_else(|| ApiaryError::Config(format!("no runnable registered for module '{module}'")))
    }

    pub fn modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ctors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for RunnableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableRegistry").field("modules", &self.modules()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn job(retry_count: u32) -> AnalysisJob {
        AnalysisJob {
            id: 1,
            analysis_id: 1,
            input: json!({}),
            status: JobStatus::Run,
            retry_count,
            semaphored_by: None,
            semaphore_count: 0,
            prev_job: None,
            worker_id: Some(1),
            available_at: 0,
            last_error: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn ctx(retry_count: u32, params: Value) -> JobContext {
        JobContext::new(&job(retry_count), "test", ParamContainer::from_layers([&params]))
    }

    #[derive(Default)]
    struct Steps {
        pre_cleanups: AtomicU32,
        post_cleanups: AtomicU32,
    }

    #[async_trait]
    impl Runnable for Steps {
        async fn pre_cleanup(&self, _ctx: &mut JobContext) -> std::result::Result<(), JobError> {
            self.pre_cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn run(&self, ctx: &mut JobContext) -> std::result::Result<(), JobError> {
            match ctx.param("mode")?.and_then(|v| v.as_str().map(String::from)).as_deref() {
                Some("recoverable") => Err(JobError::Recoverable("try again".into())),
                Some("fatal") => Err(JobError::Fatal("broken".into())),
                Some("lethal") => Err(JobError::Lethal("poisoned".into())),
                Some("early") => Err(JobError::CompleteEarly("nothing to do".into())),
                _ => {
                    ctx.dataflow_one(2, json!({"x": 1}));
                    ctx.dataflow_one(2, json!({"x": 2}));
                    Ok(())
                }
            }
        }

        async fn post_cleanup(&self, _ctx: &mut JobContext) -> std::result::Result<(), JobError> {
            self.post_cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_success_collects_events() {
        let runnable = Steps::default();
        let result = execute(&runnable, ctx(0, json!({}))).await;
        assert_eq!(result.outcome, RunOutcome::Success);
        assert_eq!(result.branch_events.len(), 1);
        assert_eq!(result.branch_events[0].payloads.len(), 2);
        assert!(result.flowed_on(2));
        assert!(!result.flowed_on(1));
        assert!(result.autoflow);
        assert_eq!(runnable.pre_cleanups.load(Ordering::SeqCst), 0);
        assert_eq!(runnable.post_cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_kinds() {
        let runnable = Steps::default();
        let result = execute(&runnable, ctx(1, json!({"mode": "recoverable"}))).await;
        assert_eq!(result.outcome, RunOutcome::RecoverableFailure("try again".into()));
        assert_eq!(runnable.pre_cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(runnable.post_cleanups.load(Ordering::SeqCst), 1);

        let result = execute(&runnable, ctx(0, json!({"mode": "fatal"}))).await;
        assert_eq!(result.outcome, RunOutcome::FatalFailure("broken".into()));

        let result = execute(&runnable, ctx(0, json!({"mode": "lethal"}))).await;
        assert!(result.lethal);
        assert!(matches!(result.outcome, RunOutcome::RecoverableFailure(_)));
    }

    #[tokio::test]
    async fn test_complete_early_is_success() {
        let result = execute(&Steps::default(), ctx(0, json!({"mode": "early"}))).await;
        assert_eq!(result.outcome, RunOutcome::Success);
        assert_eq!(result.messages, vec![("nothing to do".to_string(), false)]);
    }

    #[test]
    fn test_missing_param_is_fatal() {
        let mut ctx = ctx(0, json!({"a": 1}));
        assert_eq!(ctx.param("missing").unwrap(), None);
        assert!(matches!(ctx.param_required("missing"), Err(JobError::Fatal(_))));
        assert_eq!(ctx.param_string("a").unwrap(), "1");
    }

    #[test]
    fn test_param_f64_accepts_strings() {
        let mut ctx = ctx(0, json!({"n": "2.5", "m": 3, "bad": "x"}));
        assert_eq!(ctx.param_f64("n").unwrap(), Some(2.5));
        assert_eq!(ctx.param_f64("m").unwrap(), Some(3.0));
        assert_eq!(ctx.param_f64("none").unwrap(), None);
        assert!(ctx.param_f64("bad").is_err());
    }

    #[test]
    fn test_registry() {
        let mut registry = RunnableRegistry::new();
        registry.register("Steps", || Box::new(Steps::default()));
        assert!(registry.contains("Steps"));
        assert!(registry.create("Steps").is_ok());
        assert!(matches!(registry.create("Nope"), Err(ApiaryError::Config(_))));
        assert_eq!(registry.modules(), vec!["Steps".to_string()]);
    }
}
