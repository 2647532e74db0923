//! Dataflow rule evaluation.
//!
//! Turns one `flow(job, branch, payloads)` event into the job batches and
//! accumulator entries the store applies in a single transaction.

use serde_json::{Map, Value};

use crate::domain::{AccuKind, Analysis, AnalysisJob, DataflowTarget, NewJob};
use crate::error::Result;
use crate::params::ParamContainer;
use crate::pipeline::Pipeline;
use crate::store::{AccuEntry, JobBatch};

/// Everything one dataflow event writes.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlowPlan {
    pub batches: Vec<JobBatch>,
    pub accus: Vec<AccuEntry>,
}

impl FlowPlan {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty() && self.accus.is_empty()
    }
}

/// Evaluate every rule leaving `emitter`'s analysis on `branch`.
pub fn plan_flow(pipeline: &Pipeline, emitter: &AnalysisJob, branch: i32, payloads: &[Value]) -> Result<FlowPlan> {
    let source = pipeline.require_analysis_by_id(emitter.analysis_id)?;
    let mut plan = FlowPlan::default();

    for rule in pipeline.rules_for(&source.name, branch) {
        match &rule.target {
            DataflowTarget::Analysis { name, template } => {
                let target = pipeline.require_analysis(name)?;
                let mut fan = Vec::with_capacity(payloads.len());
                for payload in payloads {
                    let input = render_input(pipeline, source, emitter, payload, template.as_ref())?;
                    fan.push(NewJob::new(target.id, input).from_job(emitter.id));
                }

                match &rule.funnel {
                    Some(spec) => {
                        let funnel_analysis = pipeline.require_analysis(&spec.analysis)?;
                        let funnel_input = match &spec.template {
                            Some(template) => render_input(pipeline, source, emitter, &emitter.input, Some(template))?,
                            None => emitter.input.clone(),
                        };
                        plan.batches.push(JobBatch {
                            funnel: Some(
                                NewJob::new(funnel_analysis.id, funnel_input)
                                    .semaphored_by(emitter.semaphored_by)
                                    .from_job(emitter.id),
                            ),
                            fan,
                        });
                    }
                    None => {
                        // Nested work keeps the enclosing fan-in waiting.
                        let fan = fan
                            .into_iter()
                            .map(|job| job.semaphored_by(emitter.semaphored_by))
                            .collect();
                        plan.batches.push(JobBatch { funnel: None, fan });
                    }
                }
            }
            DataflowTarget::Accumulator { name, accu } => {
                let Some(funnel) = emitter.semaphored_by else {
                    tracing::warn!(
                        job_id = emitter.id,
                        accumulator = %name,
                        "Job is not semaphored, dropping accumulated value"
                    );
                    continue;
                };
                for payload in payloads {
                    let Some(value) = payload.get(name) else {
                        tracing::debug!(job_id = emitter.id, accumulator = %name, "Payload has no value for accumulator");
                        continue;
                    };
                    let key = match accu {
                        AccuKind::Map { key_param } => {
                            let mut params = job_params(pipeline, source, emitter, payload);
                            Some(key_string(&params.required(key_param)?))
                        }
                        _ => None,
                    };
                    plan.accus.push(AccuEntry {
                        funnel_job_id: funnel,
                        name: name.clone(),
                        kind: accu_kind_name(accu).to_string(),
                        key,
                        value: value.clone(),
                    });
                }
            }
        }
    }

    Ok(plan)
}

/// Parameters visible to a rule: pipeline < analysis < emitter input < payload.
fn job_params(pipeline: &Pipeline, source: &Analysis, emitter: &AnalysisJob, payload: &Value) -> ParamContainer {
    ParamContainer::from_layers([&pipeline.params, &source.parameters, &emitter.input, payload])
}

fn render_input(
    pipeline: &Pipeline,
    source: &Analysis,
    emitter: &AnalysisJob,
    payload: &Value,
    template: Option<&Value>,
) -> Result<Value> {
    match template {
        None => Ok(payload.clone()),
        Some(template) => {
            let mut params = job_params(pipeline, source, emitter, payload);
            Ok(params.substitute(template)?)
        }
    }
}

pub fn accu_kind_name(accu: &AccuKind) -> &'static str {
    match accu {
        AccuKind::Scalar => "scalar",
        AccuKind::List => "list",
        AccuKind::Map { .. } => "map",
    }
}

fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fold stored accumulator entries into fan-in parameters, in arrival order.
pub fn fold_accu(entries: &[AccuEntry]) -> Map<String, Value> {
    let mut out = Map::new();
    for entry in entries {
        match entry.kind.as_str() {
            "list" => {
                let slot = out.entry(entry.name.clone()).or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(items) = slot {
                    items.push(entry.value.clone());
                }
            }
            "map" => {
                let slot = out
                    .entry(entry.name.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let (Value::Object(map), Some(key)) = (slot, &entry.key) {
                    map.insert(key.clone(), entry.value.clone());
                }
            }
            _ => {
                out.insert(entry.name.clone(), entry.value.clone());
            }
        }
    }
    out
}
