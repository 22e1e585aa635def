//! Walks a [`Scenario`] depth-first, resolving expressions against the variable environment and
//! dispatching every stage through the [`Master`].
//!
//! The interpreter is the only writer of the environment and the [`Report`]; both change strictly
//! between dispatches.

use std::collections::BTreeMap;
use std::fmt;
use std::iter::StepBy;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleetbench_value::Value;
use futures::future::BoxFuture;
use serde::Serialize;

use crate::analysis::AnalyzeTest;
use crate::env::VariableEnvironment;
use crate::error::{Error, Result};
use crate::expr;
use crate::master::Master;
use crate::properties::{Properties, value_to_duration};
use crate::protocol::StageResult;
use crate::report::Report;
use crate::scenario::{ANALYZE_TEST, RepeatNode, ScaleNode, Scenario, ScenarioNode, StageNode};
use crate::stages::Stage;
use crate::transport::MemberLink;

pub const REPEAT_COUNTER: &str = "repeat.counter";
pub const CLUSTER_SIZE: &str = "cluster.size";

/// Called after every dispatched stage and every analysis.
pub type StageObserver = Arc<dyn Fn(&StageEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct StageEvent {
    pub position: String,
    pub stage: String,
    pub result: StageResult,
    pub elapsed: Duration,
    pub advisory: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "result", rename_all = "kebab-case")]
pub enum FailureKind {
    /// The scenario itself is wrong: bad expression, property or stage name.
    Configuration,
    /// A dispatched stage reduced to FAILURE or EXCEPTION.
    Stage(StageResult),
    /// `analyze-test` found nothing to analyze.
    Analysis,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => f.write_str("configuration error"),
            Self::Stage(result) => write!(f, "stage {result}"),
            Self::Analysis => f.write_str("analysis error"),
        }
    }
}

/// Why a run stopped early.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("`{stage}` at {position}: {kind}: {message}")]
pub struct RunFailure {
    /// Dotted node path; loop iterations appear in brackets, e.g. `2[1].0`.
    pub position: String,
    pub stage: String,
    #[serde(flatten)]
    pub kind: FailureKind,
    pub message: String,
}

/// An advisory stage that failed without stopping the run.
#[derive(Debug, Clone, Serialize)]
pub struct AdvisoryFailure {
    pub position: String,
    pub stage: String,
    pub result: StageResult,
    pub details: Vec<String>,
}

#[derive(Debug)]
pub struct RunOutcome {
    /// Everything recorded up to the end of the run, including a failed one.
    pub report: Report,
    pub env: VariableEnvironment,
    pub failure: Option<RunFailure>,
    pub dispatches: usize,
    pub advisory_failures: Vec<AdvisoryFailure>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    index: usize,
    iteration: Option<i64>,
}

/// State carried through one run.
#[derive(Debug)]
struct RunContext {
    env: VariableEnvironment,
    report: Report,
    active: Vec<usize>,
    path: Vec<Frame>,
    dispatches: usize,
    advisory_failures: Vec<AdvisoryFailure>,
}

pub struct Interpreter<'m, L> {
    master: &'m mut Master<L>,
    ctx: RunContext,
    observer: Option<StageObserver>,
}

impl<'m, L: MemberLink> Interpreter<'m, L> {
    pub fn new(master: &'m mut Master<L>, report: Report) -> Self {
        let active = master.slave_indices();
        let mut env = VariableEnvironment::new();
        env.set(CLUSTER_SIZE, Value::from(active.len()));
        Self {
            master,
            ctx: RunContext {
                env,
                report,
                active,
                path: Vec::new(),
                dispatches: 0,
                advisory_failures: Vec::new(),
            },
            observer: None,
        }
    }

    /// Pre-binds variables, e.g. from `--define`.
    #[must_use]
    pub fn with_variables(mut self, vars: impl IntoIterator<Item = (String, Value)>) -> Self {
        for (name, value) in vars {
            self.ctx.env.set(name, value);
        }
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: StageObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Runs the scenario to completion or to the first non-advisory failure. After a failure
    /// every slave is asked to stop its service.
    pub async fn run(mut self, scenario: &Scenario) -> RunOutcome {
        let failure = match scenario.validate() {
            Err(errors) => Some(RunFailure {
                position: errors
                    .first()
                    .map(|e| e.position.clone())
                    .unwrap_or_default(),
                stage: "scenario".to_string(),
                kind: FailureKind::Configuration,
                message: errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            }),
            Ok(()) => self.run_block(&scenario.nodes).await.err(),
        };

        if let Some(failure) = &failure {
            tracing::error!(
                stage = %failure.stage,
                position = %failure.position,
                kind = %failure.kind,
                message = %failure.message,
                "scenario aborted"
            );
            if self.ctx.dispatches > 0 {
                self.master.cleanup().await;
            }
        } else {
            tracing::info!(dispatches = self.ctx.dispatches, "scenario finished");
        }

        RunOutcome {
            report: self.ctx.report,
            env: self.ctx.env,
            failure,
            dispatches: self.ctx.dispatches,
            advisory_failures: self.ctx.advisory_failures,
        }
    }

    fn run_block<'a>(
        &'a mut self,
        nodes: &'a [ScenarioNode],
    ) -> BoxFuture<'a, std::result::Result<(), RunFailure>> {
        Box::pin(async move {
            for (index, node) in nodes.iter().enumerate() {
                self.ctx.path.push(Frame {
                    index,
                    iteration: None,
                });
                let res = self.run_node(node).await;
                self.ctx.path.pop();
                res?;
            }
            Ok(())
        })
    }

    async fn run_node(&mut self, node: &ScenarioNode) -> std::result::Result<(), RunFailure> {
        match node {
            ScenarioNode::Stage(stage) => self.run_stage(stage).await,
            ScenarioNode::Repeat(repeat) => self.run_repeat(repeat).await,
            ScenarioNode::Scale(scale) => self.run_scale(scale).await,
            ScenarioNode::Define { name, value } => {
                let value = self.resolve(value).map_err(|e| self.configuration("define", e))?;
                tracing::debug!(%name, %value, "variable defined");
                self.ctx.env.set(name.clone(), value);
                Ok(())
            }
            ScenarioNode::AnalyzeTest { properties } => self.run_analysis(properties),
        }
    }

    async fn run_stage(&mut self, node: &StageNode) -> std::result::Result<(), RunFailure> {
        let name = node.stage.as_str();
        let (stage, props, targets, timeout) = self
            .prepare_stage(node)
            .map_err(|e| self.configuration(name, e))?;

        let outcome = self
            .master
            .dispatch(name, props.into_inner(), &targets, timeout)
            .await;
        self.ctx.dispatches += 1;

        if outcome.result == StageResult::Success {
            stage.record(&outcome.acks, &mut self.ctx.report);
        }
        self.notify(name, outcome.result, outcome.elapsed, node.advisory);
        if !outcome.result.is_error() {
            return Ok(());
        }

        let details: Vec<String> = outcome
            .failed_acks()
            .map(|a| format!("slave {}: {}", a.slave_index, a.detail().unwrap_or_default()))
            .collect();
        if node.advisory {
            tracing::warn!(
                stage = name,
                result = %outcome.result,
                details = ?details,
                "advisory stage failed, continuing"
            );
            self.ctx.advisory_failures.push(AdvisoryFailure {
                position: self.position(),
                stage: name.to_string(),
                result: outcome.result,
                details,
            });
            return Ok(());
        }

        Err(RunFailure {
            position: self.position(),
            stage: name.to_string(),
            kind: FailureKind::Stage(outcome.result),
            message: details.join("; "),
        })
    }

    /// Everything that can be checked before a stage leaves the master.
    fn prepare_stage(
        &self,
        node: &StageNode,
    ) -> Result<(Stage, Properties, Vec<usize>, Option<Duration>)> {
        let props = self.resolve_properties(&node.properties)?;
        let stage = Stage::parse(&node.stage, &props)?;

        let targets = match &node.slaves {
            None => self.ctx.active.clone(),
            Some(raw) => self.explicit_targets(raw)?,
        };
        let timeout = match &node.timeout {
            None => None,
            Some(raw) => {
                let value = self.resolve(raw)?;
                Some(value_to_duration(&value).ok_or_else(|| {
                    Error::bound("timeout", format!("`{value}` is not a duration"))
                })?)
            }
        };
        Ok((stage, props, targets, timeout))
    }

    fn explicit_targets(&self, raw: &Value) -> Result<Vec<usize>> {
        let value = self.resolve(raw)?;
        let items = match &value {
            Value::List(items) => items.clone(),
            single => vec![single.clone()],
        };
        let known = self.master.slave_indices();
        items
            .iter()
            .map(|item| {
                let idx = item
                    .as_u64()
                    .ok_or_else(|| Error::bound("slaves", format!("`{item}` is not a slave index")))?;
                usize::try_from(idx)
                    .ok()
                    .filter(|i| known.contains(i))
                    .ok_or(Error::UnknownSlave(idx))
            })
            .collect()
    }

    async fn run_repeat(&mut self, node: &RepeatNode) -> std::result::Result<(), RunFailure> {
        let counters = self
            .repeat_counters(node)
            .map_err(|e| self.configuration("repeat", e))?;
        let named = node
            .name
            .as_ref()
            .map(|name| format!("repeat.{name}.counter"));

        for counter in counters {
            self.set_iteration(Some(counter));
            let previous = self.ctx.env.set(REPEAT_COUNTER, Value::I64(counter));
            let previous_named = named
                .as_ref()
                .map(|n| self.ctx.env.set(n.clone(), Value::I64(counter)));

            let res = self.run_block(&node.body).await;

            if let (Some(name), Some(prev)) = (&named, previous_named) {
                self.ctx.env.restore(name, prev);
            }
            self.ctx.env.restore(REPEAT_COUNTER, previous);
            res?;
        }
        self.set_iteration(None);
        Ok(())
    }

    fn repeat_counters(&self, node: &RepeatNode) -> Result<StepBy<RangeInclusive<i64>>> {
        if let Some(times) = self.resolve_int(node.times.as_ref(), "times")? {
            if times < 0 {
                return Err(Error::bound("times", format!("{times} is negative")));
            }
            return Ok((0..=times - 1).step_by(1));
        }

        let from = self.resolve_int(node.from.as_ref(), "from")?.unwrap_or(0);
        let to = self
            .resolve_int(node.to.as_ref(), "to")?
            .ok_or_else(|| Error::bound("to", "missing"))?;
        let inc = self.resolve_step(node.inc.as_ref())?;
        Ok((from..=to).step_by(inc))
    }

    async fn run_scale(&mut self, node: &ScaleNode) -> std::result::Result<(), RunFailure> {
        let sizes = self
            .scale_sizes(node)
            .map_err(|e| self.configuration("scale", e))?;
        let all = self.master.slave_indices();
        let active = std::mem::take(&mut self.ctx.active);

        let mut res = Ok(());
        for size in sizes {
            let Ok(size) = usize::try_from(size) else {
                continue;
            };
            self.set_iteration(Some(size as i64));
            self.ctx.active = all[..size].to_vec();
            let previous = self.ctx.env.set(CLUSTER_SIZE, Value::from(size));
            tracing::info!(size, "scaling active cluster");

            res = self.run_block(&node.body).await;
            self.ctx.env.restore(CLUSTER_SIZE, previous);
            if res.is_err() {
                break;
            }
        }

        self.ctx.active = active;
        self.set_iteration(None);
        res
    }

    fn scale_sizes(&self, node: &ScaleNode) -> Result<StepBy<RangeInclusive<i64>>> {
        let cluster = self.master.cluster_size() as i64;
        let from = self.resolve_int(node.from.as_ref(), "from")?.unwrap_or(1);
        let to = self.resolve_int(node.to.as_ref(), "to")?.unwrap_or(cluster);
        if from < 1 {
            return Err(Error::bound("from", "cluster size must be at least 1"));
        }
        if to > cluster {
            return Err(Error::bound(
                "to",
                format!("{to} exceeds the cluster of {cluster} slaves"),
            ));
        }
        let inc = self.resolve_step(node.inc.as_ref())?;
        Ok((from..=to).step_by(inc))
    }

    fn run_analysis(&mut self, raw: &BTreeMap<String, Value>) -> std::result::Result<(), RunFailure> {
        let started = Instant::now();
        let analysis = self
            .resolve_properties(raw)
            .and_then(|props| Ok(AnalyzeTest::from_properties(&props)?))
            .map_err(|e| self.configuration(ANALYZE_TEST, e))?;

        let value = analysis
            .evaluate(&self.ctx.report)
            .map_err(|e| RunFailure {
                position: self.position(),
                stage: ANALYZE_TEST.to_string(),
                kind: FailureKind::Analysis,
                message: e.to_string(),
            })?;
        tracing::info!(
            test = %analysis.test,
            operation = %analysis.operation,
            %value,
            "analysis finished"
        );

        if let Some(var) = &analysis.store_result_to {
            self.ctx.env.set(var.clone(), value.clone());
        }
        if let Some(name) = &analysis.report_result {
            self.ctx
                .report
                .test_mut(&analysis.test)
                .add_result(name.clone(), value.clone());
            self.ctx.report.add_result(name.clone(), value);
        }
        self.notify(ANALYZE_TEST, StageResult::Success, started.elapsed(), false);
        Ok(())
    }

    fn resolve(&self, raw: &Value) -> Result<Value> {
        Ok(expr::evaluate_value(raw, &self.ctx.env)?)
    }

    fn resolve_properties(&self, raw: &BTreeMap<String, Value>) -> Result<Properties> {
        raw.iter()
            .map(|(k, v)| self.resolve(v).map(|v| (k.as_str(), v)))
            .collect()
    }

    fn resolve_int(&self, raw: Option<&Value>, field: &'static str) -> Result<Option<i64>> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        let value = self.resolve(raw)?;
        value
            .as_i64()
            .map(Some)
            .ok_or_else(|| Error::bound(field, format!("`{value}` is not an integer")))
    }

    fn resolve_step(&self, raw: Option<&Value>) -> Result<usize> {
        let inc = self.resolve_int(raw, "inc")?.unwrap_or(1);
        usize::try_from(inc)
            .ok()
            .filter(|i| *i > 0)
            .ok_or_else(|| Error::bound("inc", format!("{inc} is not a positive step")))
    }

    fn set_iteration(&mut self, iteration: Option<i64>) {
        if let Some(frame) = self.ctx.path.last_mut() {
            frame.iteration = iteration;
        }
    }

    fn position(&self) -> String {
        self.ctx
            .path
            .iter()
            .map(|f| match f.iteration {
                Some(i) => format!("{}[{i}]", f.index),
                None => f.index.to_string(),
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    fn configuration(&self, stage: &str, err: Error) -> RunFailure {
        RunFailure {
            position: self.position(),
            stage: stage.to_string(),
            kind: FailureKind::Configuration,
            message: err.to_string(),
        }
    }

    fn notify(&self, stage: &str, result: StageResult, elapsed: Duration, advisory: bool) {
        if let Some(observer) = &self.observer {
            observer(&StageEvent {
                position: self.position(),
                stage: stage.to_string(),
                result,
                elapsed,
                advisory,
            });
        }
    }
}
