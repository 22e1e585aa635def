use std::time::{Duration, Instant};

use fleetbench_core::scenario::Scenario;
use fleetbench_core::{
    AdvisoryFailure, FailureKind, Interpreter, LocalCluster, Report, RunFailure, RunOutcome,
};
use fleetbench_testservice::InMemoryGrid;
use fleetbench_value::Value;
use serde::Serialize;

use crate::cli::{RunArgs, ValidateArgs};
use crate::exit_codes::ExitCode;
use crate::output::{self, OutputFormatter};
use crate::report_sink;
use crate::run_error::RunError;
use crate::scenario_yaml::{Benchmark, Configuration, load_benchmark};

const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// One (configuration, cluster size) pair of the run matrix.
#[derive(Debug, Clone)]
pub(crate) struct RunPlan {
    pub configuration: Configuration,
    pub cluster_size: usize,
}

impl RunPlan {
    pub(crate) fn label(&self) -> String {
        format!("{}@{}", self.configuration.name, self.cluster_size)
    }
}

/// What one scenario run left behind; this is what sinks and formatters consume.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunRecord {
    pub configuration: String,
    pub cluster_size: usize,
    pub success: bool,
    pub elapsed_ms: u64,
    pub dispatches: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub advisory_failures: Vec<AdvisoryFailure>,
    pub report: Report,
}

impl RunRecord {
    fn new(plan: &RunPlan, outcome: RunOutcome, elapsed: Duration) -> Self {
        Self {
            configuration: plan.configuration.name.clone(),
            cluster_size: plan.cluster_size,
            success: outcome.is_success(),
            elapsed_ms: elapsed.as_millis() as u64,
            dispatches: outcome.dispatches,
            failure: outcome.failure,
            advisory_failures: outcome.advisory_failures,
            report: outcome.report,
        }
    }

    pub(crate) fn label(&self) -> String {
        format!("{}@{}", self.configuration, self.cluster_size)
    }
}

fn check_scenario(scenario: &Scenario) -> Result<(), RunError> {
    scenario.validate().map_err(|errors| {
        let lines = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n  ");
        RunError::InvalidInput(anyhow::anyhow!("invalid scenario:\n  {lines}"))
    })
}

pub(crate) async fn validate(args: ValidateArgs) -> Result<ExitCode, RunError> {
    let bench = load_benchmark(&args.scenario)
        .await
        .map_err(RunError::InvalidInput)?;
    check_scenario(&bench.scenario)?;

    println!(
        "{}: ok ({} stages, {} configuration(s), cluster sizes {:?})",
        args.scenario.display(),
        bench.scenario.stage_count(),
        bench.configurations.len(),
        bench.clusters
    );
    Ok(ExitCode::Success)
}

pub(crate) async fn run(args: RunArgs) -> Result<ExitCode, RunError> {
    let bench = load_benchmark(&args.scenario)
        .await
        .map_err(RunError::InvalidInput)?;
    check_scenario(&bench.scenario)?;

    let clusters = match args.slaves {
        Some(0) => {
            return Err(RunError::InvalidInput(anyhow::anyhow!(
                "--slaves must be at least 1"
            )));
        }
        Some(n) => vec![n],
        None => bench.clusters.clone(),
    };
    let stage_timeout = args
        .stage_timeout
        .or(bench.stage_timeout)
        .unwrap_or(DEFAULT_STAGE_TIMEOUT);

    let sinks = report_sink::sinks(&bench.reports, args.report_out.as_deref());
    let output = output::formatter(args.output);

    let plans: Vec<RunPlan> = bench
        .configurations
        .iter()
        .flat_map(|configuration| {
            clusters.iter().map(|&cluster_size| RunPlan {
                configuration: configuration.clone(),
                cluster_size,
            })
        })
        .collect();

    output.print_header(&args.scenario, &bench.scenario, &plans);

    let mut records = Vec::with_capacity(plans.len());
    for plan in &plans {
        let record = run_once(&bench, plan, &args.define, stage_timeout, output.as_ref()).await;
        output.print_run(&record).map_err(RunError::RuntimeError)?;
        records.push(record);
    }
    output.print_summary(&records).map_err(RunError::RuntimeError)?;

    for sink in &sinks {
        sink.write(&records).map_err(RunError::RuntimeError)?;
        tracing::info!(sink = %sink.describe(), runs = records.len(), "reports written");
    }

    let configuration_failed = records.iter().any(|r| {
        r.failure
            .as_ref()
            .is_some_and(|f| f.kind == FailureKind::Configuration)
    });
    let stage_failed = records.iter().any(|r| !r.success);
    Ok(ExitCode::from_runs(configuration_failed, stage_failed))
}

async fn run_once(
    bench: &Benchmark,
    plan: &RunPlan,
    defines: &[(String, Value)],
    stage_timeout: Duration,
    output: &dyn OutputFormatter,
) -> RunRecord {
    let label = plan.label();
    tracing::info!(run = %label, ?stage_timeout, "run starting");

    let grid = InMemoryGrid::new();
    let mut cluster = LocalCluster::spawn(plan.cluster_size, stage_timeout, |_| {
        grid.member(plan.configuration.member.clone()).registry()
    });

    // --define wins over configuration properties of the same name.
    let variables = plan
        .configuration
        .variables
        .iter()
        .chain(defines)
        .cloned();
    let mut interpreter = Interpreter::new(
        cluster.master(),
        Report::new(&plan.configuration.name, plan.cluster_size),
    )
    .with_variables(variables);
    if let Some(observer) = output.observer(&label) {
        interpreter = interpreter.with_observer(observer);
    }

    let started = Instant::now();
    let outcome = interpreter.run(&bench.scenario).await;
    let elapsed = started.elapsed();
    cluster.shutdown().await;

    match &outcome.failure {
        None => tracing::info!(run = %label, dispatches = outcome.dispatches, ?elapsed, "run finished"),
        Some(failure) => tracing::warn!(run = %label, error = %failure, "run failed"),
    }

    RunRecord::new(plan, outcome, elapsed)
}
