use fleetbench_core::scenario::Scenario;
use fleetbench_core::{StageEvent, StageObserver, StageResult};
use serde::Serialize;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use super::OutputFormatter;
use crate::run::{RunPlan, RunRecord};

pub(crate) struct JsonOutput;

impl OutputFormatter for JsonOutput {
    fn print_header(&self, scenario_path: &Path, scenario: &Scenario, plans: &[RunPlan]) {
        emit_json_line(&JsonPlanLine {
            kind: "plan",
            scenario: scenario_path.display().to_string(),
            stages: scenario.stage_count(),
            runs: plans
                .iter()
                .map(|p| JsonPlannedRun {
                    configuration: &p.configuration.name,
                    cluster_size: p.cluster_size,
                })
                .collect(),
        });
    }

    fn observer(&self, run: &str) -> Option<StageObserver> {
        let run = run.to_string();
        Some(Arc::new(move |event| {
            emit_json_line(&build_stage_line(&run, event));
        }))
    }

    fn print_run(&self, record: &RunRecord) -> anyhow::Result<()> {
        emit_json_line(&JsonRunLine {
            kind: "run",
            record,
        });
        Ok(())
    }

    fn print_summary(&self, records: &[RunRecord]) -> anyhow::Result<()> {
        emit_json_line(&JsonSummaryLine {
            kind: "summary",
            runs: records.len(),
            failed: records.iter().filter(|r| !r.success).count(),
            advisory_failures: records.iter().map(|r| r.advisory_failures.len()).sum(),
        });
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonPlanLine<'a> {
    kind: &'static str,
    scenario: String,
    stages: usize,
    runs: Vec<JsonPlannedRun<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonPlannedRun<'a> {
    configuration: &'a str,
    cluster_size: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JsonStageLine<'a> {
    pub kind: &'static str,
    pub run: &'a str,
    pub position: &'a str,
    pub stage: &'a str,
    pub result: StageResult,
    pub elapsed_ms: f64,
    pub advisory: bool,
}

#[derive(Debug, Serialize)]
struct JsonRunLine<'a> {
    kind: &'static str,
    #[serde(flatten)]
    record: &'a RunRecord,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonSummaryLine {
    kind: &'static str,
    runs: usize,
    failed: usize,
    advisory_failures: usize,
}

fn build_stage_line<'a>(run: &'a str, event: &'a StageEvent) -> JsonStageLine<'a> {
    JsonStageLine {
        kind: "stage",
        run,
        position: &event.position,
        stage: &event.stage,
        result: event.result,
        elapsed_ms: event.elapsed.as_secs_f64() * 1000.0,
        advisory: event.advisory,
    }
}

fn emit_json_line<T: Serialize>(line: &T) {
    let mut out = std::io::stdout().lock();
    if serde_json::to_writer(&mut out, line).is_ok() {
        let _ = writeln!(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stage_line_has_kind_and_camel_case_fields() {
        let event = StageEvent {
            position: "1[2].0".to_string(),
            stage: "basic-operations".to_string(),
            result: StageResult::Failure,
            elapsed: Duration::from_millis(250),
            advisory: true,
        };
        let line = build_stage_line("default@2", &event);

        let v: serde_json::Value = serde_json::to_value(&line).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(v["kind"], "stage");
        assert_eq!(v["run"], "default@2");
        assert_eq!(v["position"], "1[2].0");
        assert_eq!(v["result"], "FAILURE");
        assert_eq!(v["elapsedMs"], 250.0);
        assert_eq!(v["advisory"], true);
    }
}
