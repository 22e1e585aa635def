use crate::cli::OutputFormat;
use crate::run::{RunPlan, RunRecord};
use fleetbench_core::StageObserver;
use fleetbench_core::scenario::Scenario;
use std::path::Path;

mod human;
mod json;

pub(crate) trait OutputFormatter: Send + Sync {
    fn print_header(&self, scenario_path: &Path, scenario: &Scenario, plans: &[RunPlan]);
    /// Stage-level progress for the run labelled `run`.
    fn observer(&self, run: &str) -> Option<StageObserver>;
    fn print_run(&self, record: &RunRecord) -> anyhow::Result<()>;
    fn print_summary(&self, records: &[RunRecord]) -> anyhow::Result<()>;
}

pub(crate) fn formatter(format: OutputFormat) -> Box<dyn OutputFormatter> {
    match format {
        OutputFormat::HumanReadable => Box::new(human::HumanReadableOutput::new()),
        OutputFormat::Json => Box::new(json::JsonOutput),
    }
}
