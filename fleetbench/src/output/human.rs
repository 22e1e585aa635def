use std::path::Path;
use std::sync::Arc;

use fleetbench_core::scenario::Scenario;
use fleetbench_core::{StageObserver, StageResult};

mod format;
mod progress;
mod summary;

use format::format_nanos;
use progress::HumanProgress;
use summary::{render_run, render_totals};

use super::OutputFormatter;
use crate::run::{RunPlan, RunRecord};

pub(crate) struct HumanReadableOutput {
    progress: Arc<HumanProgress>,
}

impl HumanReadableOutput {
    pub(crate) fn new() -> Self {
        Self {
            progress: Arc::new(HumanProgress::new()),
        }
    }
}

impl OutputFormatter for HumanReadableOutput {
    fn print_header(&self, scenario_path: &Path, scenario: &Scenario, plans: &[RunPlan]) {
        println!(
            "scenario: {} ({} stages)",
            scenario_path.display(),
            scenario.stage_count()
        );
        for plan in plans {
            println!(
                "run: {} configuration={} slaves={}",
                plan.label(),
                plan.configuration.name,
                plan.cluster_size
            );
        }
        if !plans.is_empty() {
            println!();
        }
    }

    fn observer(&self, run: &str) -> Option<StageObserver> {
        let progress = self.progress.clone();
        let run = run.to_string();

        Some(Arc::new(move |event| {
            let mut message = format!(
                "{} {} {} in {}",
                event.position,
                event.stage,
                event.result,
                format_nanos(event.elapsed.as_nanos() as f64)
            );
            if event.advisory && event.result != StageResult::Success {
                message.push_str(" (advisory)");
            }
            progress.update(&run, message);
        }))
    }

    fn print_run(&self, record: &RunRecord) -> anyhow::Result<()> {
        self.progress.finish(&record.label());
        print!("{}", render_run(record));
        Ok(())
    }

    fn print_summary(&self, records: &[RunRecord]) -> anyhow::Result<()> {
        print!("{}", render_totals(records));

        let failures: Vec<_> = records.iter().filter(|r| !r.success).collect();
        if !failures.is_empty() {
            eprintln!("runs failed:");
            for r in failures {
                if let Some(failure) = &r.failure {
                    eprintln!("  {}: {failure}", r.label());
                }
            }
        }

        Ok(())
    }
}
