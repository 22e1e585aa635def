use std::fmt::Write as _;
use std::time::Duration;

use fleetbench_core::report::{Iteration, Test};

use super::format::{format_nanos_opt, format_rate};
use crate::run::RunRecord;

pub(crate) fn render_run(record: &RunRecord) -> String {
    let mut out = String::new();

    let status = if record.success { "ok" } else { "FAILED" };
    writeln!(
        &mut out,
        "run: {} {status} (elapsed {}, {} dispatches)",
        record.label(),
        humantime::format_duration(Duration::from_millis(record.elapsed_ms)),
        record.dispatches
    )
    .ok();

    if record.report.tests().is_empty() {
        out.push_str("  no measurements\n");
    }
    for test in record.report.tests() {
        render_test(test, &mut out);
    }

    if !record.report.results().is_empty() {
        out.push_str("  results:\n");
        for (name, value) in record.report.results() {
            writeln!(&mut out, "    {name}: {value}").ok();
        }
    }

    if !record.advisory_failures.is_empty() {
        writeln!(
            &mut out,
            "  advisory failures: {}",
            record.advisory_failures.len()
        )
        .ok();
        for a in &record.advisory_failures {
            writeln!(&mut out, "    {} {} {}", a.position, a.stage, a.result).ok();
            for detail in &a.details {
                writeln!(&mut out, "      {detail}").ok();
            }
        }
    }

    if let Some(failure) = &record.failure {
        writeln!(&mut out, "  failure: {failure}").ok();
    }

    out.push('\n');
    out
}

fn render_test(test: &Test, out: &mut String) {
    writeln!(out, "  test: {}", test.name()).ok();

    for (idx, iteration) in test.iterations().iter().enumerate() {
        render_iteration(idx, iteration, out);
    }

    for (name, value) in test.results() {
        writeln!(out, "    result {name}: {value}").ok();
    }
}

fn render_iteration(idx: usize, iteration: &Iteration, out: &mut String) {
    match iteration.name() {
        Some(name) => writeln!(out, "    iteration {idx} ({name})").ok(),
        None => writeln!(out, "    iteration {idx}").ok(),
    };

    let merged = match iteration.merged() {
        Ok(Some(stats)) => stats,
        Ok(None) => {
            out.push_str("      no statistics\n");
            return;
        }
        Err(err) => {
            writeln!(out, "      cannot merge statistics: {err}").ok();
            return;
        }
    };

    for (operation, stats) in merged.operations() {
        let summary = stats.summary();
        let p50 = summary.as_ref().and_then(|s| s.p50);
        let p99 = summary.as_ref().and_then(|s| s.p99);
        writeln!(
            out,
            "      {operation}: requests={} errors={} mean={} p50={} p99={} max={} throughput={}",
            stats.requests(),
            stats.errors(),
            format_nanos_opt(stats.mean_response_time()),
            format_nanos_opt(p50),
            format_nanos_opt(p99),
            format_nanos_opt(Some(stats.response_time_max() as f64)),
            format_rate(merged.throughput(operation)),
        )
        .ok();
    }
}

pub(crate) fn render_totals(records: &[RunRecord]) -> String {
    let failed = records.iter().filter(|r| !r.success).count();
    let advisory: usize = records.iter().map(|r| r.advisory_failures.len()).sum();
    format!(
        "summary: {} run(s), {} passed, {failed} failed, {advisory} advisory failure(s)\n",
        records.len(),
        records.len() - failed,
    )
}
