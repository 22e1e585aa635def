use clap::{Args, Parser, Subcommand};
use fleetbench_value::Value;
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("duration cannot be empty (expected e.g. 10s, 250ms, 1m)".to_string());
    }

    let number_end = s
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map_or(s.len(), |(idx, _)| idx);

    if number_end == 0 {
        return Err(format!(
            "invalid duration '{s}' (expected e.g. 10s, 250ms, 1m)"
        ));
    }

    let (number_str, unit_str) = s.split_at(number_end);
    let value: u64 = number_str
        .parse()
        .map_err(|_| format!("invalid duration '{s}' (expected e.g. 10s, 250ms, 1m)"))?;

    let unit = unit_str.trim();
    match unit {
        "" | "s" | "sec" | "secs" | "second" | "seconds" => Ok(Duration::from_secs(value)),
        "ms" | "msec" | "msecs" | "millisecond" | "milliseconds" => {
            Ok(Duration::from_millis(value))
        }
        "us" | "µs" | "usec" | "usecs" | "microsecond" | "microseconds" => {
            Ok(Duration::from_micros(value))
        }
        "ns" | "nsec" | "nsecs" | "nanosecond" | "nanoseconds" => Ok(Duration::from_nanos(value)),
        "m" | "min" | "mins" | "minute" | "minutes" => {
            let secs = value
                .checked_mul(60)
                .ok_or_else(|| format!("duration '{s}' is too large"))?;
            Ok(Duration::from_secs(secs))
        }
        "h" | "hr" | "hrs" | "hour" | "hours" => {
            let secs = value
                .checked_mul(60)
                .and_then(|v| v.checked_mul(60))
                .ok_or_else(|| format!("duration '{s}' is too large"))?;
            Ok(Duration::from_secs(secs))
        }
        _ => Err(format!(
            "invalid duration '{s}' (expected e.g. 10s, 250ms, 1m)"
        )),
    }
}

/// Splits `KEY=VALUE`; the value is read the way scenario literals are (integers, floats, booleans).
fn parse_define(input: &str) -> Result<(String, Value), String> {
    let (key, value) = input
        .split_once('=')
        .ok_or_else(|| format!("invalid define '{input}' (expected KEY=VALUE)"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid define '{input}' (empty key)"));
    }
    Ok((key.to_string(), Value::parse_literal(value)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Progress on stderr, summary tables on stdout.
    HumanReadable,
    /// Emit stage events and reports as JSON lines (NDJSON) to stdout.
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "fleetbench",
    author,
    version,
    about = "Distributed benchmark orchestration for in-memory data grids",
    long_about = "fleetbench drives a master and a set of slaves through a benchmark scenario.\n\nA scenario file lists stages (service-start, basic-operations, continuous-query, analyze-test, ...) grouped by repeat and scale loops. Property values may reference variables (`${name}`, `${name:default}`) and arithmetic expressions (`#{...}`).\n\nThe scenario runs once per configuration and cluster size; every run produces its own report.",
    after_help = "Examples:\n  fleetbench validate bench.yaml\n  fleetbench run bench.yaml --slaves 4\n  fleetbench run bench.yaml --define threads=8 --output json\n  fleetbench run bench.yaml --report-out report.json"
)]
pub struct Cli {
    /// Log filter (e.g. info, debug, fleetbench_core=trace); overrides RUST_LOG
    #[arg(long, global = true, value_name = "FILTER")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a benchmark scenario
    #[command(
        long_about = "Run a scenario on an in-process cluster once per configuration and cluster size.\n\nCLI flags override values from the scenario file."
    )]
    Run(RunArgs),

    /// Parse and validate a scenario without running it
    Validate(ValidateArgs),
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Path to the scenario (.yaml)
    pub scenario: PathBuf,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the scenario (.yaml)
    pub scenario: PathBuf,

    /// Run with exactly this many slaves (otherwise use `clusters` from the file, or 1)
    #[arg(long)]
    pub slaves: Option<usize>,

    /// Default per-stage ack timeout (e.g. 30s, 500ms, 2m)
    #[arg(long, value_parser = parse_duration)]
    pub stage_timeout: Option<Duration>,

    /// Pre-bind a scenario variable (repeatable, KEY=VALUE).
    /// Overrides configuration variables of the same name.
    #[arg(long = "define", value_name = "KEY=VALUE", value_parser = parse_define)]
    pub define: Vec<(String, Value)>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::HumanReadable)]
    pub output: OutputFormat,

    /// Also write all reports as JSON to this file
    #[arg(long, value_name = "PATH")]
    pub report_out: Option<PathBuf>,
}
