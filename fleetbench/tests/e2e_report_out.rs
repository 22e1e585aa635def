use std::path::Path;
use std::process::Command;

use anyhow::Context as _;

fn status_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[test]
fn json_output_and_report_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir().context("create temp dir")?;
    let report_path = dir.path().join("nested").join("report.json");
    let scenario = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/scenarios/load.yaml");

    let out = Command::new(env!("CARGO_BIN_EXE_fleetbench"))
        .arg("run")
        .arg(&scenario)
        .arg("--slaves")
        .arg("3")
        .arg("--define")
        .arg("requests=5")
        .arg("--output")
        .arg("json")
        .arg("--report-out")
        .arg(&report_path)
        .env("RUST_LOG", "warn")
        .output()
        .context("run fleetbench binary")?;

    anyhow::ensure!(
        status_code(out.status) == 0,
        "expected exit code 0, got {}\nstdout:\n{}\nstderr:\n{}",
        status_code(out.status),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );

    let stdout = String::from_utf8(out.stdout).context("stdout is utf-8")?;
    let lines = stdout
        .lines()
        .map(serde_json::from_str::<serde_json::Value>)
        .collect::<Result<Vec<_>, _>>()
        .context("every stdout line is JSON")?;
    let kinds: Vec<&str> = lines.iter().filter_map(|l| l["kind"].as_str()).collect();
    anyhow::ensure!(kinds.len() == lines.len(), "line without kind: {stdout}");
    anyhow::ensure!(kinds.first() == Some(&"plan"), "kinds: {kinds:?}");
    anyhow::ensure!(kinds.last() == Some(&"summary"), "kinds: {kinds:?}");
    // service-start, check-cluster, 2x basic-operations, analyze-test, sleep, service-stop
    let stages = kinds.iter().filter(|k| **k == "stage").count();
    anyhow::ensure!(stages == 7, "expected 7 stage lines, got {stages}: {kinds:?}");

    let raw = std::fs::read_to_string(&report_path).context("read report file")?;
    let doc: serde_json::Value = serde_json::from_str(&raw).context("parse report file")?;
    let run = &doc["runs"][0];
    anyhow::ensure!(run["configuration"] == "grid", "report: {raw}");
    anyhow::ensure!(run["clusterSize"] == 3, "report: {raw}");
    anyhow::ensure!(run["success"] == true, "report: {raw}");
    anyhow::ensure!(run["report"]["results"]["busiest"] == 1, "report: {raw}");

    let iterations = run["report"]["tests"][0]["iterations"]
        .as_array()
        .context("iterations array")?;
    anyhow::ensure!(iterations.len() == 2, "report: {raw}");
    anyhow::ensure!(iterations[1]["name"] == "round-1", "report: {raw}");
    Ok(())
}
