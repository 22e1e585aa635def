use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Serialize;

use crate::run::RunRecord;
use crate::scenario_yaml::ReportYaml;

/// Receives every run of one invocation once all runs are done.
pub(crate) trait ReportSink {
    fn describe(&self) -> String;
    fn write(&self, records: &[RunRecord]) -> anyhow::Result<()>;
}

/// Sinks declared in the scenario file plus `--report-out`, without duplicates.
pub(crate) fn sinks(declared: &[ReportYaml], report_out: Option<&Path>) -> Vec<Box<dyn ReportSink>> {
    let mut paths: Vec<PathBuf> = declared
        .iter()
        .map(|r| match r {
            ReportYaml::Json { path } => path.clone(),
        })
        .collect();
    if let Some(path) = report_out
        && !paths.iter().any(|p| p == path)
    {
        paths.push(path.to_path_buf());
    }

    paths
        .into_iter()
        .map(|path| Box::new(JsonFileSink { path }) as Box<dyn ReportSink>)
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonDocument<'a> {
    runs: &'a [RunRecord],
}

/// Writes all runs as one pretty-printed JSON document.
pub(crate) struct JsonFileSink {
    path: PathBuf,
}

impl ReportSink for JsonFileSink {
    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }

    fn write(&self, records: &[RunRecord]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let file = File::create(&self.path)
            .with_context(|| format!("failed to create report {}", self.path.display()))?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, &JsonDocument { runs: records })
            .with_context(|| format!("failed to write report {}", self.path.display()))?;
        out.write_all(b"\n")?;
        out.flush()
            .with_context(|| format!("failed to flush report {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_out_is_not_duplicated() {
        let declared = vec![ReportYaml::Json {
            path: PathBuf::from("out/report.json"),
        }];

        let same = sinks(&declared, Some(Path::new("out/report.json")));
        assert_eq!(same.len(), 1);

        let extra = sinks(&declared, Some(Path::new("other.json")));
        let described: Vec<String> = extra.iter().map(|s| s.describe()).collect();
        assert_eq!(described, vec!["json:out/report.json", "json:other.json"]);
    }
}
