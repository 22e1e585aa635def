use std::collections::BTreeMap;

use fleetbench_metrics::{MetricsError, Statistics};
use fleetbench_value::Value;
use serde::Serialize;

/// Everything one scenario run produced: named tests with their measured iterations plus
/// report-level results written by analysis stages.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub configuration: String,
    pub cluster_size: usize,
    tests: Vec<Test>,
    results: BTreeMap<String, Value>,
}

impl Report {
    pub fn new(configuration: impl Into<String>, cluster_size: usize) -> Self {
        Self {
            configuration: configuration.into(),
            cluster_size,
            ..Self::default()
        }
    }

    pub fn test(&self, name: &str) -> Option<&Test> {
        self.tests.iter().find(|t| t.name == name)
    }

    /// Returns the test named `name`, creating it on first use.
    pub fn test_mut(&mut self, name: &str) -> &mut Test {
        let idx = match self.tests.iter().position(|t| t.name == name) {
            Some(idx) => idx,
            None => {
                self.tests.push(Test::new(name));
                self.tests.len() - 1
            }
        };
        &mut self.tests[idx]
    }

    pub fn tests(&self) -> &[Test] {
        &self.tests
    }

    pub fn add_result(&mut self, name: impl Into<String>, value: Value) {
        self.results.insert(name.into(), value);
    }

    pub fn results(&self) -> &BTreeMap<String, Value> {
        &self.results
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Test {
    name: String,
    iterations: Vec<Iteration>,
    results: BTreeMap<String, Value>,
}

impl Test {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            iterations: Vec::new(),
            results: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn iterations(&self) -> &[Iteration] {
        &self.iterations
    }

    /// Opens a new iteration and returns its index.
    pub fn start_iteration(&mut self, name: Option<String>) -> usize {
        self.iterations.push(Iteration {
            name,
            slaves: BTreeMap::new(),
        });
        self.iterations.len() - 1
    }

    /// Stores one slave's per-thread statistics in iteration `iteration`, creating intermediate
    /// iterations as needed.
    pub fn add_statistics(&mut self, iteration: usize, slave_index: usize, stats: Vec<Statistics>) {
        while self.iterations.len() <= iteration {
            self.start_iteration(None);
        }
        self.iterations[iteration]
            .slaves
            .entry(slave_index)
            .or_default()
            .extend(stats);
    }

    pub fn add_result(&mut self, name: impl Into<String>, value: Value) {
        self.results.insert(name.into(), value);
    }

    pub fn results(&self) -> &BTreeMap<String, Value> {
        &self.results
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Iteration {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    slaves: BTreeMap<usize, Vec<Statistics>>,
}

impl Iteration {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Per-slave statistics lists, one entry per reporting thread.
    pub fn slaves(&self) -> &BTreeMap<usize, Vec<Statistics>> {
        &self.slaves
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.values().all(Vec::is_empty)
    }

    pub fn merged(&self) -> Result<Option<Statistics>, MetricsError> {
        Statistics::merge_all(self.slaves.values().flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tests_are_created_lazily_and_keep_order() {
        let mut report = Report::new("default", 2);
        report.test_mut("b");
        report.test_mut("a");
        report.test_mut("b");

        let names: Vec<_> = report.tests().iter().map(Test::name).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert!(report.test("c").is_none());
    }

    #[test]
    fn statistics_fill_missing_iterations() {
        let mut report = Report::default();
        let test = report.test_mut("load");
        test.add_statistics(2, 1, vec![Statistics::default()]);
        test.add_statistics(2, 1, vec![Statistics::default()]);

        let test = report
            .test("load")
            .unwrap_or_else(|| panic!("test must exist"));
        assert_eq!(test.iterations().len(), 3);
        assert!(test.iterations()[0].is_empty());
        assert_eq!(test.iterations()[2].slaves()[&1].len(), 2);
    }

    #[test]
    fn merged_iteration_combines_slaves() {
        let mut a = Statistics::default().with_window(0, 1_000);
        a.register_request(10, "GET");
        let mut b = Statistics::default().with_window(500, 2_000);
        b.register_request(20, "GET");

        let mut report = Report::default();
        let test = report.test_mut("t");
        let it = test.start_iteration(Some("x".to_string()));
        test.add_statistics(it, 0, vec![a]);
        test.add_statistics(it, 1, vec![b]);

        let merged = report.tests()[0].iterations()[0]
            .merged()
            .unwrap_or_else(|e| panic!("{e}"))
            .unwrap_or_else(|| panic!("expected statistics"));
        assert_eq!(merged.operation("GET").map(|o| o.requests()), Some(2));
        assert_eq!(merged.duration().map(|d| d.as_millis()), Some(2_000));
    }
}
