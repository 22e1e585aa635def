//! `analyze-test`: picks the best iteration (or value) of a recorded test.

use fleetbench_metrics::{MetricsError, StatisticKind, Statistics};
use fleetbench_value::Value;
use serde::Serialize;

use crate::properties::{Properties, PropertyError};
use crate::report::{Iteration, Report};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum ThreadGrouping {
    GroupAll,
    GroupBySlave,
    GroupByThread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum IterationSelection {
    EachIteration,
    AllIterations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum AnalysisType {
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum ResultType {
    /// Index of the winning iteration.
    Iteration,
    /// The winning statistic value.
    Value,
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error("invalid statistic: {0}")]
    Statistic(MetricsError),

    #[error("`all-iterations` has no single iteration to report; use result-type `value`")]
    AllIterationsByIteration,

    #[error("test `{0}` has no recorded results")]
    NoSuchTest(String),

    #[error("no `{statistic}` values for operation `{operation}` in test `{test}`")]
    NoCandidates {
        test: String,
        operation: String,
        statistic: String,
    },

    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzeTest {
    pub test: String,
    pub operation: String,
    pub statistic: StatisticKind,
    pub thread_grouping: ThreadGrouping,
    pub iteration_selection: IterationSelection,
    pub analysis_type: AnalysisType,
    pub result_type: ResultType,
    pub store_result_to: Option<String>,
    pub report_result: Option<String>,
}

const KNOWN: &[&str] = &[
    "test-name",
    "operation",
    "statistics-type",
    "thread-grouping",
    "iteration-selection",
    "analysis-type",
    "result-type",
    "store-result-to",
    "report-result",
];

/// One value the analysis can choose from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub iteration: Option<usize>,
    pub value: f64,
}

impl AnalyzeTest {
    pub fn from_properties(props: &Properties) -> Result<Self, AnalysisError> {
        props.reject_unknown(KNOWN)?;

        let statistic = props
            .require_string("statistics-type")?
            .parse::<StatisticKind>()
            .map_err(AnalysisError::Statistic)?;
        let iteration_selection = props
            .parsed("iteration-selection", "each-iteration or all-iterations")?
            .unwrap_or(IterationSelection::EachIteration);
        let result_type = props
            .parsed("result-type", "iteration or value")?
            .unwrap_or(ResultType::Iteration);
        if iteration_selection == IterationSelection::AllIterations
            && result_type == ResultType::Iteration
        {
            return Err(AnalysisError::AllIterationsByIteration);
        }

        Ok(Self {
            test: props.require_string("test-name")?,
            operation: props.require_string("operation")?,
            statistic,
            thread_grouping: props
                .parsed(
                    "thread-grouping",
                    "group-all, group-by-slave or group-by-thread",
                )?
                .unwrap_or(ThreadGrouping::GroupAll),
            iteration_selection,
            analysis_type: props
                .parsed("analysis-type", "max or min")?
                .unwrap_or(AnalysisType::Max),
            result_type,
            store_result_to: props.string("store-result-to")?,
            report_result: props.string("report-result")?,
        })
    }

    pub fn evaluate(&self, report: &Report) -> Result<Value, AnalysisError> {
        let test = report
            .test(&self.test)
            .ok_or_else(|| AnalysisError::NoSuchTest(self.test.clone()))?;

        let candidates = match self.iteration_selection {
            IterationSelection::EachIteration => {
                let mut out = Vec::new();
                for (idx, iteration) in test.iterations().iter().enumerate() {
                    for stats in self.group(std::slice::from_ref(iteration))? {
                        if let Some(value) = stats.value(&self.operation, self.statistic) {
                            out.push(Candidate {
                                iteration: Some(idx),
                                value,
                            });
                        }
                    }
                }
                out
            }
            IterationSelection::AllIterations => self
                .group(test.iterations())?
                .into_iter()
                .filter_map(|s| s.value(&self.operation, self.statistic))
                .map(|value| Candidate {
                    iteration: None,
                    value,
                })
                .collect(),
        };

        let best = select(&candidates, self.analysis_type).ok_or_else(|| {
            AnalysisError::NoCandidates {
                test: self.test.clone(),
                operation: self.operation.clone(),
                statistic: self.statistic.to_string(),
            }
        })?;

        tracing::debug!(
            test = %self.test,
            candidates = candidates.len(),
            best = best.value,
            iteration = ?best.iteration,
            "analysis finished"
        );

        match (self.result_type, best.iteration) {
            (ResultType::Iteration, Some(idx)) => Ok(Value::from(idx)),
            (ResultType::Iteration, None) => Err(AnalysisError::AllIterationsByIteration),
            (ResultType::Value, _) => Ok(Value::F64(best.value)),
        }
    }

    /// Merges the statistics of `iterations` according to the thread grouping.
    fn group(&self, iterations: &[Iteration]) -> Result<Vec<Statistics>, MetricsError> {
        let per_slave = || {
            let mut slaves: Vec<usize> = iterations
                .iter()
                .flat_map(|it| it.slaves().keys().copied())
                .collect();
            slaves.sort_unstable();
            slaves.dedup();
            slaves
        };

        let groups: Vec<Vec<&Statistics>> = match self.thread_grouping {
            ThreadGrouping::GroupAll => vec![
                iterations
                    .iter()
                    .flat_map(|it| it.slaves().values().flatten())
                    .collect(),
            ],
            ThreadGrouping::GroupBySlave => per_slave()
                .into_iter()
                .map(|slave| {
                    iterations
                        .iter()
                        .filter_map(|it| it.slaves().get(&slave))
                        .flatten()
                        .collect()
                })
                .collect(),
            ThreadGrouping::GroupByThread => {
                let mut groups = Vec::new();
                for slave in per_slave() {
                    let threads = iterations
                        .iter()
                        .filter_map(|it| it.slaves().get(&slave).map(Vec::len))
                        .max()
                        .unwrap_or(0);
                    for thread in 0..threads {
                        groups.push(
                            iterations
                                .iter()
                                .filter_map(|it| it.slaves().get(&slave)?.get(thread))
                                .collect(),
                        );
                    }
                }
                groups
            }
        };

        let mut out = Vec::with_capacity(groups.len());
        for group in groups {
            if let Some(merged) = Statistics::merge_all(group)? {
                out.push(merged);
            }
        }
        Ok(out)
    }
}

/// Best candidate by `analysis`; ties keep the earliest candidate.
pub fn select(candidates: &[Candidate], analysis: AnalysisType) -> Option<Candidate> {
    let mut best: Option<Candidate> = None;
    for c in candidates {
        let better = match (best, analysis) {
            (None, _) => true,
            (Some(b), AnalysisType::Max) => c.value > b.value,
            (Some(b), AnalysisType::Min) => c.value < b.value,
        };
        if better {
            best = Some(*c);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (*k, Value::parse_literal(v)))
            .collect()
    }

    fn stats_with_requests(n: u64) -> Statistics {
        let mut s = Statistics::default().with_window(0, 1_000);
        for _ in 0..n {
            s.register_request(1_000, "GET");
        }
        s
    }

    /// One slave, one thread; iteration `i` records `counts[i]` requests over one second.
    fn report_with(counts: &[u64]) -> Report {
        let mut report = Report::default();
        let test = report.test_mut("load");
        for n in counts {
            let it = test.start_iteration(None);
            test.add_statistics(it, 0, vec![stats_with_requests(*n)]);
        }
        report
    }

    fn analysis(extra: &[(&str, &str)]) -> AnalyzeTest {
        let mut pairs = vec![
            ("test-name", "load"),
            ("operation", "GET"),
            ("statisticsType", "throughput"),
        ];
        pairs.extend_from_slice(extra);
        AnalyzeTest::from_properties(&props(&pairs)).unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn max_throughput_picks_best_iteration() {
        let a = analysis(&[]);
        let out = a
            .evaluate(&report_with(&[100, 250, 180]))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(out, Value::I64(1));
    }

    #[test]
    fn ties_keep_the_first_candidate() {
        let a = analysis(&[("analysis-type", "min")]);
        let out = a
            .evaluate(&report_with(&[200, 50, 50, 300]))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(out, Value::I64(1));
    }

    #[test]
    fn all_iterations_reports_a_value() {
        let a = analysis(&[
            ("iteration-selection", "all-iterations"),
            ("result-type", "value"),
            ("statistics-type", "requests"),
        ]);
        let out = a
            .evaluate(&report_with(&[1, 2, 3]))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(out, Value::F64(6.0));
    }

    #[test]
    fn all_iterations_by_iteration_is_rejected() {
        let p = props(&[
            ("test-name", "load"),
            ("operation", "GET"),
            ("statistics-type", "throughput"),
            ("iteration-selection", "ALL-ITERATIONS"),
        ]);
        assert!(matches!(
            AnalyzeTest::from_properties(&p),
            Err(AnalysisError::AllIterationsByIteration)
        ));
    }

    #[test]
    fn group_by_thread_compares_individual_threads() {
        let mut report = Report::default();
        let test = report.test_mut("load");
        let it = test.start_iteration(None);
        test.add_statistics(it, 0, vec![stats_with_requests(5), stats_with_requests(9)]);
        test.add_statistics(it, 1, vec![stats_with_requests(7)]);

        let a = analysis(&[
            ("thread-grouping", "group-by-thread"),
            ("result-type", "value"),
            ("statistics-type", "requests"),
        ]);
        let out = a.evaluate(&report).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(out, Value::F64(9.0));

        let a = analysis(&[
            ("thread-grouping", "group-by-slave"),
            ("result-type", "value"),
            ("statistics-type", "requests"),
        ]);
        let out = a.evaluate(&report).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(out, Value::F64(14.0));
    }

    #[test]
    fn missing_test_or_values_fail() {
        let a = analysis(&[]);
        assert!(matches!(
            a.evaluate(&Report::default()),
            Err(AnalysisError::NoSuchTest(_))
        ));

        let mut report = Report::default();
        report.test_mut("load").start_iteration(None);
        assert!(matches!(
            a.evaluate(&report),
            Err(AnalysisError::NoCandidates { .. })
        ));
    }

    #[test]
    fn select_handles_empty_input() {
        assert_eq!(select(&[], AnalysisType::Max), None);
    }
}
