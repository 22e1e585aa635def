use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};
use crate::layout::HistogramLayout;
use crate::metric::{StatisticKind, per_sec};
use crate::operation::OperationStats;

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Immutable per-operation statistics for one measurement window.
///
/// `merge` adds counters, widens the window and merges histograms bucket-wise; it is associative
/// and commutative as long as every operand uses the same [`HistogramLayout`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    layout: Option<HistogramLayout>,
    begin_ms: Option<u64>,
    end_ms: Option<u64>,
    operations: BTreeMap<String, OperationStats>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new(Some(HistogramLayout::default()))
    }
}

impl Statistics {
    pub fn new(layout: Option<HistogramLayout>) -> Self {
        Self {
            layout,
            begin_ms: None,
            end_ms: None,
            operations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_window(mut self, begin_ms: u64, end_ms: u64) -> Self {
        self.begin_ms = Some(begin_ms);
        self.end_ms = Some(end_ms.max(begin_ms));
        self
    }

    pub fn layout(&self) -> Option<HistogramLayout> {
        self.layout
    }

    pub fn begin_ms(&self) -> Option<u64> {
        self.begin_ms
    }

    pub fn end_ms(&self) -> Option<u64> {
        self.end_ms
    }

    /// Length of the measurement window, if both ends are known.
    pub fn duration(&self) -> Option<Duration> {
        match (self.begin_ms, self.end_ms) {
            (Some(b), Some(e)) => Some(Duration::from_millis(e.saturating_sub(b))),
            _ => None,
        }
    }

    pub fn register_request(&mut self, response_time_nanos: u64, operation: &str) {
        self.operation_mut(operation).record(response_time_nanos, false);
    }

    pub fn register_error(&mut self, response_time_nanos: u64, operation: &str) {
        self.operation_mut(operation).record(response_time_nanos, true);
    }

    fn operation_mut(&mut self, operation: &str) -> &mut OperationStats {
        let layout = self.layout;
        self.operations
            .entry(operation.to_string())
            .or_insert_with(|| OperationStats::new(layout))
    }

    pub(crate) fn insert_operation(&mut self, name: String, stats: OperationStats) {
        self.operations.insert(name, stats);
    }

    pub fn operation(&self, name: &str) -> Option<&OperationStats> {
        self.operations.get(name)
    }

    pub fn operations(&self) -> impl Iterator<Item = (&str, &OperationStats)> {
        self.operations.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn merge(&self, other: &Statistics) -> Result<Statistics> {
        if self.layout != other.layout {
            return Err(MetricsError::incompatible(self.layout, other.layout));
        }

        let mut out = self.clone();
        out.begin_ms = min_opt(self.begin_ms, other.begin_ms);
        out.end_ms = max_opt(self.end_ms, other.end_ms);

        for (name, theirs) in &other.operations {
            match out.operations.get_mut(name) {
                Some(mine) => mine.merge_from(theirs)?,
                None => {
                    out.operations.insert(name.clone(), theirs.clone());
                }
            }
        }

        Ok(out)
    }

    /// Merges every item; `None` for an empty input.
    pub fn merge_all<'a>(items: impl IntoIterator<Item = &'a Statistics>) -> Result<Option<Statistics>> {
        let mut acc: Option<Statistics> = None;
        for s in items {
            acc = Some(match acc {
                None => s.clone(),
                Some(prev) => prev.merge(s)?,
            });
        }
        Ok(acc)
    }

    /// Requests per second over the measurement window.
    pub fn throughput(&self, operation: &str) -> Option<f64> {
        let op = self.operation(operation)?;
        let secs = self.duration()?.as_secs_f64();
        (secs > 0.0).then(|| per_sec(op.requests(), secs))
    }

    /// Successful requests per second over the measurement window.
    pub fn net_throughput(&self, operation: &str) -> Option<f64> {
        let op = self.operation(operation)?;
        let secs = self.duration()?.as_secs_f64();
        (secs > 0.0).then(|| per_sec(op.successes(), secs))
    }

    pub fn value(&self, operation: &str, kind: StatisticKind) -> Option<f64> {
        match kind {
            StatisticKind::Throughput => self.throughput(operation),
            StatisticKind::NetThroughput => self.net_throughput(operation),
            other => other.of_operation(self.operation(operation)?),
        }
    }
}

fn min_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(begin: u64, end: u64, samples: &[(&str, u64, bool)]) -> Statistics {
        let mut s = Statistics::default().with_window(begin, end);
        for (op, nanos, error) in samples {
            if *error {
                s.register_error(*nanos, op);
            } else {
                s.register_request(*nanos, op);
            }
        }
        s
    }

    fn merge(a: &Statistics, b: &Statistics) -> Statistics {
        a.merge(b).unwrap_or_else(|e| panic!("merge failed: {e}"))
    }

    #[test]
    fn merge_is_commutative_and_associative() {
        let a = stats(1_000, 3_000, &[("GET", 100, false), ("PUT", 250, true)]);
        let b = stats(500, 2_000, &[("GET", 7_000, false), ("GET", 90, false)]);
        let c = stats(2_500, 9_000, &[("REMOVE", 42, false), ("PUT", 1_000_000, false)]);

        assert_eq!(merge(&a, &b), merge(&b, &a));
        assert_eq!(merge(&merge(&a, &b), &c), merge(&a, &merge(&b, &c)));

        let all = merge(&merge(&a, &b), &c);
        assert_eq!(all.begin_ms(), Some(500));
        assert_eq!(all.end_ms(), Some(9_000));
        assert_eq!(all.operation("GET").map(OperationStats::requests), Some(3));
        assert_eq!(all.operation("PUT").map(OperationStats::errors), Some(1));
        assert_eq!(all.operation("PUT").map(OperationStats::response_time_max), Some(1_000_000));
    }

    #[test]
    fn merge_fails_on_different_layouts() {
        let a = Statistics::default();
        let layout = HistogramLayout::new(1, 1_000_000, 3).unwrap_or_else(|e| panic!("{e}"));
        let b = Statistics::new(Some(layout));

        assert!(matches!(
            a.merge(&b),
            Err(MetricsError::IncompatibleLayout { .. })
        ));
        assert!(a.merge(&Statistics::new(None)).is_err());
    }

    #[test]
    fn merge_all_of_nothing_is_none() {
        let none: Vec<Statistics> = Vec::new();
        assert!(matches!(Statistics::merge_all(&none), Ok(None)));
    }

    #[test]
    fn throughput_uses_the_window() {
        let s = stats(
            0,
            2_000,
            &[("GET", 1, false), ("GET", 1, false), ("GET", 1, false), ("GET", 1, true)],
        );
        assert_eq!(s.throughput("GET"), Some(2.0));
        assert_eq!(s.net_throughput("GET"), Some(1.5));
        assert_eq!(s.throughput("PUT"), None);

        let open = Statistics::default();
        assert_eq!(open.throughput("GET"), None);
    }

    #[test]
    fn serde_roundtrip_preserves_equality() {
        let s = stats(10, 20, &[("GET", 1_500, false), ("PUT", 8, true)]);
        let raw = serde_json::to_vec(&s).unwrap_or_else(|e| panic!("{e}"));
        let back: Statistics = serde_json::from_slice(&raw).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(back.operation("GET").map(OperationStats::requests), Some(1));
        assert_eq!(back.duration(), s.duration());
        assert_eq!(back.layout(), s.layout());
    }
}
