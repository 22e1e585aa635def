use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};
use crate::layout::HistogramLayout;

/// Counters and optional response-time histogram for one operation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    requests: u64,
    errors: u64,
    response_time_sum: u64,
    response_time_max: u64,
    #[serde(default, with = "histogram_serde")]
    histogram: Option<Histogram<u64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSummary {
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub stdev: Option<f64>,
    pub count: u64,
}

impl OperationStats {
    pub fn new(layout: Option<HistogramLayout>) -> Self {
        Self {
            requests: 0,
            errors: 0,
            response_time_sum: 0,
            response_time_max: 0,
            histogram: layout.map(|l| l.histogram()),
        }
    }

    /// Records one completed request; `error` marks it as failed.
    pub fn record(&mut self, response_time_nanos: u64, error: bool) {
        self.requests = self.requests.saturating_add(1);
        if error {
            self.errors = self.errors.saturating_add(1);
        }
        self.response_time_sum = self.response_time_sum.saturating_add(response_time_nanos);
        self.response_time_max = self.response_time_max.max(response_time_nanos);
        if let Some(h) = &mut self.histogram {
            // Zero latencies (e.g. unmeasured events) still count but cannot go below `lowest`.
            h.saturating_record(response_time_nanos.max(h.low()));
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn successes(&self) -> u64 {
        self.requests.saturating_sub(self.errors)
    }

    pub fn response_time_sum(&self) -> u64 {
        self.response_time_sum
    }

    pub fn response_time_max(&self) -> u64 {
        self.response_time_max
    }

    pub fn mean_response_time(&self) -> Option<f64> {
        (self.requests > 0).then(|| self.response_time_sum as f64 / self.requests as f64)
    }

    pub fn histogram(&self) -> Option<&Histogram<u64>> {
        self.histogram.as_ref()
    }

    pub fn layout(&self) -> Option<HistogramLayout> {
        self.histogram.as_ref().map(HistogramLayout::of)
    }

    /// Response time (nanoseconds) at the given percentile, if a histogram is kept.
    pub fn percentile(&self, percentile: f64) -> Option<f64> {
        let h = self.histogram.as_ref()?;
        (h.len() > 0).then(|| h.value_at_percentile(percentile) as f64)
    }

    pub fn merge_from(&mut self, other: &OperationStats) -> Result<()> {
        match (&mut self.histogram, &other.histogram) {
            (Some(mine), Some(theirs)) => {
                if HistogramLayout::of(mine) != HistogramLayout::of(theirs) {
                    return Err(MetricsError::incompatible(
                        Some(HistogramLayout::of(mine)),
                        Some(HistogramLayout::of(theirs)),
                    ));
                }
                mine.add(theirs)
                    .map_err(|err| MetricsError::Histogram(err.to_string()))?;
            }
            (None, None) => {}
            (mine, theirs) => {
                return Err(MetricsError::incompatible(
                    mine.as_ref().map(HistogramLayout::of),
                    theirs.as_ref().map(HistogramLayout::of),
                ));
            }
        }

        self.requests = self.requests.saturating_add(other.requests);
        self.errors = self.errors.saturating_add(other.errors);
        self.response_time_sum = self
            .response_time_sum
            .saturating_add(other.response_time_sum);
        self.response_time_max = self.response_time_max.max(other.response_time_max);
        Ok(())
    }

    pub fn summary(&self) -> Option<HistogramSummary> {
        self.histogram.as_ref().map(summarize_histogram)
    }
}

pub(crate) fn summarize_histogram(h: &Histogram<u64>) -> HistogramSummary {
    let count = h.len();
    let map_val = |v| v as f64;

    HistogramSummary {
        p50: (count > 0).then(|| map_val(h.value_at_quantile(0.50))),
        p90: (count > 0).then(|| map_val(h.value_at_quantile(0.90))),
        p95: (count > 0).then(|| map_val(h.value_at_quantile(0.95))),
        p99: (count > 0).then(|| map_val(h.value_at_quantile(0.99))),
        min: (count > 0).then(|| map_val(h.min())),
        max: (count > 0).then(|| map_val(h.max())),
        mean: (count > 0).then(|| h.mean()),
        stdev: (count > 0).then(|| h.stdev()),
        count,
    }
}

/// Histograms travel as their layout plus the non-empty buckets.
mod histogram_serde {
    use hdrhistogram::Histogram;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::layout::HistogramLayout;

    #[derive(Serialize, Deserialize)]
    struct Repr {
        layout: HistogramLayout,
        buckets: Vec<(u64, u64)>,
    }

    pub(super) fn serialize<S>(h: &Option<Histogram<u64>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let repr = h.as_ref().map(|h| Repr {
            layout: HistogramLayout::of(h),
            buckets: h
                .iter_recorded()
                .map(|v| (v.value_iterated_to(), v.count_at_value()))
                .collect(),
        });
        repr.serialize(serializer)
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Histogram<u64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(repr) = Option::<Repr>::deserialize(deserializer)? else {
            return Ok(None);
        };

        let layout = HistogramLayout::new(
            repr.layout.lowest(),
            repr.layout.highest(),
            repr.layout.significant_figures(),
        )
        .map_err(serde::de::Error::custom)?;

        let mut h = layout.histogram();
        for (value, count) in repr.buckets {
            h.record_n(value, count).map_err(serde::de::Error::custom)?;
        }
        Ok(Some(h))
    }
}
