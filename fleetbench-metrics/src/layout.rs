use std::fmt;

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};

/// Bucket layout of a response-time histogram. Histograms can only be merged when both
/// operands were created from the same layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramLayout {
    lowest: u64,
    highest: u64,
    significant_figures: u8,
}

impl HistogramLayout {
    pub fn new(lowest: u64, highest: u64, significant_figures: u8) -> Result<Self> {
        if lowest < 1 {
            return Err(MetricsError::InvalidLayout(
                "lowest trackable value must be >= 1".to_string(),
            ));
        }
        if highest < lowest.saturating_mul(2) {
            return Err(MetricsError::InvalidLayout(format!(
                "highest trackable value ({highest}) must be >= 2 * lowest ({lowest})"
            )));
        }
        if significant_figures > 5 {
            return Err(MetricsError::InvalidLayout(format!(
                "significant figures must be in 0..=5 (got {significant_figures})"
            )));
        }

        Ok(Self {
            lowest,
            highest,
            significant_figures,
        })
    }

    pub fn lowest(&self) -> u64 {
        self.lowest
    }

    pub fn highest(&self) -> u64 {
        self.highest
    }

    pub fn significant_figures(&self) -> u8 {
        self.significant_figures
    }

    pub(crate) fn of(h: &Histogram<u64>) -> Self {
        Self {
            lowest: h.low(),
            highest: h.high(),
            significant_figures: h.sigfig(),
        }
    }

    pub(crate) fn histogram(&self) -> Histogram<u64> {
        // Bounds were validated in `new`.
        match Histogram::<u64>::new_with_bounds(self.lowest, self.highest, self.significant_figures)
        {
            Ok(h) => h,
            Err(err) => panic!("failed to create histogram: {err}"),
        }
    }
}

impl Default for HistogramLayout {
    /// Response times in nanoseconds, 1ns..60s, two significant figures.
    fn default() -> Self {
        Self {
            lowest: 1,
            highest: 60_000_000_000,
            significant_figures: 2,
        }
    }
}

impl fmt::Display for HistogramLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{} @ {} sigfig",
            self.lowest, self.highest, self.significant_figures
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_bounds() {
        assert!(HistogramLayout::new(0, 10, 2).is_err());
        assert!(HistogramLayout::new(10, 15, 2).is_err());
        assert!(HistogramLayout::new(1, 1000, 6).is_err());
        assert!(HistogramLayout::new(1, 1000, 3).is_ok());
    }

    #[test]
    fn layout_roundtrips_through_histogram() {
        let layout = HistogramLayout::new(1, 1_000_000, 3).unwrap_or_else(|e| panic!("{e}"));
        let h = layout.histogram();
        assert_eq!(HistogramLayout::of(&h), layout);
    }
}
