use std::fmt;
use std::str::FromStr;

use crate::error::MetricsError;
use crate::operation::OperationStats;

/// A statistic derived on demand from a [`crate::Statistics`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatisticKind {
    Requests,
    Errors,
    /// Mean response time in nanoseconds.
    MeanResponseTime,
    /// Max response time in nanoseconds.
    MaxResponseTime,
    Throughput,
    NetThroughput,
    /// Response time in nanoseconds at the given percentile (0..=100).
    Percentile(f64),
}

impl StatisticKind {
    /// Window-independent statistics; throughput variants need the window and return `None`.
    pub(crate) fn of_operation(self, op: &OperationStats) -> Option<f64> {
        match self {
            Self::Requests => Some(op.requests() as f64),
            Self::Errors => Some(op.errors() as f64),
            Self::MeanResponseTime => op.mean_response_time(),
            Self::MaxResponseTime => (op.requests() > 0).then(|| op.response_time_max() as f64),
            Self::Percentile(p) => op.percentile(p),
            Self::Throughput | Self::NetThroughput => None,
        }
    }
}

impl FromStr for StatisticKind {
    type Err = MetricsError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let s = raw.trim().to_ascii_lowercase().replace('_', "-");
        let kind = match s.as_str() {
            "requests" | "count" => Self::Requests,
            "errors" => Self::Errors,
            "mean-response-time" | "mean" | "avg" => Self::MeanResponseTime,
            "max-response-time" | "max" => Self::MaxResponseTime,
            "throughput" => Self::Throughput,
            "net-throughput" => Self::NetThroughput,
            _ => {
                let inner = s
                    .strip_prefix("percentile(")
                    .and_then(|v| v.strip_suffix(')'))
                    .or_else(|| s.strip_prefix('p'))
                    .ok_or_else(|| MetricsError::UnknownStatistic(raw.to_string()))?;
                let p: f64 = inner
                    .parse()
                    .map_err(|_| MetricsError::UnknownStatistic(raw.to_string()))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(MetricsError::UnknownStatistic(raw.to_string()));
                }
                Self::Percentile(p)
            }
        };
        Ok(kind)
    }
}

impl fmt::Display for StatisticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requests => f.write_str("requests"),
            Self::Errors => f.write_str("errors"),
            Self::MeanResponseTime => f.write_str("mean-response-time"),
            Self::MaxResponseTime => f.write_str("max-response-time"),
            Self::Throughput => f.write_str("throughput"),
            Self::NetThroughput => f.write_str("net-throughput"),
            Self::Percentile(p) => write!(f, "percentile({p})"),
        }
    }
}

#[inline]
pub fn per_sec(delta: u64, dt_secs: f64) -> f64 {
    let dt = dt_secs.max(1e-9);
    delta as f64 / dt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_statistic_names() {
        let parse = |s: &str| s.parse::<StatisticKind>().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(parse("net-throughput"), StatisticKind::NetThroughput);
        assert_eq!(parse("NET_THROUGHPUT"), StatisticKind::NetThroughput);
        assert_eq!(parse("mean"), StatisticKind::MeanResponseTime);
        assert_eq!(parse("percentile(99.9)"), StatisticKind::Percentile(99.9));
        assert_eq!(parse("p95"), StatisticKind::Percentile(95.0));
    }

    #[test]
    fn rejects_unknown_statistics() {
        assert!("latency".parse::<StatisticKind>().is_err());
        assert!("percentile(101)".parse::<StatisticKind>().is_err());
    }

    #[test]
    fn display_roundtrips() {
        for kind in [
            StatisticKind::Requests,
            StatisticKind::Throughput,
            StatisticKind::Percentile(50.0),
        ] {
            let back: StatisticKind = kind
                .to_string()
                .parse()
                .unwrap_or_else(|e| panic!("{e}"));
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn per_sec_clamps_zero_interval() {
        assert_eq!(per_sec(10, 2.0), 5.0);
        let _ = per_sec(7, 0.0);
    }
}
