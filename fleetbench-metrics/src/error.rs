use crate::layout::HistogramLayout;

pub type Result<T> = std::result::Result<T, MetricsError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricsError {
    #[error("cannot merge statistics with different histogram layouts ({left} vs {right})")]
    IncompatibleLayout { left: String, right: String },

    #[error("invalid histogram layout: {0}")]
    InvalidLayout(String),

    #[error("histogram error: {0}")]
    Histogram(String),

    #[error("unknown statistic `{0}`")]
    UnknownStatistic(String),
}

impl MetricsError {
    pub(crate) fn incompatible(
        left: Option<HistogramLayout>,
        right: Option<HistogramLayout>,
    ) -> Self {
        let show = |l: Option<HistogramLayout>| l.map_or_else(|| "none".to_string(), |l| l.to_string());
        Self::IncompatibleLayout {
            left: show(left),
            right: show(right),
        }
    }
}
