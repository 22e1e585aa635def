pub mod error;
pub mod layout;
pub mod live;
pub mod metric;
pub mod operation;
pub mod statistics;

pub use error::{MetricsError, Result};
pub use layout::HistogramLayout;
pub use live::LiveStatistics;
pub use metric::{StatisticKind, per_sec};
pub use operation::{HistogramSummary, OperationStats};
pub use statistics::{Statistics, now_millis};
