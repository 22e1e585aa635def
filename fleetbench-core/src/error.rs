use crate::analysis::AnalysisError;
use crate::expr::ExprError;
use crate::properties::PropertyError;
use crate::scenario::ScenarioError;
use crate::stages::StageError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Expression(#[from] ExprError),

    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Scenario(#[from] ScenarioError),

    #[error("invalid `{field}`: {reason}")]
    Bound { field: &'static str, reason: String },

    #[error("slave {0} is not part of the cluster")]
    UnknownSlave(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn bound(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Bound {
            field,
            reason: reason.into(),
        }
    }
}
