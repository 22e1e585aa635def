//! Stages a master can dispatch to its slaves.
//!
//! Each stage parses its own [`Properties`] (on the master before dispatch, and again on every
//! slave), runs on the slave against the service capabilities, and optionally contributes
//! statistics that the master files into the [`Report`].

mod basic_operations;
mod continuous_query;
mod service;
mod sleep;

use std::sync::Arc;

use fleetbench_metrics::MetricsError;
use fleetbench_shared::{SlaveState, SlaveStateError};

use crate::capabilities::{Capability, CapabilityRegistry, ServiceError};
use crate::lifecycle::{ServiceLifecycle, ServiceState};
use crate::properties::{Properties, PropertyError};
use crate::protocol::{Ack, AckPayload};
use crate::query::ConditionParseError;
use crate::report::Report;

pub use basic_operations::{BasicOperationsStage, GET, KeyFormat, KeySelection, PUT};
pub use continuous_query::{
    ContinuousQueryStage, ENTRY_JOINED, ENTRY_LEFT, LISTENER_STATE_KEY, STATISTICS_STATE_KEY,
    StatisticsListener,
};
pub use service::{CheckClusterStage, ClearStage, ServiceStartStage, ServiceStopStage};
pub use sleep::SleepStage;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
pub enum StageName {
    ServiceStart,
    ServiceStop,
    Clear,
    CheckCluster,
    Sleep,
    BasicOperations,
    ContinuousQuery,
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("unknown stage `{0}`")]
    UnknownStage(String),

    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error(transparent)]
    Condition(#[from] ConditionParseError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    State(#[from] SlaveStateError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("service is {0}, expected STARTED")]
    NotRunning(ServiceState),

    #[error("cluster has {actual} members, expected {expected}")]
    ClusterSize { expected: usize, actual: usize },

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StageError {
    /// Errors detectable on the master before anything is dispatched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownStage(_) | Self::Property(_) | Self::Condition(_)
        )
    }
}

/// Everything a slave keeps between dispatches.
#[derive(Debug)]
pub struct SlaveContext {
    pub slave_index: usize,
    pub capabilities: CapabilityRegistry,
    pub lifecycle: ServiceLifecycle,
    pub state: SlaveState,
}

impl SlaveContext {
    pub fn new(slave_index: usize, capabilities: CapabilityRegistry) -> Self {
        Self {
            slave_index,
            capabilities,
            lifecycle: ServiceLifecycle::new(),
            state: SlaveState::default(),
        }
    }

    /// Fails unless the service is running; services without a lifecycle are always running.
    pub(crate) fn ensure_running(&self) -> Result<(), StageError> {
        if !self.capabilities.has(Capability::Lifecycle) || self.lifecycle.is_running() {
            return Ok(());
        }
        Err(StageError::NotRunning(self.lifecycle.state()))
    }

    pub(crate) fn skip(&self, stage: StageName, missing: Capability) -> Option<AckPayload> {
        tracing::warn!(
            slave = self.slave_index,
            %stage,
            capability = %missing,
            "service lacks capability, stage skipped"
        );
        None
    }
}

/// Where one slave sits within a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub slave_index: usize,
    /// Position among the dispatch targets.
    pub rank: usize,
    /// Number of dispatch targets.
    pub participants: usize,
}

#[derive(Debug, Clone)]
pub enum Stage {
    ServiceStart(ServiceStartStage),
    ServiceStop(ServiceStopStage),
    Clear(ClearStage),
    CheckCluster(CheckClusterStage),
    Sleep(SleepStage),
    BasicOperations(BasicOperationsStage),
    ContinuousQuery(ContinuousQueryStage),
}

impl Stage {
    pub fn parse(name: &str, props: &Properties) -> Result<Self, StageError> {
        let kind: StageName = name
            .parse()
            .map_err(|_| StageError::UnknownStage(name.to_string()))?;

        Ok(match kind {
            StageName::ServiceStart => Self::ServiceStart(ServiceStartStage::from_properties(props)?),
            StageName::ServiceStop => Self::ServiceStop(ServiceStopStage::from_properties(props)?),
            StageName::Clear => Self::Clear(ClearStage::from_properties(props)?),
            StageName::CheckCluster => {
                Self::CheckCluster(CheckClusterStage::from_properties(props)?)
            }
            StageName::Sleep => Self::Sleep(SleepStage::from_properties(props)?),
            StageName::BasicOperations => {
                Self::BasicOperations(BasicOperationsStage::from_properties(props)?)
            }
            StageName::ContinuousQuery => {
                Self::ContinuousQuery(ContinuousQueryStage::from_properties(props)?)
            }
        })
    }

    pub fn name(&self) -> StageName {
        match self {
            Self::ServiceStart(_) => StageName::ServiceStart,
            Self::ServiceStop(_) => StageName::ServiceStop,
            Self::Clear(_) => StageName::Clear,
            Self::CheckCluster(_) => StageName::CheckCluster,
            Self::Sleep(_) => StageName::Sleep,
            Self::BasicOperations(_) => StageName::BasicOperations,
            Self::ContinuousQuery(_) => StageName::ContinuousQuery,
        }
    }

    pub async fn execute(
        self,
        ctx: Arc<SlaveContext>,
        placement: Placement,
    ) -> Result<Option<AckPayload>, StageError> {
        match self {
            Self::ServiceStart(s) => s.execute(&ctx).await,
            Self::ServiceStop(s) => s.execute(&ctx).await,
            Self::Clear(s) => s.execute(&ctx),
            Self::CheckCluster(s) => s.execute(&ctx, placement),
            Self::Sleep(s) => s.execute().await,
            Self::BasicOperations(s) => s.execute(&ctx, placement).await,
            Self::ContinuousQuery(s) => s.execute(&ctx),
        }
    }

    /// Files the statistics carried by `acks` into `report`, one new iteration per dispatch.
    pub fn record(&self, acks: &[Ack], report: &mut Report) {
        let (test_name, iteration_name) = match self {
            Self::BasicOperations(s) => (&s.test_name, &s.iteration_name),
            Self::ContinuousQuery(s) => (&s.test_name, &s.iteration_name),
            _ => return,
        };

        let test = report.test_mut(test_name);
        let iteration = test.start_iteration(iteration_name.clone());
        for ack in acks.iter().filter(|a| a.is_success()) {
            test.add_statistics(iteration, ack.slave_index, ack.statistics().to_vec());
        }
        tracing::debug!(test = %test_name, iteration, "statistics recorded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbench_metrics::Statistics;
    use fleetbench_value::Value;

    #[test]
    fn stage_names_parse() {
        assert_eq!(
            "check-cluster".parse::<StageName>().ok(),
            Some(StageName::CheckCluster)
        );
        assert!(matches!(
            Stage::parse("warp-drive", &Properties::default()),
            Err(StageError::UnknownStage(_))
        ));
    }

    #[test]
    fn bad_properties_are_configuration_errors() {
        let props: Properties = [("duration", Value::string("soon"))].into_iter().collect();
        match Stage::parse("sleep", &props) {
            Err(e) => assert!(e.is_configuration(), "{e}"),
            Ok(s) => panic!("expected error, got {s:?}"),
        }
    }

    #[test]
    fn record_appends_one_iteration_per_dispatch() {
        let props: Properties = [
            ("test-name", Value::string("load")),
            ("num-requests", Value::I64(1)),
        ]
        .into_iter()
        .collect();
        let stage = Stage::parse("basic-operations", &props).unwrap_or_else(|e| panic!("{e}"));

        let acks = vec![
            Ack::success(0, 1, Some(AckPayload::Statistics(vec![Statistics::default()]))),
            Ack::failure(1, 1, "timed out"),
        ];
        let mut report = Report::default();
        stage.record(&acks, &mut report);
        stage.record(&acks, &mut report);

        let test = report
            .test("load")
            .unwrap_or_else(|| panic!("test should exist"));
        assert_eq!(test.iterations().len(), 2);
        assert_eq!(test.iterations()[1].slaves().len(), 1);
    }
}
