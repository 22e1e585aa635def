use std::time::Instant;

use crate::capabilities::Capability;
use crate::properties::Properties;
use crate::protocol::AckPayload;

use super::{Placement, SlaveContext, StageError, StageName};

/// Starts the local member of the service under test.
#[derive(Debug, Clone, Default)]
pub struct ServiceStartStage;

impl ServiceStartStage {
    pub fn from_properties(props: &Properties) -> Result<Self, StageError> {
        props.reject_unknown(&[])?;
        Ok(Self)
    }

    pub(super) async fn execute(self, ctx: &SlaveContext) -> Result<Option<AckPayload>, StageError> {
        let Some(service) = ctx.capabilities.lifecycle() else {
            return Ok(ctx.skip(StageName::ServiceStart, Capability::Lifecycle));
        };

        let started_at = Instant::now();
        let started = ctx
            .lifecycle
            .start(|cancel| async move {
                tokio::task::spawn_blocking(move || service.set_up(&cancel)).await??;
                Ok::<(), StageError>(())
            })
            .await?;

        if started {
            tracing::info!(
                slave = ctx.slave_index,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "service started"
            );
        } else {
            tracing::info!(
                slave = ctx.slave_index,
                state = %ctx.lifecycle.state(),
                "service start skipped"
            );
        }
        Ok(None)
    }
}

/// Stops the local member; with `interrupt`, a start still in progress is cancelled first.
#[derive(Debug, Clone, Default)]
pub struct ServiceStopStage {
    pub interrupt: bool,
}

impl ServiceStopStage {
    pub fn from_properties(props: &Properties) -> Result<Self, StageError> {
        props.reject_unknown(&["interrupt"])?;
        Ok(Self {
            interrupt: props.bool_or("interrupt", false)?,
        })
    }

    pub(crate) async fn execute(
        self,
        ctx: &SlaveContext,
    ) -> Result<Option<AckPayload>, StageError> {
        let Some(service) = ctx.capabilities.lifecycle() else {
            return Ok(ctx.skip(StageName::ServiceStop, Capability::Lifecycle));
        };

        let stopped = ctx
            .lifecycle
            .stop(self.interrupt, || async move {
                tokio::task::spawn_blocking(move || service.tear_down()).await??;
                Ok::<(), StageError>(())
            })
            .await?;

        if stopped {
            tracing::info!(slave = ctx.slave_index, "service stopped");
        } else {
            tracing::info!(
                slave = ctx.slave_index,
                state = %ctx.lifecycle.state(),
                "service stop skipped"
            );
        }
        Ok(None)
    }
}

/// Removes every entry from a bucket (or the default one).
#[derive(Debug, Clone, Default)]
pub struct ClearStage {
    pub bucket: Option<String>,
}

impl ClearStage {
    pub fn from_properties(props: &Properties) -> Result<Self, StageError> {
        props.reject_unknown(&["bucket"])?;
        Ok(Self {
            bucket: props.string("bucket")?,
        })
    }

    pub(super) fn execute(self, ctx: &SlaveContext) -> Result<Option<AckPayload>, StageError> {
        let Some(service) = ctx.capabilities.clearable() else {
            return Ok(ctx.skip(StageName::Clear, Capability::Clearable));
        };
        ctx.ensure_running()?;

        service.clear(self.bucket.as_deref())?;
        tracing::info!(slave = ctx.slave_index, bucket = ?self.bucket, "bucket cleared");
        Ok(None)
    }
}

/// Verifies the service sees the expected number of members; defaults to the number of
/// slaves taking part in the dispatch.
#[derive(Debug, Clone, Default)]
pub struct CheckClusterStage {
    pub expected_members: Option<usize>,
}

impl CheckClusterStage {
    pub fn from_properties(props: &Properties) -> Result<Self, StageError> {
        props.reject_unknown(&["expected-members"])?;
        let expected_members = if props.contains("expected-members") {
            Some(props.usize_or("expected-members", 0)?)
        } else {
            None
        };
        Ok(Self { expected_members })
    }

    pub(super) fn execute(
        self,
        ctx: &SlaveContext,
        placement: Placement,
    ) -> Result<Option<AckPayload>, StageError> {
        let Some(service) = ctx.capabilities.clustered() else {
            return Ok(ctx.skip(StageName::CheckCluster, Capability::Clustered));
        };

        let expected = self.expected_members.unwrap_or(placement.participants);
        let actual = service.num_members();
        if actual != expected {
            return Err(StageError::ClusterSize { expected, actual });
        }
        Ok(Some(AckPayload::MemberCount(actual)))
    }
}
