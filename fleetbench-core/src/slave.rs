use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use crate::capabilities::CapabilityRegistry;
use crate::properties::Properties;
use crate::protocol::{Ack, MasterMessage, SlaveMessage, StageDispatch};
use crate::stages::{Placement, ServiceStopStage, SlaveContext, Stage};
use crate::transport::{LinkError, SlaveLink};

/// Executes dispatched stages against the local service and acks each one.
pub struct Slave<L> {
    link: L,
    ctx: Arc<SlaveContext>,
}

impl<L: SlaveLink> Slave<L> {
    pub fn new(slave_index: usize, link: L, capabilities: CapabilityRegistry) -> Self {
        Self {
            link,
            ctx: Arc::new(SlaveContext::new(slave_index, capabilities)),
        }
    }

    pub fn context(&self) -> &Arc<SlaveContext> {
        &self.ctx
    }

    /// Serves dispatches until the master sends `Shutdown` or goes away, then stops the service.
    pub async fn run(mut self) -> Result<(), LinkError> {
        let slave = self.ctx.slave_index;
        tracing::info!(
            slave,
            capabilities = ?self.ctx.capabilities,
            "slave ready"
        );

        let outcome = loop {
            let msg = match self.link.recv().await {
                Ok(msg) => msg,
                Err(LinkError::Closed) => {
                    tracing::info!(slave, "master link closed");
                    break Ok(());
                }
                Err(err) => break Err(err),
            };

            match msg {
                MasterMessage::Dispatch(dispatch) => {
                    let ack = execute_dispatch(&self.ctx, dispatch).await;
                    if let Err(err) = self.link.send(&SlaveMessage::Ack(ack)).await {
                        break Err(err);
                    }
                }
                MasterMessage::Shutdown => {
                    tracing::info!(slave, "shutdown requested");
                    break Ok(());
                }
            }
        };

        if let Err(err) = (ServiceStopStage { interrupt: true }).execute(&self.ctx).await {
            tracing::warn!(slave, error = %err, "service stop on shutdown failed");
        }
        outcome
    }
}

/// Runs one dispatch to completion. Errors become FAILURE acks, panics become EXCEPTION acks.
pub async fn execute_dispatch(ctx: &Arc<SlaveContext>, dispatch: StageDispatch) -> Ack {
    let slave = ctx.slave_index;
    let id = dispatch.dispatch_id;

    let Some(rank) = dispatch.rank_of(slave) else {
        return Ack::failure(slave, id, format!("slave {slave} is not a target"));
    };
    let placement = Placement {
        slave_index: slave,
        rank,
        participants: dispatch.targets.len(),
    };

    let props = Properties::new(dispatch.properties);
    let stage = match Stage::parse(&dispatch.stage, &props) {
        Ok(stage) => stage,
        Err(err) => {
            tracing::warn!(slave, stage = %dispatch.stage, error = %err, "rejected dispatch");
            return Ack::failure(slave, id, err.to_string());
        }
    };

    tracing::debug!(slave, dispatch_id = id, stage = %dispatch.stage, "stage started");
    let started = Instant::now();
    let joined = tokio::spawn(stage.execute(ctx.clone(), placement)).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match joined {
        Ok(Ok(payload)) => {
            tracing::debug!(slave, dispatch_id = id, elapsed_ms, "stage finished");
            Ack::success(slave, id, payload)
        }
        Ok(Err(err)) => {
            tracing::warn!(
                slave,
                dispatch_id = id,
                stage = %dispatch.stage,
                error = %err,
                "stage failed"
            );
            Ack::failure(slave, id, err.to_string())
        }
        Err(err) if err.is_panic() => {
            let detail = panic_message(err.into_panic());
            tracing::error!(
                slave,
                dispatch_id = id,
                stage = %dispatch.stage,
                panic = %detail,
                "stage crashed"
            );
            Ack::exception(slave, id, detail)
        }
        Err(err) => Ack::exception(slave, id, err.to_string()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "stage panicked".to_string()
    }
}
