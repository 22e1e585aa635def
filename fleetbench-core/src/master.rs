use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use fleetbench_value::Value;

use crate::protocol::{Ack, MasterMessage, SlaveMessage, StageDispatch, StageResult};
use crate::stages::StageName;
use crate::transport::{LinkError, MemberLink};

/// Result of one dispatch after every target acked or was given up on.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub dispatch_id: u64,
    pub stage: String,
    pub result: StageResult,
    /// One ack per target, ordered by slave index.
    pub acks: Vec<Ack>,
    pub elapsed: Duration,
}

impl DispatchOutcome {
    pub fn failed_acks(&self) -> impl Iterator<Item = &Ack> {
        self.acks.iter().filter(|a| !a.is_success())
    }
}

/// Sends stages to slaves and collects their acks.
///
/// A slave that does not ack within the stage timeout, or whose link breaks, is recorded as a
/// FAILURE ack for that dispatch. Acks carrying an older dispatch id are dropped.
pub struct Master<L> {
    members: Vec<L>,
    next_dispatch_id: u64,
    stage_timeout: Duration,
}

impl<L: MemberLink> Master<L> {
    pub fn new(mut members: Vec<L>, stage_timeout: Duration) -> Self {
        members.sort_by_key(MemberLink::slave_index);
        Self {
            members,
            next_dispatch_id: 1,
            stage_timeout,
        }
    }

    pub fn cluster_size(&self) -> usize {
        self.members.len()
    }

    pub fn slave_indices(&self) -> Vec<usize> {
        self.members.iter().map(MemberLink::slave_index).collect()
    }

    pub fn stage_timeout(&self) -> Duration {
        self.stage_timeout
    }

    pub async fn dispatch(
        &mut self,
        stage: &str,
        properties: BTreeMap<String, Value>,
        targets: &[usize],
        timeout: Option<Duration>,
    ) -> DispatchOutcome {
        let dispatch_id = self.next_dispatch_id;
        self.next_dispatch_id += 1;
        let timeout = timeout.unwrap_or(self.stage_timeout);

        let mut targets: Vec<usize> = targets
            .iter()
            .copied()
            .filter(|t| self.members.iter().any(|m| m.slave_index() == *t))
            .collect();
        targets.sort_unstable();
        targets.dedup();

        tracing::info!(dispatch_id, stage, targets = ?targets, "dispatching stage");
        let started = Instant::now();

        let msg = MasterMessage::Dispatch(StageDispatch {
            dispatch_id,
            stage: stage.to_string(),
            properties,
            targets: targets.clone(),
        });

        let exchanges = self
            .members
            .iter_mut()
            .filter(|m| targets.contains(&m.slave_index()))
            .map(|link| {
                let msg = &msg;
                async move {
                    let slave = link.slave_index();
                    match tokio::time::timeout(timeout, exchange(link, msg, dispatch_id)).await {
                        Ok(Ok(ack)) => ack,
                        Ok(Err(err)) => {
                            tracing::warn!(slave, dispatch_id, error = %err, "slave link failed");
                            Ack::failure(slave, dispatch_id, format!("link failed: {err}"))
                        }
                        Err(_) => {
                            tracing::warn!(slave, dispatch_id, ?timeout, "slave did not ack in time");
                            Ack::failure(
                                slave,
                                dispatch_id,
                                format!("no ack within {}", humantime::format_duration(timeout)),
                            )
                        }
                    }
                }
            });
        let mut acks = futures::future::join_all(exchanges).await;
        acks.sort_by_key(|a| a.slave_index);

        let result = StageResult::reduce(&acks);
        let elapsed = started.elapsed();
        tracing::info!(
            dispatch_id,
            stage,
            %result,
            elapsed_ms = elapsed.as_millis() as u64,
            "stage completed"
        );

        DispatchOutcome {
            dispatch_id,
            stage: stage.to_string(),
            result,
            acks,
            elapsed,
        }
    }

    /// Best-effort: asks every slave to stop its service, interrupting starts in progress.
    pub async fn cleanup(&mut self) {
        let all = self.slave_indices();
        let props = BTreeMap::from([("interrupt".to_string(), Value::Bool(true))]);
        let outcome = self
            .dispatch(&StageName::ServiceStop.to_string(), props, &all, None)
            .await;
        for ack in outcome.failed_acks() {
            tracing::warn!(
                slave = ack.slave_index,
                detail = ack.detail().unwrap_or_default(),
                "cleanup failed on slave"
            );
        }
    }

    /// Tells every slave to exit. Slaves that already went away are ignored.
    pub async fn shutdown(&mut self) {
        for link in &mut self.members {
            if let Err(err) = link.send(&MasterMessage::Shutdown).await {
                tracing::debug!(slave = link.slave_index(), error = %err, "shutdown not delivered");
            }
        }
    }
}

async fn exchange<L: MemberLink>(
    link: &mut L,
    msg: &MasterMessage,
    dispatch_id: u64,
) -> Result<Ack, LinkError> {
    let slave = link.slave_index();
    link.send(msg).await?;
    loop {
        let SlaveMessage::Ack(mut ack) = link.recv().await?;
        if ack.dispatch_id != dispatch_id {
            tracing::debug!(
                slave,
                stale = ack.dispatch_id,
                current = dispatch_id,
                "dropping stale ack"
            );
            continue;
        }
        if ack.slave_index != slave {
            tracing::warn!(slave, reported = ack.slave_index, "ack reported a different slave index");
            ack.slave_index = slave;
        }
        return Ok(ack);
    }
}
