use std::time::Duration;

use tokio::task::JoinHandle;

use crate::capabilities::CapabilityRegistry;
use crate::master::Master;
use crate::slave::Slave;
use crate::transport::{LinkError, LocalMemberLink, local_link};

const LINK_CAPACITY: usize = 16;

/// A master and `size` slaves in one process, connected by [`local_link`]s.
pub struct LocalCluster {
    master: Master<LocalMemberLink>,
    slaves: Vec<JoinHandle<Result<(), LinkError>>>,
}

impl LocalCluster {
    /// Spawns one slave task per index; `capabilities` builds each slave's service.
    pub fn spawn(
        size: usize,
        stage_timeout: Duration,
        mut capabilities: impl FnMut(usize) -> CapabilityRegistry,
    ) -> Self {
        let mut members = Vec::with_capacity(size);
        let mut slaves = Vec::with_capacity(size);
        for slave_index in 0..size {
            let (member, link) = local_link(slave_index, LINK_CAPACITY);
            let slave = Slave::new(slave_index, link, capabilities(slave_index));
            slaves.push(tokio::spawn(slave.run()));
            members.push(member);
        }
        tracing::debug!(size, "local cluster spawned");

        Self {
            master: Master::new(members, stage_timeout),
            slaves,
        }
    }

    pub fn master(&mut self) -> &mut Master<LocalMemberLink> {
        &mut self.master
    }

    pub fn size(&self) -> usize {
        self.slaves.len()
    }

    /// Sends `Shutdown` and waits for every slave task to stop its service and exit.
    pub async fn shutdown(mut self) {
        self.master.shutdown().await;
        drop(self.master);

        for (slave, handle) in self.slaves.into_iter().enumerate() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(slave, error = %err, "slave exited with error"),
                Err(err) => tracing::warn!(slave, error = %err, "slave task failed"),
            }
        }
    }
}
