use std::future::Future;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::{MasterMessage, SlaveMessage};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,

    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Master's end of the link to one slave.
pub trait MemberLink: Send {
    fn slave_index(&self) -> usize;

    fn send(&mut self, msg: &MasterMessage) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Result<SlaveMessage, LinkError>> + Send;
}

/// Slave's end of the link to the master.
pub trait SlaveLink: Send {
    fn recv(&mut self) -> impl Future<Output = Result<MasterMessage, LinkError>> + Send;

    fn send(&mut self, msg: &SlaveMessage) -> impl Future<Output = Result<(), LinkError>> + Send;
}

/// In-process link: JSON frames over a pair of bounded channels, so every message crosses the
/// same encode/decode path a socket transport would.
pub fn local_link(slave_index: usize, capacity: usize) -> (LocalMemberLink, LocalSlaveLink) {
    let (to_slave, from_master) = mpsc::channel(capacity.max(1));
    let (to_master, from_slave) = mpsc::channel(capacity.max(1));
    (
        LocalMemberLink {
            slave_index,
            tx: to_slave,
            rx: from_slave,
        },
        LocalSlaveLink {
            tx: to_master,
            rx: from_master,
        },
    )
}

#[derive(Debug)]
pub struct LocalMemberLink {
    slave_index: usize,
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

#[derive(Debug)]
pub struct LocalSlaveLink {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

fn encode<T: serde::Serialize>(msg: &T) -> Result<Bytes, LinkError> {
    Ok(Bytes::from(serde_json::to_vec(msg)?))
}

fn decode<T: serde::de::DeserializeOwned>(frame: &Bytes) -> Result<T, LinkError> {
    Ok(serde_json::from_slice(frame)?)
}

impl MemberLink for LocalMemberLink {
    fn slave_index(&self) -> usize {
        self.slave_index
    }

    async fn send(&mut self, msg: &MasterMessage) -> Result<(), LinkError> {
        let frame = encode(msg)?;
        self.tx.send(frame).await.map_err(|_| LinkError::Closed)
    }

    async fn recv(&mut self) -> Result<SlaveMessage, LinkError> {
        let frame = self.rx.recv().await.ok_or(LinkError::Closed)?;
        decode(&frame)
    }
}

impl SlaveLink for LocalSlaveLink {
    async fn recv(&mut self) -> Result<MasterMessage, LinkError> {
        let frame = self.rx.recv().await.ok_or(LinkError::Closed)?;
        decode(&frame)
    }

    async fn send(&mut self, msg: &SlaveMessage) -> Result<(), LinkError> {
        let frame = encode(msg)?;
        self.tx.send(frame).await.map_err(|_| LinkError::Closed)
    }
}
