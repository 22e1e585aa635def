use std::collections::BTreeMap;

use fleetbench_metrics::Statistics;
use fleetbench_value::Value;
use serde::{Deserialize, Serialize};

/// One stage invocation sent to every targeted slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDispatch {
    pub dispatch_id: u64,
    pub stage: String,
    /// Fully resolved properties; slaves never see unevaluated expressions.
    pub properties: BTreeMap<String, Value>,
    /// Slave indices taking part in this dispatch, in ascending order.
    pub targets: Vec<usize>,
}

impl StageDispatch {
    /// Position of `slave_index` among the targets.
    pub fn rank_of(&self, slave_index: usize) -> Option<usize> {
        self.targets.iter().position(|t| *t == slave_index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterMessage {
    Dispatch(StageDispatch),
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlaveMessage {
    Ack(Ack),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AckStatus {
    Success,
    /// The stage ran and reported an error, or never answered.
    Failure { detail: String },
    /// The stage crashed.
    Exception { detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPayload {
    Statistics(Vec<Statistics>),
    MemberCount(usize),
}

/// A slave's answer to one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub slave_index: usize,
    pub dispatch_id: u64,
    #[serde(flatten)]
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<AckPayload>,
}

impl Ack {
    pub fn success(slave_index: usize, dispatch_id: u64, payload: Option<AckPayload>) -> Self {
        Self {
            slave_index,
            dispatch_id,
            status: AckStatus::Success,
            payload,
        }
    }

    pub fn failure(slave_index: usize, dispatch_id: u64, detail: impl Into<String>) -> Self {
        Self {
            slave_index,
            dispatch_id,
            status: AckStatus::Failure {
                detail: detail.into(),
            },
            payload: None,
        }
    }

    pub fn exception(slave_index: usize, dispatch_id: u64, detail: impl Into<String>) -> Self {
        Self {
            slave_index,
            dispatch_id,
            status: AckStatus::Exception {
                detail: detail.into(),
            },
            payload: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, AckStatus::Success)
    }

    pub fn detail(&self) -> Option<&str> {
        match &self.status {
            AckStatus::Success => None,
            AckStatus::Failure { detail } | AckStatus::Exception { detail } => Some(detail),
        }
    }

    pub fn statistics(&self) -> &[Statistics] {
        match &self.payload {
            Some(AckPayload::Statistics(s)) => s,
            _ => &[],
        }
    }
}

/// Combined outcome of one dispatch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageResult {
    Success,
    Failure,
    Exception,
}

impl StageResult {
    pub fn is_error(self) -> bool {
        self != Self::Success
    }

    /// Folds acks into one result; any exception wins over any failure.
    pub fn reduce<'a>(acks: impl IntoIterator<Item = &'a Ack>) -> Self {
        acks.into_iter()
            .map(|a| match a.status {
                AckStatus::Success => Self::Success,
                AckStatus::Failure { .. } => Self::Failure,
                AckStatus::Exception { .. } => Self::Exception,
            })
            .max()
            .unwrap_or(Self::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_takes_precedence() {
        let acks = [
            Ack::success(0, 1, None),
            Ack::failure(1, 1, "bad"),
            Ack::exception(2, 1, "panic"),
        ];
        assert_eq!(StageResult::reduce(&acks), StageResult::Exception);
        assert_eq!(StageResult::reduce(&acks[..2]), StageResult::Failure);
        assert_eq!(StageResult::reduce(&acks[..1]), StageResult::Success);
        assert_eq!(StageResult::reduce(&[]), StageResult::Success);
    }

    #[test]
    fn ack_json_shape() {
        let ack = Ack::failure(2, 9, "timeout");
        let raw = serde_json::to_value(&ack).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(raw["slaveIndex"], 2);
        assert_eq!(raw["status"], "failure");
        assert_eq!(raw["detail"], "timeout");

        let back: Ack = serde_json::from_value(raw).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(back, ack);
    }

    #[test]
    fn statistics_payload_roundtrips() {
        let mut stats = Statistics::default().with_window(0, 1_000);
        stats.register_request(500, "GET");
        let ack = Ack::success(0, 3, Some(AckPayload::Statistics(vec![stats])));

        let raw = serde_json::to_vec(&MasterMessage::Shutdown).unwrap_or_else(|e| panic!("{e}"));
        assert!(matches!(
            serde_json::from_slice::<MasterMessage>(&raw),
            Ok(MasterMessage::Shutdown)
        ));

        let raw = serde_json::to_vec(&SlaveMessage::Ack(ack.clone()))
            .unwrap_or_else(|e| panic!("{e}"));
        match serde_json::from_slice::<SlaveMessage>(&raw) {
            Ok(SlaveMessage::Ack(back)) => {
                assert_eq!(back.statistics().len(), 1);
                assert_eq!(back, ack);
            }
            Err(e) => panic!("{e}"),
        }
    }
}
