use std::time::Duration;

use crate::properties::{Properties, PropertyError};
use crate::protocol::AckPayload;

use super::StageError;

#[derive(Debug, Clone)]
pub struct SleepStage {
    pub duration: Duration,
}

impl SleepStage {
    pub fn from_properties(props: &Properties) -> Result<Self, StageError> {
        props.reject_unknown(&["duration"])?;
        let duration = props
            .duration("duration")?
            .ok_or_else(|| PropertyError::Missing("duration".to_string()))?;
        Ok(Self { duration })
    }

    pub(super) async fn execute(self) -> Result<Option<AckPayload>, StageError> {
        tokio::time::sleep(self.duration).await;
        Ok(None)
    }
}
