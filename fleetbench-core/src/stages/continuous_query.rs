use std::sync::Arc;

use fleetbench_metrics::{LiveStatistics, now_millis};
use fleetbench_value::Value;

use crate::capabilities::{Capability, ContinuousQuery, ContinuousQueryListener, Key};
use crate::properties::Properties;
use crate::protocol::AckPayload;
use crate::query::{Condition, Query};

use super::{SlaveContext, StageError, StageName};

pub const STATISTICS_STATE_KEY: &str = "continuous-query.statistics";
pub const LISTENER_STATE_KEY: &str = "continuous-query.listener";

pub const ENTRY_JOINED: &str = "ENTRY_JOINED";
pub const ENTRY_LEFT: &str = "ENTRY_LEFT";

const KNOWN: &[&str] = &[
    "test-name",
    "iteration-name",
    "bucket",
    "query",
    "reset-stats",
    "remove",
];

/// Registers (or with `remove`, unregisters) a continuous query whose events are counted as
/// `ENTRY_JOINED` / `ENTRY_LEFT` operations.
///
/// The listener and its statistics live in the slave state, so they span invocations: a typical
/// scenario registers, runs load, then removes and collects. Every invocation acks a resetting
/// snapshot of the statistics gathered since the previous one.
#[derive(Debug, Clone)]
pub struct ContinuousQueryStage {
    pub test_name: String,
    pub iteration_name: Option<String>,
    pub bucket: Option<String>,
    pub conditions: Vec<Condition>,
    pub reset_stats: bool,
    pub remove: bool,
}

impl ContinuousQueryStage {
    pub fn from_properties(props: &Properties) -> Result<Self, StageError> {
        props.reject_unknown(KNOWN)?;

        let conditions = props
            .string_list("query")?
            .iter()
            .map(|c| c.parse::<Condition>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            test_name: props.string_or("test-name", "Test")?,
            iteration_name: props.string("iteration-name")?,
            bucket: props.string("bucket")?,
            conditions,
            reset_stats: props.bool_or("reset-stats", false)?,
            remove: props.bool_or("remove", false)?,
        })
    }

    pub(super) fn execute(self, ctx: &SlaveContext) -> Result<Option<AckPayload>, StageError> {
        let Some(service) = ctx.capabilities.continuous_query() else {
            return Ok(ctx.skip(StageName::ContinuousQuery, Capability::ContinuousQuery));
        };
        ctx.ensure_running()?;

        let (stats, _) = ctx
            .state
            .get_or_insert_with(STATISTICS_STATE_KEY, LiveStatistics::default)?;
        if self.reset_stats {
            stats.reset();
        }

        if self.remove {
            self.unregister(ctx, service.as_ref())?;
        } else {
            self.register(ctx, service.as_ref(), &stats)?;
        }

        Ok(Some(AckPayload::Statistics(vec![stats.snapshot(true)])))
    }

    fn register(
        &self,
        ctx: &SlaveContext,
        service: &dyn ContinuousQuery,
        stats: &Arc<LiveStatistics>,
    ) -> Result<(), StageError> {
        if ctx.state.contains(LISTENER_STATE_KEY) {
            tracing::debug!(slave = ctx.slave_index, "continuous query already registered");
            return Ok(());
        }

        let query = match ctx.capabilities.queryable() {
            Some(q) => q.compile(&self.conditions)?,
            None => Query::new(self.conditions.clone()),
        };
        let listener: Arc<dyn ContinuousQueryListener> =
            Arc::new(StatisticsListener::new(stats.clone()));
        service.create_continuous_query(self.bucket.as_deref(), query, listener.clone())?;

        ctx.state.set(
            LISTENER_STATE_KEY,
            Arc::new(Registration {
                bucket: self.bucket.clone(),
                listener,
            }),
        );
        tracing::info!(
            slave = ctx.slave_index,
            bucket = ?self.bucket,
            conditions = self.conditions.len(),
            "continuous query registered"
        );
        Ok(())
    }

    fn unregister(&self, ctx: &SlaveContext, service: &dyn ContinuousQuery) -> Result<(), StageError> {
        let Some(registration) = ctx.state.remove::<Registration>(LISTENER_STATE_KEY)? else {
            tracing::debug!(slave = ctx.slave_index, "no continuous query to remove");
            return Ok(());
        };

        service.remove_continuous_query(registration.bucket.as_deref(), &registration.listener)?;
        tracing::info!(slave = ctx.slave_index, "continuous query removed");
        Ok(())
    }
}

struct Registration {
    bucket: Option<String>,
    listener: Arc<dyn ContinuousQueryListener>,
}

/// Counts continuous-query events into shared [`LiveStatistics`].
///
/// Latency is measured from the key's creation timestamp; plain keys record zero.
#[derive(Debug)]
pub struct StatisticsListener {
    stats: Arc<LiveStatistics>,
}

impl StatisticsListener {
    pub fn new(stats: Arc<LiveStatistics>) -> Self {
        Self { stats }
    }
}

fn latency_nanos(key: &Key) -> u64 {
    key.timestamp_ms().map_or(0, |ts| {
        now_millis().saturating_sub(ts).saturating_mul(1_000_000)
    })
}

impl ContinuousQueryListener for StatisticsListener {
    fn entry_joined(&self, key: &Key, _value: &Value) {
        self.stats.register_request(latency_nanos(key), ENTRY_JOINED);
    }

    fn entry_left(&self, key: &Key) {
        self.stats.register_request(latency_nanos(key), ENTRY_LEFT);
    }
}
