//! Interfaces a service under test may implement.
//!
//! A slave is handed a [`CapabilityRegistry`]; stages look up the capability they need and are
//! skipped when it is absent.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use fleetbench_value::Value;
use serde::{Deserialize, Serialize};

use crate::lifecycle::CancelSignal;
use crate::query::{Condition, Query};

/// Key of an entry in the service under test.
///
/// Timestamped keys carry their creation time so listeners can compute delivery latency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    Plain(String),
    Timestamped { id: u64, timestamp_ms: u64 },
}

impl Key {
    pub fn timestamp_ms(&self) -> Option<u64> {
        match self {
            Self::Plain(_) => None,
            Self::Timestamped { timestamp_ms, .. } => Some(*timestamp_ms),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(k) => f.write_str(k),
            Self::Timestamped { id, .. } => write!(f, "key_{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("service is not running")]
    NotRunning,

    #[error("service start was cancelled")]
    Cancelled,

    #[error("unknown bucket `{0}`")]
    UnknownBucket(String),

    #[error("unsupported query condition `{0}`")]
    UnsupportedCondition(String),

    #[error("{0}")]
    Operation(String),
}

pub trait Lifecycle: Send + Sync {
    /// Brings the local member up. Long starts should poll `cancel` and give up with
    /// [`ServiceError::Cancelled`] once it fires.
    fn set_up(&self, cancel: &CancelSignal) -> Result<(), ServiceError>;

    fn tear_down(&self) -> Result<(), ServiceError>;
}

pub trait BasicOperations: Send + Sync {
    fn put(&self, bucket: Option<&str>, key: Key, value: Value) -> Result<(), ServiceError>;

    fn get(&self, bucket: Option<&str>, key: &Key) -> Result<Option<Value>, ServiceError>;

    fn remove(&self, bucket: Option<&str>, key: &Key) -> Result<Option<Value>, ServiceError>;
}

pub trait Clearable: Send + Sync {
    fn clear(&self, bucket: Option<&str>) -> Result<(), ServiceError>;
}

pub trait Clustered: Send + Sync {
    fn num_members(&self) -> usize;
}

pub trait Queryable: Send + Sync {
    fn compile(&self, conditions: &[Condition]) -> Result<Query, ServiceError>;
}

/// Receives entry events for a registered continuous query. Called from service threads.
pub trait ContinuousQueryListener: Send + Sync {
    fn entry_joined(&self, key: &Key, value: &Value);

    fn entry_left(&self, key: &Key);
}

pub trait ContinuousQuery: Send + Sync {
    fn create_continuous_query(
        &self,
        bucket: Option<&str>,
        query: Query,
        listener: Arc<dyn ContinuousQueryListener>,
    ) -> Result<(), ServiceError>;

    /// Unregisters `listener` (matched by identity).
    fn remove_continuous_query(
        &self,
        bucket: Option<&str>,
        listener: &Arc<dyn ContinuousQueryListener>,
    ) -> Result<(), ServiceError>;
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Capability {
    Lifecycle,
    BasicOperations,
    Clearable,
    Clustered,
    Queryable,
    ContinuousQuery,
}

#[derive(Clone)]
enum Handle {
    Lifecycle(Arc<dyn Lifecycle>),
    BasicOperations(Arc<dyn BasicOperations>),
    Clearable(Arc<dyn Clearable>),
    Clustered(Arc<dyn Clustered>),
    Queryable(Arc<dyn Queryable>),
    ContinuousQuery(Arc<dyn ContinuousQuery>),
}

/// The capabilities one slave's service exposes, keyed by [`Capability`].
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    handles: HashMap<Capability, Handle>,
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.capabilities()).finish()
    }
}

macro_rules! capability_accessors {
    ($($variant:ident, $with:ident, $get:ident, $trait:ident;)*) => {
        impl CapabilityRegistry {
            $(
                #[must_use]
                pub fn $with(mut self, handle: Arc<dyn $trait>) -> Self {
                    self.handles.insert(Capability::$variant, Handle::$variant(handle));
                    self
                }

                pub fn $get(&self) -> Option<Arc<dyn $trait>> {
                    match self.handles.get(&Capability::$variant) {
                        Some(Handle::$variant(h)) => Some(h.clone()),
                        _ => None,
                    }
                }
            )*
        }
    };
}

capability_accessors! {
    Lifecycle, with_lifecycle, lifecycle, Lifecycle;
    BasicOperations, with_basic_operations, basic_operations, BasicOperations;
    Clearable, with_clearable, clearable, Clearable;
    Clustered, with_clustered, clustered, Clustered;
    Queryable, with_queryable, queryable, Queryable;
    ContinuousQuery, with_continuous_query, continuous_query, ContinuousQuery;
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.handles.contains_key(&capability)
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        use strum::IntoEnumIterator;
        Capability::iter().filter(|c| self.has(*c)).collect()
    }
}
