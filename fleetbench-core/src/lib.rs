mod error;

pub mod analysis;
pub mod capabilities;
pub mod cluster;
pub mod env;
pub mod expr;
pub mod interpreter;
pub mod lifecycle;
pub mod master;
pub mod properties;
pub mod protocol;
pub mod query;
pub mod report;
pub mod scenario;
pub mod slave;
pub mod stages;
pub mod transport;

pub use analysis::AnalyzeTest;
pub use capabilities::{Capability, CapabilityRegistry, Key, ServiceError};
pub use cluster::LocalCluster;
pub use env::VariableEnvironment;
pub use error::{Error, Result};
pub use interpreter::{
    AdvisoryFailure, FailureKind, Interpreter, RunFailure, RunOutcome, StageEvent, StageObserver,
};
pub use lifecycle::{CancelSignal, ServiceLifecycle, ServiceState};
pub use master::{DispatchOutcome, Master};
pub use properties::{Properties, PropertyError};
pub use protocol::{Ack, AckPayload, AckStatus, StageResult};
pub use report::{Iteration, Report, Test};
pub use scenario::{RepeatNode, ScaleNode, Scenario, ScenarioError, ScenarioNode, StageNode};
pub use slave::Slave;
pub use stages::{Stage, StageError, StageName};
