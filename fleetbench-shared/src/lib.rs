mod state;

pub use state::{SlaveState, SlaveStateError};
