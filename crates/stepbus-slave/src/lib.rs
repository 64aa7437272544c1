//! Slave-side runtime for the stepbus co-simulation bus.
//!
//! A slave process plugs a model into the bus by implementing
//! [`SlaveInstance`] and handing it to a [`SlaveRunner`]. The runner binds
//! the slave's control and data-pub endpoints, runs the reactor, and feeds
//! the [`SlaveAgent`] state machine, which holds all protocol logic: the
//! lifecycle FSM, the input mailbox, and the publish-on-step behavior.

mod agent;
mod error;
mod instance;
mod runner;

pub use agent::{AgentAction, AgentOutcome, AgentState, SlaveAgent};
pub use error::{AgentError, SlaveError};
pub use instance::{InstanceError, SlaveInstance, StepOutcome};
pub use runner::SlaveRunner;
