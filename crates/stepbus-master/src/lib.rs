//! Master-side runtime for the stepbus co-simulation bus.
//!
//! The master sequences simulated time across a population of slaves. The
//! pieces, bottom up:
//!
//! - [`SlaveController`]: the proxy for one remote slave's control dialog —
//!   FIFO command queue, reply matching, per-command deadlines.
//! - [`ExecutionManager`]: the execution-wide state machine — setup,
//!   reconfiguration, the per-step barrier, accept, terminate.
//! - [`Execution`]: the facade a simulation driver uses, with blocking
//!   wrappers that run the reactor until each command's barrier completes.

mod controller;
mod error;
mod execution;
mod manager;

pub use controller::{ReplyCallback, SlaveController};
pub use error::BusError;
pub use execution::Execution;
pub use manager::{
    AddedSlave, CompletionHandler, ExecutionManager, ExecutionState, ReconstituteSlaveHandler,
    SlaveConfig, SlaveLifecycle, SlaveRecord, SlaveResultHandler, SlaveStepHandler,
    StepCompletionHandler, StepResult,
};
