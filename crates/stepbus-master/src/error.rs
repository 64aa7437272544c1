//! Master-side errors.

use stepbus_model::SlaveId;
use stepbus_net::NetError;
use stepbus_proto::{FatalKind, ProtoError};

/// Errors surfaced through the master's command callbacks and facade.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    /// A command's deadline expired before the slave replied.
    #[error("operation timed out")]
    Timeout,

    /// A slave's control dialog violated the protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The operation was cancelled, typically by Terminate.
    #[error("operation aborted")]
    Aborted,

    /// The slave speaks a different protocol version.
    #[error("protocol version mismatch: {0}")]
    VersionMismatch(String),

    /// The slave rejected its setup.
    #[error("setup rejected: {0}")]
    SetupRejected(String),

    /// The slave could not be connected and set up.
    #[error("slave could not be added: {0}")]
    InstantiationFailed(String),

    /// The slave reported a fatal failure and is lost.
    #[error("fatal slave failure ({kind:?}): {message}")]
    Fatal {
        /// The failure category the slave reported.
        kind: FatalKind,
        /// The slave's message.
        message: String,
    },

    /// The command is not allowed in the execution's current state.
    #[error("command not allowed in state {0}")]
    InvalidCommand(&'static str),

    /// The step would take simulated time past the stop time.
    #[error("step of {step_size} at {current_time} exceeds stop time {stop_time}")]
    TimeOutOfRange {
        /// Simulated time before the step.
        current_time: f64,
        /// The requested step size.
        step_size: f64,
        /// The execution's stop time.
        stop_time: f64,
    },

    /// Step durations must be strictly positive.
    #[error("step size must be positive, got {0}")]
    InvalidStepSize(f64),

    /// A slave name is empty, not an identifier, or already taken.
    #[error("invalid or duplicate slave name {0:?}")]
    BadSlaveName(String),

    /// No slave with this id exists in the execution.
    #[error("no such slave {0}")]
    UnknownSlave(SlaveId),

    /// The slave exists but cannot take commands right now.
    #[error("slave {0} is not ready")]
    SlaveNotReady(SlaveId),

    /// A value or connection failed model validation.
    #[error("model validation failed: {0}")]
    Model(String),

    /// A transport failure.
    #[error("network failure: {0}")]
    Net(String),

    /// A wire codec failure.
    #[error("codec failure: {0}")]
    Proto(String),
}

impl From<NetError> for BusError {
    fn from(e: NetError) -> Self {
        Self::Net(e.to_string())
    }
}

impl From<ProtoError> for BusError {
    fn from(e: ProtoError) -> Self {
        Self::Proto(e.to_string())
    }
}

impl From<stepbus_model::ModelError> for BusError {
    fn from(e: stepbus_model::ModelError) -> Self {
        Self::Model(e.to_string())
    }
}
