//! Slave-side errors.

use std::time::Duration;

use stepbus_net::NetError;
use stepbus_proto::ProtoError;

/// Why an agent shut its execution dialog down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    /// No control traffic arrived within the communications timeout.
    #[error("no communication from master for {0:?}")]
    Timeout(Duration),

    /// The control dialog violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The master speaks a protocol version this agent does not.
    #[error("unsupported protocol version {0}")]
    VersionMismatch(u16),

    /// The instance cannot operate in the requested time interval.
    #[error("setup rejected by the instance")]
    SetupRejected,

    /// The instance failed in a non-recoverable way.
    #[error("instance failure: {0}")]
    Instance(String),
}

/// Errors surfaced by [`crate::SlaveRunner`].
#[derive(Debug, thiserror::Error)]
pub enum SlaveError {
    /// A transport-level failure.
    #[error(transparent)]
    Net(#[from] NetError),

    /// A wire codec failure.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// The agent shut down abnormally.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// The event loop failed.
    #[error("event loop failure: {0}")]
    Internal(String),
}
