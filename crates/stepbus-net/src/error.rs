//! Network-layer errors.

/// Errors from endpoints, sockets and message transport.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// An underlying I/O operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An endpoint URL or address could not be parsed.
    #[error("invalid endpoint {input:?}: {reason}")]
    InvalidEndpoint {
        /// The text that failed to parse.
        input: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The endpoint names a transport other than `tcp`.
    #[error("unsupported transport {0:?}")]
    UnsupportedTransport(String),

    /// The connection is closed; no further messages can be sent.
    #[error("connection closed")]
    Closed,

    /// An outbound message lacked the identity envelope a server socket
    /// routes by.
    #[error("message has no routing envelope")]
    MissingEnvelope,

    /// The routing identity does not name a connected peer.
    #[error("no connected peer with identity {0:?}")]
    UnknownPeer(Vec<u8>),
}
