//! Networking layer for the stepbus co-simulation bus.
//!
//! This crate provides the pieces everything else is wired together with:
//!
//! - [`Endpoint`] and the [`ip`] module: transport-independent addressing
//!   with `tcp://host:port` URLs and `*` wildcards.
//! - [`Message`]: ordered multi-frame messages with envelope handling.
//! - [`Reactor`]: a single-threaded socket-and-timer dispatch loop. All
//!   protocol logic in a process runs in reactor dispatch; I/O is performed
//!   by background pump tasks that never touch protocol state.
//! - [`ClientSocket`] / [`ServerSocket`]: message-oriented TCP sockets.
//!   A server socket routes replies to the originating connection via an
//!   identity envelope, and can broadcast to every connected peer.
//! - [`pipe`]: in-process socket pairs so state machines can be tested
//!   without any networking.

mod endpoint;
mod error;
mod message;
pub mod pipe;
mod reactor;
mod tcp;

pub use endpoint::{Endpoint, SlaveLocator, ip};
pub use error::NetError;
pub use message::Message;
pub use reactor::{
    EventSink, HandlerError, Reactor, ReactorError, SocketEvent, SocketHandler, SocketId,
    StopToken, TimerHandler, TimerId,
};
pub use tcp::{ClientSocket, MessageSender, ServerSocket};
