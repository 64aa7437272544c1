//! In-process socket pairs.
//!
//! A pipe pair wires two registered sockets directly to each other's event
//! queues, with no bytes and no pumps involved. State-machine code that is
//! generic over [`MessageSender`](crate::MessageSender) can be driven
//! through pipes in unit tests, with full control over message order.

use crate::reactor::{EventSink, Reactor, SocketEvent, SocketHandler, SocketId};
use crate::{Message, MessageSender, NetError};

/// One end of an in-process pipe.
pub struct PipeSocket {
    peer: EventSink,
}

impl PipeSocket {
    /// Delivers `message` to the peer end's handler.
    pub fn send_to_peer(&self, message: Message) {
        self.peer.push(SocketEvent::Message(message));
    }

    /// Delivers a close notification to the peer end's handler.
    pub fn close(&self) {
        self.peer.push(SocketEvent::Closed { identity: None });
    }
}

impl MessageSender for PipeSocket {
    fn send(&self, message: Message) -> Result<(), NetError> {
        self.send_to_peer(message);
        Ok(())
    }
}

/// Registers two sockets wired to each other and returns both ends.
pub fn pair(
    reactor: &mut Reactor,
    a_handler: SocketHandler,
    b_handler: SocketHandler,
) -> ((SocketId, PipeSocket), (SocketId, PipeSocket)) {
    let (a_id, a_sink) = reactor.add_socket(a_handler);
    let (b_id, b_sink) = reactor.add_socket(b_handler);
    ((a_id, PipeSocket { peer: b_sink }), (b_id, PipeSocket { peer: a_sink }))
}
