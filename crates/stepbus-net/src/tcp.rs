//! Message-oriented TCP sockets.
//!
//! On the wire a message is a `u32` big-endian frame count followed by each
//! frame as a `u32` big-endian length plus payload. Reads and writes are done
//! by pump tasks on the reactor's local task set; the pumps exchange whole
//! [`Message`]s with protocol code through event queues and an unbounded
//! outbound channel, so nothing in reactor dispatch ever blocks on I/O.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, trace, warn};

use crate::reactor::{EventSink, Reactor, SocketEvent, SocketHandler, SocketId};
use crate::{Endpoint, Message, NetError};

/// Upper bound on frames per message; higher counts indicate corruption.
const MAX_FRAMES: u32 = 4096;

/// Upper bound on a single frame's size (16 MiB).
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Anything protocol code can push whole messages into.
///
/// Implemented by both TCP sockets and the in-process pipes used in tests,
/// so state machines can be exercised without a network.
pub trait MessageSender {
    /// Queues `message` for transmission as one atomic multi-frame unit.
    fn send(&self, message: Message) -> Result<(), NetError>;
}

/// The connecting end of a message-oriented TCP link.
///
/// Used by the master for control connections to slaves and by slaves for
/// data subscriptions to their peers. Inbound messages and the connection's
/// lifecycle arrive as [`SocketEvent`]s at the handler registered when the
/// socket was created.
pub struct ClientSocket {
    outbound: UnboundedSender<Message>,
}

impl ClientSocket {
    /// Starts connecting to `endpoint` and registers the connection with
    /// `reactor`. Messages sent before the connection is established are
    /// queued and flushed once it is; if the connect fails the handler
    /// receives [`SocketEvent::Closed`].
    pub fn connect(
        reactor: &mut Reactor,
        endpoint: &Endpoint,
        handler: SocketHandler,
    ) -> Result<(SocketId, Self), NetError> {
        let addr = endpoint.to_ip()?.connect_addr()?;
        let (id, sink) = reactor.add_socket(handler);
        let (outbound, outbound_rx) = unbounded_channel();
        reactor.spawn(client_pump(addr, outbound_rx, sink));
        Ok((id, Self { outbound }))
    }
}

impl MessageSender for ClientSocket {
    fn send(&self, message: Message) -> Result<(), NetError> {
        self.outbound.send(message).map_err(|_| NetError::Closed)
    }
}

/// The listening end of a message-oriented TCP link.
///
/// Accepts any number of peer connections. Each inbound message is delivered
/// with the peer's identity pushed as an envelope; [`send`](Self::send)
/// routes by popping that envelope again, and [`broadcast`](Self::broadcast)
/// fans a message out to every connected peer (the publish primitive).
pub struct ServerSocket {
    inner: Rc<RefCell<ServerInner>>,
    bound: Endpoint,
}

#[derive(Default)]
struct ServerInner {
    peers: HashMap<Bytes, UnboundedSender<Message>>,
}

impl ServerSocket {
    /// Binds `endpoint` (wildcards allowed) and registers the listener with
    /// `reactor`. The returned socket reports the actually bound endpoint.
    pub fn bind(
        reactor: &mut Reactor,
        endpoint: &Endpoint,
        handler: SocketHandler,
    ) -> Result<(SocketId, Self), NetError> {
        let bind_addr = endpoint.to_ip()?.bind_addr();
        let listener = reactor.block_on(TcpListener::bind(&bind_addr))?;
        let local: crate::ip::Endpoint = listener.local_addr()?.into();
        let bound = local.to_endpoint("tcp");
        debug!(endpoint = %bound, "listening");

        let (id, sink) = reactor.add_socket(handler);
        let inner = Rc::new(RefCell::new(ServerInner::default()));
        reactor.spawn(accept_pump(listener, Rc::clone(&inner), sink));
        Ok((id, Self { inner, bound }))
    }

    /// The endpoint the listener is actually bound to; useful when the
    /// requested endpoint used wildcards.
    pub fn bound_endpoint(&self) -> &Endpoint {
        &self.bound
    }

    /// Routes `message` to the peer named by its envelope.
    pub fn send(&self, mut message: Message) -> Result<(), NetError> {
        let envelope = message.pop_envelope();
        let identity = envelope.frame(0).ok_or(NetError::MissingEnvelope)?;
        let inner = self.inner.borrow();
        let peer = inner
            .peers
            .get(identity)
            .ok_or_else(|| NetError::UnknownPeer(identity.to_vec()))?;
        peer.send(message).map_err(|_| NetError::Closed)
    }

    /// Sends a copy of `message` to every connected peer.
    pub fn broadcast(&self, message: &Message) {
        let inner = self.inner.borrow();
        for peer in inner.peers.values() {
            let _ = peer.send(message.clone());
        }
    }
}

/// Writes one message to the stream.
async fn write_message(
    writer: &mut (impl AsyncWrite + Unpin),
    message: &Message,
) -> io::Result<()> {
    let mut wire = BytesMut::with_capacity(
        4 + message.frames().map(|f| 4 + f.len()).sum::<usize>(),
    );
    wire.extend_from_slice(&(message.len() as u32).to_be_bytes());
    for frame in message.frames() {
        wire.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        wire.extend_from_slice(frame);
    }
    writer.write_all(&wire).await?;
    writer.flush().await
}

/// Reads one message from the stream. Returns `None` on a clean end of
/// stream at a message boundary.
async fn read_message(reader: &mut (impl AsyncRead + Unpin)) -> io::Result<Option<Message>> {
    let mut count_buf = [0u8; 4];
    match reader.read_exact(&mut count_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let count = u32::from_be_bytes(count_buf);
    if count == 0 || count > MAX_FRAMES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad frame count"));
    }

    let mut message = Message::new();
    for _ in 0..count {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "oversize frame"));
        }
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;
        message.push(Bytes::from(payload));
    }
    Ok(Some(message))
}

async fn client_pump(addr: String, outbound: UnboundedReceiver<Message>, sink: EventSink) {
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%addr, error = %e, "connect failed");
            sink.push(SocketEvent::Closed { identity: None });
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    trace!(%addr, "connected");
    let (read_half, write_half) = stream.into_split();

    run_stream(read_half, write_half, outbound, &sink, None).await;
    sink.push(SocketEvent::Closed { identity: None });
}

async fn accept_pump(listener: TcpListener, inner: Rc<RefCell<ServerInner>>, sink: EventSink) {
    let mut next_peer: u32 = 0;
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let _ = stream.set_nodelay(true);
                next_peer += 1;
                let identity = Bytes::copy_from_slice(&next_peer.to_be_bytes());
                trace!(%peer_addr, peer = next_peer, "accepted");

                let (outbound, outbound_rx) = unbounded_channel();
                inner.borrow_mut().peers.insert(identity.clone(), outbound);
                tokio::task::spawn_local(peer_pump(
                    stream,
                    identity.clone(),
                    outbound_rx,
                    Rc::clone(&inner),
                    sink.clone(),
                ));
                sink.push(SocketEvent::Accepted { identity });
            }
            Err(e) => {
                // Transient accept failures (e.g. EMFILE) should not kill
                // the listener.
                warn!(error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    }
}

async fn peer_pump(
    stream: TcpStream,
    identity: Bytes,
    outbound: UnboundedReceiver<Message>,
    inner: Rc<RefCell<ServerInner>>,
    sink: EventSink,
) {
    let (read_half, write_half) = stream.into_split();
    run_stream(read_half, write_half, outbound, &sink, Some(identity.clone())).await;
    inner.borrow_mut().peers.remove(&identity);
    sink.push(SocketEvent::Closed { identity: Some(identity) });
}

/// Pumps both directions of one stream until either side finishes.
async fn run_stream(
    mut read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    mut outbound: UnboundedReceiver<Message>,
    sink: &EventSink,
    envelope: Option<Bytes>,
) {
    let write = async move {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = write_message(&mut write_half, &message).await {
                debug!(error = %e, "write failed");
                break;
            }
        }
    };
    let read = async {
        loop {
            match read_message(&mut read_half).await {
                Ok(Some(mut message)) => {
                    if let Some(identity) = &envelope {
                        message
                            .push_envelope(Message::from_frames(vec![identity.clone()]));
                    }
                    sink.push(SocketEvent::Message(message));
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "read failed");
                    break;
                }
            }
        }
    };
    tokio::select! {
        _ = write => {}
        _ = read => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_wire_round_trip() {
        let msg = Message::from_frames(vec![
            Bytes::from_static(b"\x00\x15"),
            Bytes::from_static(b"payload"),
            Bytes::new(),
        ]);
        let mut wire = Vec::new();
        write_message(&mut wire, &msg).await.unwrap();

        let mut cursor = io::Cursor::new(wire);
        let back = read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(back, msg);
    }

    #[tokio::test]
    async fn clean_eof_reads_as_none() {
        let mut cursor = io::Cursor::new(Vec::new());
        assert!(read_message(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_frame_count_is_rejected() {
        let mut cursor = io::Cursor::new(vec![0u8, 0, 0, 0]);
        assert!(read_message(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn truncated_message_is_an_error() {
        let msg = Message::from_frames(vec![Bytes::from_static(b"abcdef")]);
        let mut wire = Vec::new();
        write_message(&mut wire, &msg).await.unwrap();
        wire.truncate(wire.len() - 3);

        let mut cursor = io::Cursor::new(wire);
        assert!(read_message(&mut cursor).await.is_err());
    }
}
