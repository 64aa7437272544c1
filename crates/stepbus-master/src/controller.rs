//! The master-side proxy for one remote slave.
//!
//! A controller keeps the invariant that at most one command is on the wire
//! per slave: further commands queue FIFO and are transmitted as replies
//! come back. Replies are matched against the head of the queue; anything
//! else is a fatal protocol error. Every command carries a deadline, and a
//! missed deadline disconnects the slave — commands are cancelled locally,
//! never resent.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use stepbus_net::{
    ClientSocket, Endpoint, Message, MessageSender, Reactor, SocketEvent, SocketHandler,
    SocketId, TimerId,
};
use stepbus_proto::{ControlReply, ControlRequest, Fatal, FatalKind};
use tracing::{debug, trace, warn};

use crate::BusError;

/// Completion callback for one command.
pub type ReplyCallback = Box<dyn FnOnce(&mut Reactor, Result<ControlReply, BusError>)>;

/// Which replies complete a given command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expected {
    Ready,
    Ok,
    StepResult,
    Description,
}

fn expected_reply(request: &ControlRequest) -> Expected {
    match request {
        ControlRequest::Hello(_) => Expected::Ready,
        ControlRequest::Describe => Expected::Description,
        ControlRequest::Step(_) => Expected::StepResult,
        ControlRequest::Setup(_)
        | ControlRequest::SetVars(_)
        | ControlRequest::ConnectVars(_)
        | ControlRequest::AcceptStep
        | ControlRequest::Terminate => Expected::Ok,
    }
}

fn reply_matches(expected: Expected, reply: &ControlReply) -> bool {
    matches!(
        (expected, reply),
        (Expected::Ready, ControlReply::Ready)
            | (Expected::Ok, ControlReply::Ok)
            | (Expected::StepResult, ControlReply::StepOk)
            | (Expected::StepResult, ControlReply::StepFailed)
            | (Expected::Description, ControlReply::Description(_))
    )
}

fn fatal_to_error(fatal: Fatal) -> BusError {
    match fatal.kind {
        FatalKind::Version => BusError::VersionMismatch(fatal.message),
        FatalKind::Setup => BusError::SetupRejected(fatal.message),
        _ => BusError::Fatal { kind: fatal.kind, message: fatal.message },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerState {
    Active,
    Terminated,
    Disconnected,
}

struct Pending {
    expected: Expected,
    /// Encoded but not yet transmitted; `None` once on the wire.
    wire: Option<Message>,
    timeout: Duration,
    timer: Option<TimerId>,
    callback: Option<ReplyCallback>,
}

struct Inner {
    name: String,
    sender: Option<Box<dyn MessageSender>>,
    socket_id: Option<SocketId>,
    pending: VecDeque<Pending>,
    state: ControllerState,
}

/// Master-side handle to one remote slave's control dialog.
#[derive(Clone)]
pub struct SlaveController {
    inner: Rc<RefCell<Inner>>,
}

impl SlaveController {
    /// Creates a controller with no transport attached yet.
    pub fn detached(name: &str) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                name: name.to_string(),
                sender: None,
                socket_id: None,
                pending: VecDeque::new(),
                state: ControllerState::Active,
            })),
        }
    }

    /// The socket handler that feeds this controller.
    pub fn handler(&self) -> SocketHandler {
        let weak = Rc::downgrade(&self.inner);
        Box::new(move |reactor, _, event| {
            if let Some(inner) = weak.upgrade() {
                on_event(&inner, reactor, event);
            }
            Ok(())
        })
    }

    /// Attaches the transport the controller sends through.
    pub fn attach(&self, socket_id: SocketId, sender: Box<dyn MessageSender>) {
        let mut inner = self.inner.borrow_mut();
        inner.socket_id = Some(socket_id);
        inner.sender = Some(sender);
    }

    /// Opens a control connection to `endpoint` and wires it up.
    pub fn connect(
        reactor: &mut Reactor,
        endpoint: &Endpoint,
        name: &str,
    ) -> Result<Self, BusError> {
        let controller = Self::detached(name);
        let (socket_id, socket) = ClientSocket::connect(reactor, endpoint, controller.handler())?;
        controller.attach(socket_id, Box::new(socket));
        Ok(controller)
    }

    /// Whether the controller can still take commands.
    pub fn is_active(&self) -> bool {
        self.inner.borrow().state == ControllerState::Active
    }

    /// The number of commands queued or on the wire.
    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Queues `request` and invokes `callback` exactly once: with the reply,
    /// or with the error that cancelled the command.
    pub fn send_command(
        &self,
        reactor: &mut Reactor,
        request: ControlRequest,
        timeout: Duration,
        callback: ReplyCallback,
    ) {
        {
            let inner = self.inner.borrow();
            if inner.state != ControllerState::Active {
                drop(inner);
                reactor.post(move |r| {
                    callback(r, Err(BusError::Aborted));
                    Ok(())
                });
                return;
            }
        }

        let wire = match request.encode() {
            Ok(wire) => wire,
            Err(e) => {
                let error = BusError::from(e);
                reactor.post(move |r| {
                    callback(r, Err(error));
                    Ok(())
                });
                return;
            }
        };

        let idle = {
            let mut inner = self.inner.borrow_mut();
            trace!(slave = %inner.name, code = request.code(), "command queued");
            let idle = inner.pending.is_empty();
            inner.pending.push_back(Pending {
                expected: expected_reply(&request),
                wire: Some(wire),
                timeout,
                timer: None,
                callback: Some(callback),
            });
            idle
        };
        if idle {
            transmit_head(&self.inner, reactor);
        }
    }

    /// Aborts every queued command and sends TERMINATE best-effort. Replies
    /// arriving afterwards are ignored.
    pub fn terminate(&self, reactor: &mut Reactor) {
        let (callbacks, timers) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != ControllerState::Active {
                return;
            }
            inner.state = ControllerState::Terminated;
            debug!(slave = %inner.name, "terminating");

            let mut callbacks = Vec::new();
            let mut timers = Vec::new();
            while let Some(mut pending) = inner.pending.pop_front() {
                if let Some(timer) = pending.timer.take() {
                    timers.push(timer);
                }
                if let Some(callback) = pending.callback.take() {
                    callbacks.push(callback);
                }
            }
            if let (Some(sender), Ok(wire)) =
                (inner.sender.as_ref(), ControlRequest::Terminate.encode())
            {
                if let Err(e) = sender.send(wire) {
                    debug!(slave = %inner.name, error = %e, "TERMINATE not deliverable");
                }
            }
            (callbacks, timers)
        };
        for timer in timers {
            reactor.remove_timer(timer);
        }
        for callback in callbacks {
            callback(reactor, Err(BusError::Aborted));
        }
    }
}

/// Transmits the head command if it has not been sent yet.
fn transmit_head(inner: &Rc<RefCell<Inner>>, reactor: &mut Reactor) {
    let (timeout, send_result) = {
        let mut guard = inner.borrow_mut();
        let Some(head) = guard.pending.front_mut() else { return };
        let Some(wire) = head.wire.take() else { return };
        let timeout = head.timeout;
        let result = match guard.sender.as_ref() {
            Some(sender) => sender.send(wire),
            None => Err(stepbus_net::NetError::Closed),
        };
        (timeout, result)
    };

    match send_result {
        Ok(()) => {
            let weak = Rc::downgrade(inner);
            let timer = reactor.add_timer(
                timeout,
                Some(1),
                Box::new(move |reactor, _| {
                    if let Some(inner) = weak.upgrade() {
                        on_timeout(&inner, reactor);
                    }
                    Ok(())
                }),
            );
            if let Some(head) = inner.borrow_mut().pending.front_mut() {
                head.timer = Some(timer);
            }
        }
        Err(e) => {
            disconnect(inner, reactor, BusError::from(e));
        }
    }
}

fn on_event(inner: &Rc<RefCell<Inner>>, reactor: &mut Reactor, event: SocketEvent) {
    match event {
        SocketEvent::Message(message) => on_reply(inner, reactor, &message),
        SocketEvent::Accepted { .. } => {}
        SocketEvent::Closed { .. } => {
            let active = inner.borrow().state == ControllerState::Active;
            if active {
                let name = inner.borrow().name.clone();
                debug!(slave = %name, "control connection closed");
                disconnect(inner, reactor, BusError::Net("connection closed".into()));
            }
        }
    }
}

fn on_reply(inner: &Rc<RefCell<Inner>>, reactor: &mut Reactor, message: &Message) {
    let reply = match ControlReply::decode(message) {
        Ok(reply) => reply,
        Err(e) => {
            let active = inner.borrow().state == ControllerState::Active;
            if active {
                disconnect(inner, reactor, BusError::ProtocolViolation(e.to_string()));
            }
            return;
        }
    };

    let head = {
        let mut guard = inner.borrow_mut();
        if guard.state != ControllerState::Active {
            trace!(slave = %guard.name, "reply after shutdown ignored");
            return;
        }
        match guard.pending.front() {
            // A reply can only belong to a transmitted command.
            Some(head) if head.wire.is_none() => guard.pending.pop_front(),
            _ => None,
        }
    };

    let Some(mut head) = head else {
        disconnect(
            inner,
            reactor,
            BusError::ProtocolViolation("reply with no command outstanding".into()),
        );
        return;
    };
    if let Some(timer) = head.timer.take() {
        reactor.remove_timer(timer);
    }

    if reply_matches(head.expected, &reply) {
        if let Some(callback) = head.callback.take() {
            callback(reactor, Ok(reply));
        }
        transmit_head(inner, reactor);
    } else if let ControlReply::Fatal(fatal) = reply {
        let name = inner.borrow().name.clone();
        warn!(slave = %name, kind = ?fatal.kind, message = %fatal.message, "slave reported fatal");
        if let Some(callback) = head.callback.take() {
            callback(reactor, Err(fatal_to_error(fatal)));
        }
        disconnect(inner, reactor, BusError::Aborted);
    } else {
        let violation =
            BusError::ProtocolViolation(format!("unexpected reply code {:#06x}", reply.code()));
        if let Some(callback) = head.callback.take() {
            callback(reactor, Err(violation.clone()));
        }
        disconnect(inner, reactor, violation);
    }
}

fn on_timeout(inner: &Rc<RefCell<Inner>>, reactor: &mut Reactor) {
    let active = inner.borrow().state == ControllerState::Active;
    if !active {
        return;
    }
    let name = inner.borrow().name.clone();
    warn!(slave = %name, "command deadline expired");

    // The head command gets Timeout; everything queued behind it is
    // cancelled.
    let head_callback = {
        let mut guard = inner.borrow_mut();
        guard.pending.pop_front().and_then(|mut head| head.callback.take())
    };
    if let Some(callback) = head_callback {
        callback(reactor, Err(BusError::Timeout));
    }
    disconnect(inner, reactor, BusError::Aborted);
}

/// Moves the controller to `Disconnected`, failing everything still queued.
fn disconnect(inner: &Rc<RefCell<Inner>>, reactor: &mut Reactor, error: BusError) {
    let (callbacks, timers, socket_id) = {
        let mut guard = inner.borrow_mut();
        if guard.state == ControllerState::Disconnected {
            return;
        }
        guard.state = ControllerState::Disconnected;
        let mut callbacks = Vec::new();
        let mut timers = Vec::new();
        while let Some(mut pending) = guard.pending.pop_front() {
            if let Some(timer) = pending.timer.take() {
                timers.push(timer);
            }
            if let Some(callback) = pending.callback.take() {
                callbacks.push(callback);
            }
        }
        guard.sender = None;
        (callbacks, timers, guard.socket_id.take())
    };

    for timer in timers {
        reactor.remove_timer(timer);
    }
    if let Some(socket_id) = socket_id {
        reactor.remove_socket(socket_id);
    }
    for callback in callbacks {
        callback(reactor, Err(error.clone()));
    }
}
