//! The slave-side runtime shell.
//!
//! `SlaveRunner` owns the reactor and the sockets, and executes the
//! [`AgentAction`]s the state machine returns: publishing values,
//! maintaining data subscriptions (reference-counted per publisher
//! endpoint), arming the communications timeout, and shutting down.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use stepbus_net::{
    ClientSocket, Endpoint, Reactor, ServerSocket, SocketEvent, SocketId, TimerId,
};
use stepbus_proto::{ControlReply, ControlRequest, DataMessage, Fatal, FatalKind};
use tracing::{debug, info, trace, warn};

use crate::{AgentAction, AgentError, AgentState, SlaveAgent, SlaveError, SlaveInstance};

/// How long to keep the reactor alive after a shutdown decision so the
/// write pump can flush the final reply.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(50);

struct Subscription {
    socket_id: SocketId,
    /// Held so the connection's outbound channel stays open.
    _socket: ClientSocket,
    refcount: usize,
}

struct Shared<I> {
    agent: SlaveAgent<I>,
    control: Option<ServerSocket>,
    data_pub: Option<ServerSocket>,
    /// Data subscriptions, keyed by publisher endpoint URL.
    subscriptions: HashMap<String, Subscription>,
    /// Last publication per topic, replayed to late-joining subscribers so
    /// a value published right after CONNECT_VARS cannot be missed while
    /// their connection is still being established.
    retained: HashMap<bytes::Bytes, stepbus_net::Message>,
    comm_timer: Option<TimerId>,
    failure: Option<AgentError>,
}

/// Runs one slave: binds its endpoints, drives the agent, and returns when
/// the slave leaves the execution.
pub struct SlaveRunner<I: SlaveInstance + 'static> {
    reactor: Reactor,
    shared: Rc<RefCell<Shared<I>>>,
    control_endpoint: Endpoint,
    data_pub_endpoint: Endpoint,
}

impl<I: SlaveInstance + 'static> SlaveRunner<I> {
    /// Binds `control_endpoint` and `data_pub_endpoint` (wildcards allowed)
    /// and prepares the agent. The actually bound endpoints are available
    /// immediately for registration with a master.
    pub fn new(
        instance: I,
        control_endpoint: &Endpoint,
        data_pub_endpoint: &Endpoint,
    ) -> Result<Self, SlaveError> {
        let mut reactor = Reactor::new()?;
        let shared = Rc::new(RefCell::new(Shared {
            agent: SlaveAgent::new(instance),
            control: None,
            data_pub: None,
            subscriptions: HashMap::new(),
            retained: HashMap::new(),
            comm_timer: None,
            failure: None,
        }));

        let control_shared = Rc::clone(&shared);
        let (_, control) = ServerSocket::bind(
            &mut reactor,
            control_endpoint,
            Box::new(move |reactor, _, event| {
                Self::on_control_event(&control_shared, reactor, event);
                Ok(())
            }),
        )?;

        // Subscribers connect here; nothing inbound is expected. New
        // subscribers are brought up to date from the retained values.
        let pub_shared = Rc::clone(&shared);
        let (_, data_pub) = ServerSocket::bind(
            &mut reactor,
            data_pub_endpoint,
            Box::new(move |_, _, event| {
                match event {
                    SocketEvent::Accepted { identity } => {
                        trace!(?identity, "data subscriber connected");
                        let s = pub_shared.borrow();
                        if let Some(data_pub) = &s.data_pub {
                            for retained in s.retained.values() {
                                let mut replay = retained.clone();
                                replay.push_envelope(stepbus_net::Message::from_frames(vec![
                                    identity.clone(),
                                ]));
                                if let Err(e) = data_pub.send(replay) {
                                    trace!(error = %e, "replay to new subscriber failed");
                                }
                            }
                        }
                    }
                    SocketEvent::Closed { identity } => {
                        trace!(?identity, "data subscriber left");
                    }
                    SocketEvent::Message(_) => {
                        trace!("ignoring inbound message on data-pub channel");
                    }
                }
                Ok(())
            }),
        )?;

        let control_bound = control.bound_endpoint().clone();
        let data_pub_bound = data_pub.bound_endpoint().clone();
        {
            let mut s = shared.borrow_mut();
            s.control = Some(control);
            s.data_pub = Some(data_pub);
        }

        Ok(Self {
            reactor,
            shared,
            control_endpoint: control_bound,
            data_pub_endpoint: data_pub_bound,
        })
    }

    /// The control endpoint the slave is actually listening on.
    pub fn bound_control_endpoint(&self) -> &Endpoint {
        &self.control_endpoint
    }

    /// The data-pub endpoint the slave is actually listening on.
    pub fn bound_data_pub_endpoint(&self) -> &Endpoint {
        &self.data_pub_endpoint
    }

    /// The agent's current lifecycle state.
    pub fn agent_state(&self) -> AgentState {
        self.shared.borrow().agent.state()
    }

    /// Serves the execution dialog until the slave terminates.
    ///
    /// Returns `Ok` on an orderly TERMINATE; otherwise the error that took
    /// the slave out of the execution (timeout, protocol fault, instance
    /// failure).
    pub fn run(&mut self) -> Result<(), SlaveError> {
        info!(
            control = %self.control_endpoint,
            data_pub = %self.data_pub_endpoint,
            "slave serving"
        );
        self.reactor
            .run()
            .map_err(|e| SlaveError::Internal(e.to_string()))?;
        match self.shared.borrow_mut().failure.take() {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn on_control_event(
        shared: &Rc<RefCell<Shared<I>>>,
        reactor: &mut Reactor,
        event: SocketEvent,
    ) {
        let mut message = match event {
            SocketEvent::Message(message) => message,
            SocketEvent::Accepted { identity } => {
                debug!(?identity, "master connected");
                return;
            }
            SocketEvent::Closed { identity } => {
                debug!(?identity, "master connection closed");
                return;
            }
        };
        let envelope = message.pop_envelope();

        // Any control traffic counts as life signs.
        let comm_timer = shared.borrow().comm_timer;
        if let Some(timer) = comm_timer {
            reactor.restart_timer(timer);
        }

        let request = match ControlRequest::decode(&message) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable control message");
                let reply = ControlReply::Fatal(Fatal {
                    kind: FatalKind::Protocol,
                    message: e.to_string(),
                });
                Self::send_reply(shared, reply, envelope);
                Self::execute(
                    shared,
                    reactor,
                    AgentAction::Shutdown(Some(AgentError::Protocol(e.to_string()))),
                );
                return;
            }
        };

        let outcome = shared.borrow_mut().agent.handle_control(request);
        if let Some(reply) = outcome.reply {
            Self::send_reply(shared, reply, envelope);
        }
        for action in outcome.actions {
            Self::execute(shared, reactor, action);
        }
    }

    fn send_reply(
        shared: &Rc<RefCell<Shared<I>>>,
        reply: ControlReply,
        envelope: stepbus_net::Message,
    ) {
        let mut wire = match reply.encode() {
            Ok(wire) => wire,
            Err(e) => {
                warn!(error = %e, "failed to encode reply");
                return;
            }
        };
        wire.push_envelope(envelope);
        let s = shared.borrow();
        if let Some(control) = &s.control {
            if let Err(e) = control.send(wire) {
                warn!(error = %e, "failed to send reply");
            }
        }
    }

    fn execute(shared: &Rc<RefCell<Shared<I>>>, reactor: &mut Reactor, action: AgentAction) {
        match action {
            AgentAction::Publish(publication) => {
                trace!(variable = %publication.variable, step_id = publication.step_id, "publish");
                let wire = publication.encode();
                let mut s = shared.borrow_mut();
                if let Some(topic) = wire.frame(0) {
                    s.retained.insert(topic.clone(), wire.clone());
                }
                if let Some(data_pub) = &s.data_pub {
                    data_pub.broadcast(&wire);
                }
            }

            AgentAction::Subscribe { source, endpoint } => {
                {
                    let mut s = shared.borrow_mut();
                    if let Some(subscription) = s.subscriptions.get_mut(&endpoint) {
                        subscription.refcount += 1;
                        return;
                    }
                }
                let parsed = match Endpoint::from_url(&endpoint) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!(%endpoint, error = %e, "bad data-pub endpoint");
                        return;
                    }
                };
                debug!(source = %source, %endpoint, "subscribing");
                let data_shared = Rc::clone(shared);
                let connected = ClientSocket::connect(
                    reactor,
                    &parsed,
                    Box::new(move |_, _, event| {
                        if let SocketEvent::Message(message) = event {
                            match DataMessage::decode(&message) {
                                Ok(publication) => {
                                    data_shared.borrow_mut().agent.handle_data(publication);
                                }
                                Err(e) => warn!(error = %e, "undecodable publication"),
                            }
                        }
                        Ok(())
                    }),
                );
                match connected {
                    Ok((socket_id, socket)) => {
                        shared.borrow_mut().subscriptions.insert(
                            endpoint,
                            Subscription { socket_id, _socket: socket, refcount: 1 },
                        );
                    }
                    Err(e) => warn!(%endpoint, error = %e, "subscribe failed"),
                }
            }

            AgentAction::Unsubscribe { source, endpoint } => {
                let removed = {
                    let mut s = shared.borrow_mut();
                    match s.subscriptions.get_mut(&endpoint) {
                        Some(subscription) => {
                            subscription.refcount -= 1;
                            if subscription.refcount == 0 {
                                s.subscriptions.remove(&endpoint).map(|sub| sub.socket_id)
                            } else {
                                None
                            }
                        }
                        None => None,
                    }
                };
                if let Some(socket_id) = removed {
                    debug!(source = %source, %endpoint, "unsubscribed");
                    reactor.remove_socket(socket_id);
                }
            }

            AgentAction::StartCommTimer(timeout) => {
                let timer_shared = Rc::clone(shared);
                let timer = reactor.add_timer(
                    timeout,
                    Some(1),
                    Box::new(move |reactor, _| {
                        warn!(?timeout, "communications timeout, shutting down");
                        timer_shared.borrow_mut().failure = Some(AgentError::Timeout(timeout));
                        reactor.stop();
                        Ok(())
                    }),
                );
                shared.borrow_mut().comm_timer = Some(timer);
            }

            AgentAction::Shutdown(error) => {
                {
                    let mut s = shared.borrow_mut();
                    if s.failure.is_none() {
                        s.failure = error;
                    }
                    if let Some(timer) = s.comm_timer.take() {
                        reactor.remove_timer(timer);
                    }
                }
                // Let the write pump flush the final reply before exiting.
                reactor.add_timer(
                    SHUTDOWN_GRACE,
                    Some(1),
                    Box::new(|reactor, _| {
                        reactor.stop();
                        Ok(())
                    }),
                );
            }
        }
    }
}
