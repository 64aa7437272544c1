//! Single-threaded socket and timer dispatch.
//!
//! The [`Reactor`] is the one place protocol code runs. Registered sockets
//! are event sources fed by background pump tasks (see `tcp`); timers are
//! kept in the reactor itself. `run` parks on a current-thread tokio runtime
//! so the pumps can move bytes, then dispatches: first every timer whose
//! deadline has passed, then every ready socket in registration order.
//! Exactly one handler runs at a time, and handlers may freely add or remove
//! sockets and timers — removals take effect before the next dispatch.
//!
//! Timers are rescheduled against their previous deadline rather than the
//! time of dispatch, so a slow handler delays individual firings but does
//! not accumulate drift (it may cause bunching instead).

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tokio::time::Instant;

use crate::{Message, NetError};

/// Identifies a registered socket.
pub type SocketId = u64;

/// Identifies a registered timer.
pub type TimerId = u64;

/// An error escaping a handler; it aborts [`Reactor::run`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Handles events on one registered socket.
pub type SocketHandler = Box<dyn FnMut(&mut Reactor, SocketId, SocketEvent) -> Result<(), HandlerError>>;

/// Handles one timer firing.
pub type TimerHandler = Box<dyn FnMut(&mut Reactor, TimerId) -> Result<(), HandlerError>>;

/// Something that happened on a registered socket.
#[derive(Debug)]
pub enum SocketEvent {
    /// A complete inbound message. Messages from a [`crate::ServerSocket`]
    /// carry the sending peer's identity as an envelope.
    Message(Message),
    /// A peer connected to a [`crate::ServerSocket`].
    Accepted {
        /// The identity assigned to the new peer connection.
        identity: Bytes,
    },
    /// The connection closed, or — on a server socket — one identified peer
    /// connection closed.
    Closed {
        /// The closed peer's identity, when the socket distinguishes peers.
        identity: Option<Bytes>,
    },
}

/// Errors surfaced by [`Reactor::run`].
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// A socket or timer handler returned an error.
    #[error("handler failed: {0}")]
    Handler(HandlerError),
}

impl ReactorError {
    /// Attempts to view the underlying handler error as a `T`.
    pub fn handler_error<T: std::error::Error + 'static>(&self) -> Option<&T> {
        match self {
            Self::Handler(e) => e.downcast_ref::<T>(),
        }
    }
}

/// The write side of a registered socket's event queue.
///
/// Pump tasks push decoded events here; the reactor wakes and dispatches
/// them to the socket's handler.
#[derive(Clone)]
pub struct EventSink {
    queue: Rc<RefCell<VecDeque<SocketEvent>>>,
    wake: Rc<Notify>,
}

impl EventSink {
    /// Enqueues an event and wakes the reactor.
    pub fn push(&self, event: SocketEvent) {
        self.queue.borrow_mut().push_back(event);
        self.wake.notify_one();
    }
}

/// Requests a running reactor to stop, from outside dispatch.
///
/// Completion callbacks hold one of these so a blocking facade can run the
/// reactor until an operation finishes.
#[derive(Clone)]
pub struct StopToken {
    stop: Rc<Cell<bool>>,
    wake: Rc<Notify>,
}

impl StopToken {
    /// Requests loop exit; `run` returns after the current handler.
    pub fn stop(&self) {
        self.stop.set(true);
        self.wake.notify_one();
    }
}

struct SocketSlot {
    id: SocketId,
    queue: Rc<RefCell<VecDeque<SocketEvent>>>,
    /// Taken out while the handler is being dispatched.
    handler: Option<SocketHandler>,
    removed: bool,
}

struct TimerSlot {
    id: TimerId,
    deadline: Instant,
    interval: Duration,
    /// `None` repeats forever.
    remaining: Option<u64>,
    handler: Option<TimerHandler>,
    removed: bool,
}

/// The single-threaded event loop underlying both master and slave.
pub struct Reactor {
    rt: tokio::runtime::Runtime,
    local: LocalSet,
    wake: Rc<Notify>,
    stop: Rc<Cell<bool>>,
    sockets: Vec<SocketSlot>,
    timers: Vec<TimerSlot>,
    next_socket_id: SocketId,
    next_timer_id: TimerId,
}

impl Reactor {
    /// Creates a reactor with its own current-thread runtime.
    pub fn new() -> Result<Self, NetError> {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            rt,
            local: LocalSet::new(),
            wake: Rc::new(Notify::new()),
            stop: Rc::new(Cell::new(false)),
            sockets: Vec::new(),
            timers: Vec::new(),
            next_socket_id: 1,
            next_timer_id: 1,
        })
    }

    /// Registers a socket and returns its id plus the sink its events are
    /// pushed through.
    pub fn add_socket(&mut self, handler: SocketHandler) -> (SocketId, EventSink) {
        let id = self.next_socket_id;
        self.next_socket_id += 1;
        let queue = Rc::new(RefCell::new(VecDeque::new()));
        self.sockets.push(SocketSlot {
            id,
            queue: Rc::clone(&queue),
            handler: Some(handler),
            removed: false,
        });
        (id, EventSink { queue, wake: Rc::clone(&self.wake) })
    }

    /// Unregisters a socket. Safe from within any handler; takes effect
    /// before the next dispatch. Pending events are dropped.
    pub fn remove_socket(&mut self, id: SocketId) {
        if let Some(slot) = self.sockets.iter_mut().find(|s| s.id == id) {
            slot.removed = true;
            slot.queue.borrow_mut().clear();
        }
    }

    /// Schedules a timer firing every `interval`, `count` times in total
    /// (`None` = forever). Returns the timer's id.
    pub fn add_timer(
        &mut self,
        interval: Duration,
        count: Option<u64>,
        handler: TimerHandler,
    ) -> TimerId {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.push(TimerSlot {
            id,
            deadline: Instant::now() + interval,
            interval,
            remaining: count,
            handler: Some(handler),
            removed: false,
        });
        id
    }

    /// Cancels a timer. Safe from within any handler.
    pub fn remove_timer(&mut self, id: TimerId) {
        if let Some(slot) = self.timers.iter_mut().find(|t| t.id == id) {
            slot.removed = true;
        }
    }

    /// Pushes a timer's next deadline to one full interval from now.
    /// Returns false if the timer does not exist.
    pub fn restart_timer(&mut self, id: TimerId) -> bool {
        match self.timers.iter_mut().find(|t| t.id == id && !t.removed) {
            Some(slot) => {
                slot.deadline = Instant::now() + slot.interval;
                true
            }
            None => false,
        }
    }

    /// Schedules `f` to run in the next dispatch turn.
    ///
    /// Completion paths use this instead of invoking callbacks synchronously,
    /// so a callback never runs inside the call that scheduled it.
    pub fn post(
        &mut self,
        f: impl FnOnce(&mut Reactor) -> Result<(), HandlerError> + 'static,
    ) {
        let mut f = Some(f);
        self.add_timer(
            Duration::ZERO,
            Some(1),
            Box::new(move |reactor, _| match f.take() {
                Some(f) => f(reactor),
                None => Ok(()),
            }),
        );
    }

    /// Requests loop exit; `run` returns after the current handler.
    pub fn stop(&mut self) {
        self.stop.set(true);
        self.wake.notify_one();
    }

    /// A handle that can stop the reactor from completion callbacks.
    pub fn stop_token(&self) -> StopToken {
        StopToken { stop: Rc::clone(&self.stop), wake: Rc::clone(&self.wake) }
    }

    /// Spawns a background task onto this reactor's local task set.
    ///
    /// Tasks only make progress while the reactor is running (or parked in
    /// `run`); they are for byte pumping, not protocol logic.
    pub fn spawn(&self, fut: impl std::future::Future<Output = ()> + 'static) {
        self.local.spawn_local(fut);
    }

    /// Runs a future to completion on this reactor's runtime, driving the
    /// pump tasks meanwhile. For setup paths (binding listeners); not for
    /// use from handlers.
    pub fn block_on<T>(&self, fut: impl std::future::Future<Output = T>) -> T {
        self.local.block_on(&self.rt, fut)
    }

    /// Dispatches events until [`stop`](Self::stop) is requested or a
    /// handler fails.
    pub fn run(&mut self) -> Result<(), ReactorError> {
        self.stop.set(false);
        loop {
            self.compact();
            if self.stop.get() {
                return Ok(());
            }
            let now = self.park();
            if self.stop.get() {
                return Ok(());
            }
            self.fire_timers(now)?;
            if self.stop.get() {
                return Ok(());
            }
            self.service_sockets()?;
            if self.stop.get() {
                return Ok(());
            }
        }
    }

    /// Parks on the runtime until an event may be ready, letting pump tasks
    /// move bytes meanwhile. Returns the wakeup time.
    fn park(&mut self) -> Instant {
        let ready = self.sockets.iter().any(|s| !s.removed && !s.queue.borrow().is_empty());
        let next_deadline =
            self.timers.iter().filter(|t| !t.removed).map(|t| t.deadline).min();
        let deadline = if ready { Some(Instant::now()) } else { next_deadline };
        let wake = Rc::clone(&self.wake);
        self.local.block_on(&self.rt, async move {
            match deadline {
                Some(d) => {
                    tokio::select! {
                        _ = wake.notified() => {}
                        _ = tokio::time::sleep_until(d) => {}
                    }
                }
                None => wake.notified().await,
            }
            Instant::now()
        })
    }

    fn compact(&mut self) {
        self.sockets.retain(|s| !s.removed);
        self.timers.retain(|t| !t.removed);
    }

    fn fire_timers(&mut self, now: Instant) -> Result<(), ReactorError> {
        let mut due: Vec<(Instant, TimerId)> = self
            .timers
            .iter()
            .filter(|t| !t.removed && t.deadline <= now)
            .map(|t| (t.deadline, t.id))
            .collect();
        due.sort();

        for (_, id) in due {
            let Some(slot) = self.timers.iter_mut().find(|t| t.id == id) else { continue };
            if slot.removed {
                continue;
            }
            let mut handler = slot.handler.take();
            // Reschedule against the previous deadline, not dispatch time.
            slot.deadline += slot.interval;
            if let Some(remaining) = slot.remaining.as_mut() {
                *remaining -= 1;
                if *remaining == 0 {
                    slot.removed = true;
                }
            }

            let result = match handler.as_mut() {
                Some(h) => h(self, id),
                None => Ok(()),
            };

            if let Some(slot) = self.timers.iter_mut().find(|t| t.id == id) {
                if !slot.removed && slot.handler.is_none() {
                    slot.handler = handler;
                }
            }
            result.map_err(ReactorError::Handler)?;
            if self.stop.get() {
                return Ok(());
            }
        }
        Ok(())
    }

    fn service_sockets(&mut self) -> Result<(), ReactorError> {
        let mut index = 0;
        while index < self.sockets.len() {
            let id = self.sockets[index].id;
            if self.sockets[index].removed {
                index += 1;
                continue;
            }
            let mut handler = self.sockets[index].handler.take();
            let queue = Rc::clone(&self.sockets[index].queue);

            let mut result = Ok(());
            if let Some(h) = handler.as_mut() {
                loop {
                    let event = queue.borrow_mut().pop_front();
                    let Some(event) = event else { break };
                    if self.socket_is_gone(id) {
                        break;
                    }
                    result = h(self, id, event);
                    if result.is_err() || self.stop.get() {
                        break;
                    }
                }
            }

            if let Some(slot) = self.sockets.iter_mut().find(|s| s.id == id) {
                if !slot.removed && slot.handler.is_none() {
                    slot.handler = handler;
                }
            }
            result.map_err(ReactorError::Handler)?;
            if self.stop.get() {
                return Ok(());
            }
            index += 1;
        }
        Ok(())
    }

    fn socket_is_gone(&self, id: SocketId) -> bool {
        self.sockets.iter().find(|s| s.id == id).map_or(true, |s| s.removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe;

    #[test]
    fn one_shot_timer_fires_once() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let counter = Rc::clone(&fired);
        reactor.add_timer(
            Duration::from_millis(1),
            Some(1),
            Box::new(move |r, _| {
                counter.set(counter.get() + 1);
                r.stop();
                Ok(())
            }),
        );
        reactor.run().unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn periodic_timer_respects_count() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let counter = Rc::clone(&fired);
        reactor.add_timer(
            Duration::from_millis(1),
            Some(3),
            Box::new(move |_, _| {
                counter.set(counter.get() + 1);
                Ok(())
            }),
        );
        // Backstop: stop well after the three firings.
        reactor.add_timer(
            Duration::from_millis(20),
            Some(1),
            Box::new(|r, _| {
                r.stop();
                Ok(())
            }),
        );
        reactor.run().unwrap();
        assert_eq!(fired.get(), 3);
    }

    #[test]
    fn sockets_are_serviced_in_registration_order() {
        let mut reactor = Reactor::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = Rc::clone(&order);
        let (_, first) = pipe::pair(
            &mut reactor,
            Box::new(move |_, _, _| {
                o1.borrow_mut().push("first");
                Ok(())
            }),
            Box::new(|_, _, _| Ok(())),
        );
        let o2 = Rc::clone(&order);
        let (_, second) = pipe::pair(
            &mut reactor,
            Box::new(move |r, _, _| {
                o2.borrow_mut().push("second");
                r.stop();
                Ok(())
            }),
            Box::new(|_, _, _| Ok(())),
        );

        // Push to the later-registered socket first; dispatch must still be
        // in registration order.
        second.1.send_to_peer(Message::from_frames(vec![Bytes::from_static(b"b")]));
        first.1.send_to_peer(Message::from_frames(vec![Bytes::from_static(b"a")]));

        reactor.run().unwrap();
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn handler_error_aborts_run() {
        let mut reactor = Reactor::new().unwrap();
        reactor.add_timer(
            Duration::from_millis(1),
            Some(1),
            Box::new(|_, _| Err("boom".into())),
        );
        let err = reactor.run().unwrap_err();
        assert!(matches!(err, ReactorError::Handler(_)));
    }

    #[test]
    fn remove_socket_from_handler_drops_pending_events() {
        let mut reactor = Reactor::new().unwrap();
        let calls = Rc::new(Cell::new(0));
        let c = Rc::clone(&calls);
        let (a, b) = pipe::pair(
            &mut reactor,
            Box::new(move |r: &mut Reactor, id, _| {
                c.set(c.get() + 1);
                r.remove_socket(id);
                Ok(())
            }),
            Box::new(|_, _, _| Ok(())),
        );
        let _ = a;
        // Two pending events, but the handler unregisters after the first.
        b.1.send_to_peer(Message::from_frames(vec![Bytes::from_static(b"x")]));
        b.1.send_to_peer(Message::from_frames(vec![Bytes::from_static(b"y")]));
        reactor.add_timer(
            Duration::from_millis(10),
            Some(1),
            Box::new(|r, _| {
                r.stop();
                Ok(())
            }),
        );
        reactor.run().unwrap();
        assert_eq!(calls.get(), 1);
    }
}
