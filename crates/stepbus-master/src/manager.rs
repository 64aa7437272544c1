//! The execution manager: master-side orchestration across all slaves.
//!
//! The manager is a state machine over the whole execution. Each command
//! fans out per-slave requests through the slave controllers, joins the
//! replies with a [`Barrier`], and only then moves to the next state. The
//! allowed commands per state:
//!
//! | state      | reconstitute | reconfigure | step | accept_step | terminate |
//! |------------|--------------|-------------|------|-------------|-----------|
//! | Ready      | yes          | yes         | yes  | no          | yes       |
//! | ConfigBusy | no           | no          | no   | no          | yes       |
//! | Primed     | yes          | yes         | yes  | no          | yes       |
//! | StepBusy   | no           | no          | no   | no          | yes       |
//! | StepOk     | no           | no          | no   | yes         | yes       |
//! | StepFailed | no           | no          | no   | no          | yes       |
//! | Terminated | no           | no          | no   | no          | no        |
//!
//! Simulated time never advances on `step`; it advances only when
//! `accept_step` completes across every slave that stepped.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use stepbus_model::{
    is_valid_slave_name, validate_connection, ConnectionChange, SlaveDescription, SlaveId, StepId,
    TimeDuration, TimePoint, VariableSetting, NO_STEP_ID,
};
use stepbus_net::{Reactor, SlaveLocator};
use stepbus_proto::control::{ConnectVars, Hello, InputConnection, SetVars, Setup, Step};
use stepbus_proto::{ControlReply, ControlRequest, PROTOCOL_VERSION};
use tracing::{debug, info, warn};

use crate::{BusError, SlaveController};

/// The manager's logical state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Fresh execution, nothing outstanding.
    Ready,
    /// A reconstitute/reconfigure/accept barrier is outstanding.
    ConfigBusy,
    /// Configured and ready to step.
    Primed,
    /// A step barrier is outstanding.
    StepBusy,
    /// The last step completed everywhere; awaiting accept.
    StepOk,
    /// The last step was rejected or lost slaves.
    StepFailed,
    /// The execution is over.
    Terminated,
}

fn state_name(state: ExecutionState) -> &'static str {
    match state {
        ExecutionState::Ready => "Ready",
        ExecutionState::ConfigBusy => "ConfigBusy",
        ExecutionState::Primed => "Primed",
        ExecutionState::StepBusy => "StepBusy",
        ExecutionState::StepOk => "StepOk",
        ExecutionState::StepFailed => "StepFailed",
        ExecutionState::Terminated => "Terminated",
    }
}

/// One slave's lifecycle as seen from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveLifecycle {
    /// Set up and between steps.
    Ready,
    /// A STEP is outstanding.
    Stepping,
    /// Replied STEP_OK, awaiting accept.
    StepOk,
    /// Rejected the last step.
    StepFailed,
    /// Told to terminate.
    Terminated,
    /// Lost: timed out, failed fatally, or broke protocol.
    Disconnected,
}

/// The overall outcome of a step barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// Every slave completed the step.
    Complete,
    /// At least one slave wanted a smaller step; none were lost.
    Rejected,
}

/// A slave to add via reconstitute.
#[derive(Debug, Clone)]
pub struct AddedSlave {
    /// The slave's name in the execution; a unique identifier.
    pub name: String,
    /// The uuid of the slave type the master expects there.
    pub uuid: String,
    /// Where the slave is listening.
    pub locator: SlaveLocator,
}

/// Per-slave reconfiguration: value and connection changes.
#[derive(Debug, Clone)]
pub struct SlaveConfig {
    /// The slave being reconfigured.
    pub slave: SlaveId,
    /// The changes, applied in order.
    pub settings: Vec<VariableSetting>,
}

/// Everything the master tracks about one slave.
pub struct SlaveRecord {
    /// The control-channel proxy.
    pub controller: SlaveController,
    /// Where the slave is reachable.
    pub locator: SlaveLocator,
    /// Identity and type description.
    pub description: SlaveDescription,
    /// Lifecycle state.
    pub lifecycle: SlaveLifecycle,
}

/// Per-slave completion handler for reconstitute; called with the batch
/// index and the assigned id.
pub type ReconstituteSlaveHandler =
    Box<dyn FnMut(&mut Reactor, usize, Result<SlaveId, BusError>)>;

/// Per-slave completion handler for reconfigure/accept.
pub type SlaveResultHandler = Box<dyn FnMut(&mut Reactor, SlaveId, Result<(), BusError>)>;

/// Per-slave completion handler for step.
pub type SlaveStepHandler =
    Box<dyn FnMut(&mut Reactor, SlaveId, Result<StepResult, BusError>)>;

/// Overall completion handler.
pub type CompletionHandler = Box<dyn FnOnce(&mut Reactor, Result<(), BusError>)>;

/// Overall completion handler for step.
pub type StepCompletionHandler = Box<dyn FnOnce(&mut Reactor, Result<StepResult, BusError>)>;

/// How one slave's part of a barrier ended.
enum OpOutcome {
    Ok,
    Rejected,
    Failed(BusError),
}

/// The join point for one fan-out: N outstanding slave operations, one
/// completion closure. Taking the closure out before invoking it makes a
/// double fire impossible.
struct Barrier {
    remaining: usize,
    ok: usize,
    rejected: usize,
    first_error: Option<BusError>,
    on_complete: Option<Box<dyn FnOnce(&mut Reactor, BarrierResult)>>,
}

/// What a completed (or aborted) barrier saw.
struct BarrierResult {
    aborted: bool,
    ok: usize,
    rejected: usize,
    first_error: Option<BusError>,
}

struct ManagerInner {
    execution_name: String,
    start_time: TimePoint,
    stop_time: TimePoint,
    current_time: TimePoint,
    last_step_id: StepId,
    last_step_size: Option<TimeDuration>,
    next_slave_id: SlaveId,
    slaves: BTreeMap<SlaveId, SlaveRecord>,
    state: ExecutionState,
    barrier: Option<Barrier>,
}

/// Master-side orchestration across all slaves of one execution.
///
/// All methods are asynchronous: they fan out requests and complete through
/// callbacks in reactor dispatch. State-table violations and invalid
/// arguments fail synchronously.
#[derive(Clone)]
pub struct ExecutionManager {
    inner: Rc<RefCell<ManagerInner>>,
}

impl ExecutionManager {
    /// Creates a manager for an execution spanning `[start_time, stop_time]`.
    pub fn new(execution_name: &str, start_time: TimePoint, stop_time: TimePoint) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ManagerInner {
                execution_name: execution_name.to_string(),
                start_time,
                stop_time,
                current_time: start_time,
                last_step_id: NO_STEP_ID,
                last_step_size: None,
                next_slave_id: 0,
                slaves: BTreeMap::new(),
                state: ExecutionState::Ready,
                barrier: None,
            })),
        }
    }

    /// The manager's logical state.
    pub fn state(&self) -> ExecutionState {
        self.inner.borrow().state
    }

    /// Current simulated time.
    pub fn current_time(&self) -> TimePoint {
        self.inner.borrow().current_time
    }

    /// The most recently issued step id.
    pub fn last_step_id(&self) -> StepId {
        self.inner.borrow().last_step_id
    }

    /// The ids of all known slaves, in assignment order.
    pub fn slave_ids(&self) -> Vec<SlaveId> {
        self.inner.borrow().slaves.keys().copied().collect()
    }

    /// A slave's lifecycle state, if it exists.
    pub fn slave_lifecycle(&self, slave: SlaveId) -> Option<SlaveLifecycle> {
        self.inner.borrow().slaves.get(&slave).map(|r| r.lifecycle)
    }

    /// A slave's name, if it exists.
    pub fn slave_name(&self, slave: SlaveId) -> Option<String> {
        self.inner.borrow().slaves.get(&slave).map(|r| r.description.name.clone())
    }

    /// Adds new slaves to the execution: connects, greets, sets up and
    /// describes each one in parallel, with `comm_timeout` bounding the
    /// total wait per slave. Slaves that fail are reported individually and
    /// not added.
    pub fn reconstitute(
        &self,
        reactor: &mut Reactor,
        slaves_to_add: Vec<AddedSlave>,
        comm_timeout: Duration,
        on_slave: ReconstituteSlaveHandler,
        on_complete: CompletionHandler,
    ) -> Result<(), BusError> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.require_state(&[ExecutionState::Ready, ExecutionState::Primed])?;

            let mut batch_names: Vec<&str> = Vec::new();
            for added in &slaves_to_add {
                let taken = inner.slaves.values().any(|r| r.description.name == added.name)
                    || batch_names.contains(&added.name.as_str());
                if !is_valid_slave_name(&added.name) || taken {
                    return Err(BusError::BadSlaveName(added.name.clone()));
                }
                batch_names.push(&added.name);
            }

            info!(count = slaves_to_add.len(), "reconstituting");
            inner.state = ExecutionState::ConfigBusy;
            inner.begin_barrier(slaves_to_add.len());
        }

        let weak = Rc::downgrade(&self.inner);
        let on_slave = Rc::new(RefCell::new(on_slave));
        self.install_completion(
            reactor,
            Box::new(move |reactor, result| {
                if let Some(inner) = weak.upgrade() {
                    if !result.aborted {
                        inner.borrow_mut().state = ExecutionState::Primed;
                    }
                }
                let overall = if result.aborted { Err(BusError::Aborted) } else { Ok(()) };
                on_complete(reactor, overall);
            }),
        );

        for (index, added) in slaves_to_add.into_iter().enumerate() {
            self.reconstitute_one(reactor, index, added, comm_timeout, Rc::clone(&on_slave));
        }
        Ok(())
    }

    fn reconstitute_one(
        &self,
        reactor: &mut Reactor,
        index: usize,
        added: AddedSlave,
        comm_timeout: Duration,
        on_slave: Rc<RefCell<ReconstituteSlaveHandler>>,
    ) {
        let weak = Rc::downgrade(&self.inner);
        let started = Instant::now();

        let controller = match SlaveController::connect(reactor, &added.locator.control, &added.name)
        {
            Ok(controller) => controller,
            Err(e) => {
                let error = BusError::InstantiationFailed(e.to_string());
                let weak = weak.clone();
                reactor.post(move |reactor| {
                    finish_reconstitute(reactor, &weak, &on_slave, index, Err(error));
                    Ok(())
                });
                return;
            }
        };

        let hello = ControlRequest::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            slave_uuid: added.uuid.clone(),
        });
        let setup_chain = {
            let weak = weak.clone();
            let on_slave = Rc::clone(&on_slave);
            let controller = controller.clone();
            Box::new(move |reactor: &mut Reactor, result: Result<ControlReply, BusError>| {
                if let Err(e) = result {
                    finish_reconstitute(reactor, &weak, &on_slave, index, Err(map_add_error(e)));
                    return;
                }
                let Some(inner) = weak.upgrade() else { return };
                let (slave_id, setup) = {
                    let mut m = inner.borrow_mut();
                    m.next_slave_id += 1;
                    let slave_id = m.next_slave_id;
                    let setup = Setup {
                        slave_id,
                        start_time: m.start_time,
                        stop_time: m.stop_time,
                        execution_name: m.execution_name.clone(),
                        slave_name: added.name.clone(),
                        comm_timeout_ms: comm_timeout.as_millis() as u64,
                    };
                    (slave_id, setup)
                };

                let describe_chain = {
                    let weak = weak.clone();
                    let on_slave = Rc::clone(&on_slave);
                    let controller = controller.clone();
                    let added = added.clone();
                    Box::new(move |reactor: &mut Reactor, result: Result<ControlReply, BusError>| {
                        if let Err(e) = result {
                            finish_reconstitute(
                                reactor, &weak, &on_slave, index, Err(map_add_error(e)),
                            );
                            return;
                        }
                        let record_chain = {
                            let weak = weak.clone();
                            let on_slave = Rc::clone(&on_slave);
                            let controller = controller.clone();
                            Box::new(
                                move |reactor: &mut Reactor,
                                      result: Result<ControlReply, BusError>| {
                                    let described = match result {
                                        Ok(ControlReply::Description(td)) => Ok(td),
                                        Ok(_) => Err(BusError::ProtocolViolation(
                                            "DESCRIBE did not yield a description".into(),
                                        )),
                                        Err(e) => Err(map_add_error(e)),
                                    };
                                    let type_description = match described {
                                        Ok(type_description) => type_description,
                                        Err(error) => {
                                            finish_reconstitute(
                                                reactor, &weak, &on_slave, index, Err(error),
                                            );
                                            return;
                                        }
                                    };
                                    if let Some(inner) = weak.upgrade() {
                                        inner.borrow_mut().slaves.insert(
                                            slave_id,
                                            SlaveRecord {
                                                controller: controller.clone(),
                                                locator: added.locator.clone(),
                                                description: SlaveDescription {
                                                    id: slave_id,
                                                    name: added.name.clone(),
                                                    type_description,
                                                },
                                                lifecycle: SlaveLifecycle::Ready,
                                            },
                                        );
                                    }
                                    debug!(slave_id, name = %added.name, "slave added");
                                    finish_reconstitute(
                                        reactor, &weak, &on_slave, index, Ok(slave_id),
                                    );
                                },
                            )
                        };
                        let budget = remaining_budget(started, comm_timeout);
                        controller.send_command(
                            reactor,
                            ControlRequest::Describe,
                            budget,
                            record_chain,
                        );
                    })
                };
                let budget = remaining_budget(started, comm_timeout);
                controller.send_command(
                    reactor,
                    ControlRequest::Setup(setup),
                    budget,
                    describe_chain,
                );
            })
        };
        controller.send_command(reactor, hello, comm_timeout, setup_chain);
    }

    /// Applies value and connection changes to the named slaves, one
    /// combined SET_VARS/CONNECT_VARS pair per slave.
    pub fn reconfigure(
        &self,
        reactor: &mut Reactor,
        configs: Vec<SlaveConfig>,
        comm_timeout: Duration,
        on_slave: SlaveResultHandler,
        on_complete: CompletionHandler,
    ) -> Result<(), BusError> {
        let plans = {
            let mut inner = self.inner.borrow_mut();
            inner.require_state(&[ExecutionState::Ready, ExecutionState::Primed])?;
            let plans = inner.plan_reconfigure(&configs)?;
            info!(count = plans.len(), "reconfiguring");
            inner.state = ExecutionState::ConfigBusy;
            inner.begin_barrier(plans.len());
            plans
        };

        let weak = Rc::downgrade(&self.inner);
        self.install_completion(
            reactor,
            Box::new(move |reactor, result| {
                if let Some(inner) = weak.upgrade() {
                    if !result.aborted {
                        inner.borrow_mut().state = ExecutionState::Primed;
                    }
                }
                let overall = if result.aborted { Err(BusError::Aborted) } else { Ok(()) };
                on_complete(reactor, overall);
            }),
        );

        let on_slave = Rc::new(RefCell::new(on_slave));
        let weak = Rc::downgrade(&self.inner);
        for plan in plans {
            let commands = plan.commands();
            if commands.is_empty() {
                let weak = weak.clone();
                let on_slave = Rc::clone(&on_slave);
                reactor.post(move |reactor| {
                    finish_slave_op(reactor, &weak, &on_slave, plan.slave, Ok(()));
                    Ok(())
                });
                continue;
            }
            let last = commands.len() - 1;
            for (position, request) in commands.into_iter().enumerate() {
                let callback: crate::controller::ReplyCallback = if position == last {
                    let weak = weak.clone();
                    let on_slave = Rc::clone(&on_slave);
                    let slave = plan.slave;
                    Box::new(move |reactor, result| {
                        finish_slave_op(reactor, &weak, &on_slave, slave, result.map(|_| ()));
                    })
                } else {
                    // Intermediate command; a failure here also fails the
                    // final one through the controller's queue, which is
                    // where the barrier is notified.
                    Box::new(|_, _| {})
                };
                plan.controller.send_command(reactor, request, comm_timeout, callback);
            }
        }
        Ok(())
    }

    /// Issues `STEP` to every ready slave. Simulated time does not advance;
    /// that happens at `accept_step`.
    pub fn step(
        &self,
        reactor: &mut Reactor,
        step_size: TimeDuration,
        comm_timeout: Duration,
        on_slave: SlaveStepHandler,
        on_complete: StepCompletionHandler,
    ) -> Result<(), BusError> {
        let (step_id, current_time, targets) = {
            let mut inner = self.inner.borrow_mut();
            inner.require_state(&[ExecutionState::Ready, ExecutionState::Primed])?;
            if step_size.is_nan() || step_size <= 0.0 {
                return Err(BusError::InvalidStepSize(step_size));
            }
            if inner.current_time + step_size > inner.stop_time {
                return Err(BusError::TimeOutOfRange {
                    current_time: inner.current_time,
                    step_size,
                    stop_time: inner.stop_time,
                });
            }

            inner.last_step_id += 1;
            inner.last_step_size = Some(step_size);
            let step_id = inner.last_step_id;
            let current_time = inner.current_time;

            let targets: Vec<(SlaveId, SlaveController)> = inner
                .slaves
                .iter_mut()
                .filter(|(_, r)| r.lifecycle == SlaveLifecycle::Ready)
                .map(|(id, r)| {
                    r.lifecycle = SlaveLifecycle::Stepping;
                    (*id, r.controller.clone())
                })
                .collect();

            info!(step_id, current_time, step_size, targets = targets.len(), "stepping");
            inner.state = ExecutionState::StepBusy;
            inner.begin_barrier(targets.len());
            (step_id, current_time, targets)
        };

        let weak = Rc::downgrade(&self.inner);
        self.install_completion(
            reactor,
            Box::new(move |reactor, result| {
                let outcome = if result.aborted {
                    Err(BusError::Aborted)
                } else if let Some(error) = result.first_error {
                    if let Some(inner) = weak.upgrade() {
                        inner.borrow_mut().state = ExecutionState::StepFailed;
                    }
                    Err(error)
                } else if result.rejected > 0 {
                    if let Some(inner) = weak.upgrade() {
                        inner.borrow_mut().state = ExecutionState::StepFailed;
                    }
                    Ok(StepResult::Rejected)
                } else {
                    if let Some(inner) = weak.upgrade() {
                        inner.borrow_mut().state = ExecutionState::StepOk;
                    }
                    Ok(StepResult::Complete)
                };
                on_complete(reactor, outcome);
            }),
        );

        let on_slave = Rc::new(RefCell::new(on_slave));
        for (slave_id, controller) in targets {
            let weak = Rc::downgrade(&self.inner);
            let on_slave = Rc::clone(&on_slave);
            let request = ControlRequest::Step(Step { step_id, current_time, step_size });
            controller.send_command(
                reactor,
                request,
                comm_timeout,
                Box::new(move |reactor, result| {
                    let (per_slave, outcome, lifecycle) = match result {
                        Ok(ControlReply::StepOk) => {
                            (Ok(StepResult::Complete), OpOutcome::Ok, SlaveLifecycle::StepOk)
                        }
                        Ok(ControlReply::StepFailed) => (
                            Ok(StepResult::Rejected),
                            OpOutcome::Rejected,
                            SlaveLifecycle::StepFailed,
                        ),
                        Ok(_) => {
                            let e = BusError::ProtocolViolation("unexpected STEP reply".into());
                            (Err(e.clone()), OpOutcome::Failed(e), SlaveLifecycle::Disconnected)
                        }
                        Err(e) => {
                            (Err(e.clone()), OpOutcome::Failed(e), SlaveLifecycle::Disconnected)
                        }
                    };
                    if let Some(inner) = weak.upgrade() {
                        if let Some(record) = inner.borrow_mut().slaves.get_mut(&slave_id) {
                            record.lifecycle = lifecycle;
                        }
                    }
                    (*on_slave.borrow_mut())(reactor, slave_id, per_slave);
                    op_complete(&weak, reactor, outcome);
                }),
            );
        }
        Ok(())
    }

    /// Commits the pending step at every slave that completed it. On
    /// universal success simulated time advances by the step size.
    pub fn accept_step(
        &self,
        reactor: &mut Reactor,
        comm_timeout: Duration,
        on_slave: SlaveResultHandler,
        on_complete: CompletionHandler,
    ) -> Result<(), BusError> {
        let targets = {
            let mut inner = self.inner.borrow_mut();
            inner.require_state(&[ExecutionState::StepOk])?;

            let targets: Vec<(SlaveId, SlaveController)> = inner
                .slaves
                .iter()
                .filter(|(_, r)| r.lifecycle == SlaveLifecycle::StepOk)
                .map(|(id, r)| (*id, r.controller.clone()))
                .collect();

            info!(step_id = inner.last_step_id, targets = targets.len(), "accepting step");
            inner.state = ExecutionState::ConfigBusy;
            inner.begin_barrier(targets.len());
            targets
        };

        let weak = Rc::downgrade(&self.inner);
        self.install_completion(
            reactor,
            Box::new(move |reactor, result| {
                let outcome = if result.aborted {
                    Err(BusError::Aborted)
                } else if let Some(error) = result.first_error {
                    if let Some(inner) = weak.upgrade() {
                        inner.borrow_mut().state = ExecutionState::StepFailed;
                    }
                    Err(error)
                } else {
                    if let Some(inner) = weak.upgrade() {
                        let mut m = inner.borrow_mut();
                        if let Some(step_size) = m.last_step_size.take() {
                            m.current_time += step_size;
                        }
                        m.state = ExecutionState::Ready;
                        debug!(current_time = m.current_time, "step accepted");
                    }
                    Ok(())
                };
                on_complete(reactor, outcome);
            }),
        );

        let on_slave = Rc::new(RefCell::new(on_slave));
        for (slave_id, controller) in targets {
            let weak = Rc::downgrade(&self.inner);
            let on_slave = Rc::clone(&on_slave);
            controller.send_command(
                reactor,
                ControlRequest::AcceptStep,
                comm_timeout,
                Box::new(move |reactor, result| {
                    let (per_slave, outcome, lifecycle) = match result {
                        Ok(_) => (Ok(()), OpOutcome::Ok, SlaveLifecycle::Ready),
                        Err(e) => {
                            (Err(e.clone()), OpOutcome::Failed(e), SlaveLifecycle::Disconnected)
                        }
                    };
                    if let Some(inner) = weak.upgrade() {
                        if let Some(record) = inner.borrow_mut().slaves.get_mut(&slave_id) {
                            record.lifecycle = lifecycle;
                        }
                    }
                    (*on_slave.borrow_mut())(reactor, slave_id, per_slave);
                    op_complete(&weak, reactor, outcome);
                }),
            );
        }
        Ok(())
    }

    /// Ends the execution: broadcasts TERMINATE to every reachable slave and
    /// aborts any outstanding barrier. Pending per-slave callbacks fire with
    /// `Aborted`, then the overall callback, exactly once each.
    pub fn terminate(&self, reactor: &mut Reactor) -> Result<(), BusError> {
        let (controllers, barrier) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == ExecutionState::Terminated {
                return Err(BusError::InvalidCommand(state_name(inner.state)));
            }
            info!("terminating execution");
            inner.state = ExecutionState::Terminated;

            let mut controllers = Vec::new();
            for record in inner.slaves.values_mut() {
                if record.lifecycle != SlaveLifecycle::Disconnected {
                    record.lifecycle = SlaveLifecycle::Terminated;
                    controllers.push(record.controller.clone());
                }
            }
            (controllers, inner.barrier.take())
        };

        for controller in controllers {
            controller.terminate(reactor);
        }

        if let Some(mut barrier) = barrier {
            if let Some(on_complete) = barrier.on_complete.take() {
                on_complete(
                    reactor,
                    BarrierResult {
                        aborted: true,
                        ok: barrier.ok,
                        rejected: barrier.rejected,
                        first_error: barrier.first_error,
                    },
                );
            }
        }
        Ok(())
    }

    /// Stores the completion closure for the barrier begun by the caller,
    /// completing immediately (via the reactor) when there is nothing
    /// outstanding.
    fn install_completion(
        &self,
        reactor: &mut Reactor,
        on_complete: Box<dyn FnOnce(&mut Reactor, BarrierResult)>,
    ) {
        let empty = {
            let mut inner = self.inner.borrow_mut();
            match inner.barrier.as_mut() {
                Some(barrier) => {
                    barrier.on_complete = Some(on_complete);
                    barrier.remaining == 0
                }
                None => false,
            }
        };
        if empty {
            let weak = Rc::downgrade(&self.inner);
            reactor.post(move |reactor| {
                complete_barrier_if_drained(&weak, reactor);
                Ok(())
            });
        }
    }
}

impl ManagerInner {
    fn require_state(&self, allowed: &[ExecutionState]) -> Result<(), BusError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(BusError::InvalidCommand(state_name(self.state)))
        }
    }

    fn begin_barrier(&mut self, count: usize) {
        debug_assert!(self.barrier.is_none(), "one barrier at a time");
        self.barrier = Some(Barrier {
            remaining: count,
            ok: 0,
            rejected: 0,
            first_error: None,
            on_complete: None,
        });
    }

    /// Validates a reconfigure batch and resolves it into per-slave command
    /// plans.
    fn plan_reconfigure(&self, configs: &[SlaveConfig]) -> Result<Vec<ReconfigurePlan>, BusError> {
        let mut plans = Vec::with_capacity(configs.len());
        for config in configs {
            let record =
                self.slaves.get(&config.slave).ok_or(BusError::UnknownSlave(config.slave))?;
            if record.lifecycle != SlaveLifecycle::Ready {
                return Err(BusError::SlaveNotReady(config.slave));
            }

            let mut values = Vec::new();
            let mut connections = Vec::new();
            let mut disconnects = Vec::new();
            for setting in &config.settings {
                let sink = record
                    .description
                    .type_description
                    .variable(setting.variable)
                    .ok_or_else(|| {
                        BusError::Model(format!(
                            "slave {} has no variable {}",
                            config.slave, setting.variable
                        ))
                    })?;

                if let Some(value) = &setting.value {
                    value
                        .expect_type(sink.data_type)
                        .map_err(|e| BusError::Model(e.to_string()))?;
                    values.push(VariableSetting {
                        variable: setting.variable,
                        value: Some(value.clone()),
                        connection: ConnectionChange::Unchanged,
                    });
                }

                match setting.connection {
                    ConnectionChange::Unchanged => {}
                    ConnectionChange::Connect(source) => {
                        let source_record = self
                            .slaves
                            .get(&source.slave)
                            .ok_or(BusError::UnknownSlave(source.slave))?;
                        let source_desc = source_record
                            .description
                            .type_description
                            .variable(source.variable)
                            .ok_or_else(|| {
                                BusError::Model(format!(
                                    "slave {} has no variable {}",
                                    source.slave, source.variable
                                ))
                            })?;
                        validate_connection(source_desc, sink)?;
                        connections.push(InputConnection {
                            input: setting.variable,
                            source,
                            source_data_pub: source_record.locator.data_pub.url(),
                        });
                    }
                    ConnectionChange::Disconnect => disconnects.push(setting.variable),
                }
            }

            plans.push(ReconfigurePlan {
                slave: config.slave,
                controller: record.controller.clone(),
                step_id: self.last_step_id,
                values,
                connections,
                disconnects,
            });
        }
        Ok(plans)
    }
}

struct ReconfigurePlan {
    slave: SlaveId,
    controller: SlaveController,
    step_id: StepId,
    values: Vec<VariableSetting>,
    connections: Vec<InputConnection>,
    disconnects: Vec<stepbus_model::VariableId>,
}

impl ReconfigurePlan {
    fn commands(&self) -> Vec<ControlRequest> {
        let mut commands = Vec::new();
        if !self.values.is_empty() {
            commands.push(ControlRequest::SetVars(SetVars {
                step_id: self.step_id,
                settings: self.values.clone(),
            }));
        }
        if !self.connections.is_empty() || !self.disconnects.is_empty() {
            commands.push(ControlRequest::ConnectVars(ConnectVars {
                connections: self.connections.clone(),
                disconnects: self.disconnects.clone(),
            }));
        }
        commands
    }
}

fn remaining_budget(started: Instant, total: Duration) -> Duration {
    total.saturating_sub(started.elapsed())
}

fn map_add_error(error: BusError) -> BusError {
    match error {
        BusError::Net(e) => BusError::InstantiationFailed(e),
        other => other,
    }
}

fn finish_reconstitute(
    reactor: &mut Reactor,
    weak: &Weak<RefCell<ManagerInner>>,
    on_slave: &Rc<RefCell<ReconstituteSlaveHandler>>,
    index: usize,
    result: Result<SlaveId, BusError>,
) {
    if let Err(e) = &result {
        warn!(index, error = %e, "slave not added");
    }
    let outcome = match &result {
        Ok(_) => OpOutcome::Ok,
        Err(e) => OpOutcome::Failed(e.clone()),
    };
    (*on_slave.borrow_mut())(reactor, index, result);
    op_complete(weak, reactor, outcome);
}

fn finish_slave_op(
    reactor: &mut Reactor,
    weak: &Weak<RefCell<ManagerInner>>,
    on_slave: &Rc<RefCell<SlaveResultHandler>>,
    slave: SlaveId,
    result: Result<(), BusError>,
) {
    let outcome = match &result {
        Ok(()) => OpOutcome::Ok,
        Err(e) => OpOutcome::Failed(e.clone()),
    };
    if result.is_err() {
        if let Some(inner) = weak.upgrade() {
            if let Some(record) = inner.borrow_mut().slaves.get_mut(&slave) {
                record.lifecycle = SlaveLifecycle::Disconnected;
            }
        }
    }
    (*on_slave.borrow_mut())(reactor, slave, result);
    op_complete(weak, reactor, outcome);
}

/// Counts one slave operation off the current barrier, firing the
/// completion closure when the last one lands.
fn op_complete(weak: &Weak<RefCell<ManagerInner>>, reactor: &mut Reactor, outcome: OpOutcome) {
    let Some(inner) = weak.upgrade() else { return };
    let finished = {
        let mut m = inner.borrow_mut();
        let Some(barrier) = m.barrier.as_mut() else { return };
        match outcome {
            OpOutcome::Ok => barrier.ok += 1,
            OpOutcome::Rejected => barrier.rejected += 1,
            OpOutcome::Failed(e) => {
                if barrier.first_error.is_none() {
                    barrier.first_error = Some(e);
                }
            }
        }
        barrier.remaining -= 1;
        if barrier.remaining == 0 { m.barrier.take() } else { None }
    };
    if let Some(mut barrier) = finished {
        if let Some(on_complete) = barrier.on_complete.take() {
            on_complete(
                reactor,
                BarrierResult {
                    aborted: false,
                    ok: barrier.ok,
                    rejected: barrier.rejected,
                    first_error: barrier.first_error,
                },
            );
        }
    }
}

fn complete_barrier_if_drained(weak: &Weak<RefCell<ManagerInner>>, reactor: &mut Reactor) {
    let Some(inner) = weak.upgrade() else { return };
    let finished = {
        let mut m = inner.borrow_mut();
        match m.barrier.as_ref() {
            Some(barrier) if barrier.remaining == 0 => m.barrier.take(),
            _ => None,
        }
    };
    if let Some(mut barrier) = finished {
        if let Some(on_complete) = barrier.on_complete.take() {
            on_complete(
                reactor,
                BarrierResult {
                    aborted: false,
                    ok: barrier.ok,
                    rejected: barrier.rejected,
                    first_error: barrier.first_error,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ExecutionManager {
        ExecutionManager::new("test", 0.0, 10.0)
    }

    fn sink(_: &mut Reactor, _: SlaveId, _: Result<(), BusError>) {}

    #[test]
    fn fresh_manager_is_ready_at_start_time() {
        let m = manager();
        assert_eq!(m.state(), ExecutionState::Ready);
        assert_eq!(m.current_time(), 0.0);
        assert_eq!(m.last_step_id(), NO_STEP_ID);
        assert!(m.slave_ids().is_empty());
    }

    #[test]
    fn accept_step_requires_step_ok() {
        let mut reactor = Reactor::new().unwrap();
        let m = manager();
        let result = m.accept_step(
            &mut reactor,
            Duration::from_secs(1),
            Box::new(sink),
            Box::new(|_, _| {}),
        );
        assert_eq!(result, Err(BusError::InvalidCommand("Ready")));
    }

    #[test]
    fn step_validates_size_and_time_range() {
        let mut reactor = Reactor::new().unwrap();
        let m = manager();

        let result = m.step(
            &mut reactor,
            0.0,
            Duration::from_secs(1),
            Box::new(|_, _, _| {}),
            Box::new(|_, _| {}),
        );
        assert_eq!(result, Err(BusError::InvalidStepSize(0.0)));

        let result = m.step(
            &mut reactor,
            11.0,
            Duration::from_secs(1),
            Box::new(|_, _, _| {}),
            Box::new(|_, _| {}),
        );
        assert!(matches!(result, Err(BusError::TimeOutOfRange { .. })));
    }

    #[test]
    fn reconstitute_rejects_bad_and_duplicate_names() {
        let mut reactor = Reactor::new().unwrap();
        let m = manager();
        let locator = SlaveLocator {
            control: stepbus_net::Endpoint::new("tcp", "127.0.0.1:1"),
            data_pub: stepbus_net::Endpoint::new("tcp", "127.0.0.1:2"),
        };

        let bad = vec![AddedSlave {
            name: "not a name".into(),
            uuid: String::new(),
            locator: locator.clone(),
        }];
        let result = m.reconstitute(
            &mut reactor,
            bad,
            Duration::from_secs(1),
            Box::new(|_, _, _| {}),
            Box::new(|_, _| {}),
        );
        assert!(matches!(result, Err(BusError::BadSlaveName(_))));

        let dup = vec![
            AddedSlave { name: "a".into(), uuid: String::new(), locator: locator.clone() },
            AddedSlave { name: "a".into(), uuid: String::new(), locator },
        ];
        let result = m.reconstitute(
            &mut reactor,
            dup,
            Duration::from_secs(1),
            Box::new(|_, _, _| {}),
            Box::new(|_, _| {}),
        );
        assert!(matches!(result, Err(BusError::BadSlaveName(_))));
    }

    #[test]
    fn terminate_is_final() {
        let mut reactor = Reactor::new().unwrap();
        let m = manager();
        m.terminate(&mut reactor).unwrap();
        assert_eq!(m.state(), ExecutionState::Terminated);

        assert_eq!(
            m.terminate(&mut reactor),
            Err(BusError::InvalidCommand("Terminated"))
        );
        let result = m.step(
            &mut reactor,
            0.1,
            Duration::from_secs(1),
            Box::new(|_, _, _| {}),
            Box::new(|_, _| {}),
        );
        assert_eq!(result, Err(BusError::InvalidCommand("Terminated")));
    }

    #[test]
    fn reconfigure_of_unknown_slave_fails_synchronously() {
        let mut reactor = Reactor::new().unwrap();
        let m = manager();
        let result = m.reconfigure(
            &mut reactor,
            vec![SlaveConfig { slave: 3, settings: vec![] }],
            Duration::from_secs(1),
            Box::new(sink),
            Box::new(|_, _| {}),
        );
        assert_eq!(result, Err(BusError::UnknownSlave(3)));
    }
}
