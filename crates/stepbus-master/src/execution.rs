//! The master-facing programmatic surface: one process, one execution.
//!
//! `Execution` owns the reactor and the [`ExecutionManager`]. Every command
//! exists in two flavors: the asynchronous form completes via callbacks in
//! reactor dispatch, and the `_sync` form runs the reactor until the overall
//! callback fires, which is usually what a simulation driver wants.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use stepbus_model::{SlaveId, StepId, TimePoint};
use stepbus_net::Reactor;

use crate::{
    AddedSlave, BusError, CompletionHandler, ExecutionManager, ExecutionState,
    ReconstituteSlaveHandler, SlaveConfig, SlaveLifecycle, SlaveResultHandler, SlaveStepHandler,
    StepCompletionHandler, StepResult,
};

/// How long Terminate keeps the reactor alive so the TERMINATE broadcasts
/// actually leave the process.
const TERMINATE_GRACE: Duration = Duration::from_millis(100);

/// One execution, driven from one master process.
pub struct Execution {
    reactor: Reactor,
    manager: ExecutionManager,
}

impl Execution {
    /// Creates an execution named `name` covering simulated time
    /// `[start_time, stop_time]`.
    pub fn new(name: &str, start_time: TimePoint, stop_time: TimePoint) -> Result<Self, BusError> {
        Ok(Self {
            reactor: Reactor::new()?,
            manager: ExecutionManager::new(name, start_time, stop_time),
        })
    }

    /// The underlying manager.
    pub fn manager(&self) -> &ExecutionManager {
        &self.manager
    }

    /// The reactor, for callers that drive the loop themselves.
    pub fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    /// The execution's logical state.
    pub fn state(&self) -> ExecutionState {
        self.manager.state()
    }

    /// Current simulated time.
    pub fn current_time(&self) -> TimePoint {
        self.manager.current_time()
    }

    /// The most recently issued step id.
    pub fn last_step_id(&self) -> StepId {
        self.manager.last_step_id()
    }

    /// A slave's lifecycle state, if it exists.
    pub fn slave_lifecycle(&self, slave: SlaveId) -> Option<SlaveLifecycle> {
        self.manager.slave_lifecycle(slave)
    }

    /// Asynchronous reconstitute; see [`ExecutionManager::reconstitute`].
    pub fn reconstitute(
        &mut self,
        slaves_to_add: Vec<AddedSlave>,
        comm_timeout: Duration,
        on_slave: ReconstituteSlaveHandler,
        on_complete: CompletionHandler,
    ) -> Result<(), BusError> {
        self.manager.reconstitute(&mut self.reactor, slaves_to_add, comm_timeout, on_slave, on_complete)
    }

    /// Asynchronous reconfigure; see [`ExecutionManager::reconfigure`].
    pub fn reconfigure(
        &mut self,
        configs: Vec<SlaveConfig>,
        comm_timeout: Duration,
        on_slave: SlaveResultHandler,
        on_complete: CompletionHandler,
    ) -> Result<(), BusError> {
        self.manager.reconfigure(&mut self.reactor, configs, comm_timeout, on_slave, on_complete)
    }

    /// Asynchronous step; see [`ExecutionManager::step`].
    pub fn step(
        &mut self,
        step_size: f64,
        comm_timeout: Duration,
        on_slave: SlaveStepHandler,
        on_complete: StepCompletionHandler,
    ) -> Result<(), BusError> {
        self.manager.step(&mut self.reactor, step_size, comm_timeout, on_slave, on_complete)
    }

    /// Asynchronous accept; see [`ExecutionManager::accept_step`].
    pub fn accept_step(
        &mut self,
        comm_timeout: Duration,
        on_slave: SlaveResultHandler,
        on_complete: CompletionHandler,
    ) -> Result<(), BusError> {
        self.manager.accept_step(&mut self.reactor, comm_timeout, on_slave, on_complete)
    }

    /// Adds slaves and waits for every one of them. Returns the assigned
    /// ids in batch order, or the first per-slave error.
    pub fn reconstitute_sync(
        &mut self,
        slaves_to_add: Vec<AddedSlave>,
        comm_timeout: Duration,
    ) -> Result<Vec<SlaveId>, BusError> {
        let count = slaves_to_add.len();
        let results: Rc<RefCell<Vec<Option<Result<SlaveId, BusError>>>>> =
            Rc::new(RefCell::new(vec![None; count]));
        let overall: Rc<RefCell<Option<Result<(), BusError>>>> = Rc::new(RefCell::new(None));

        let per_slave = {
            let results = Rc::clone(&results);
            Box::new(move |_: &mut Reactor, index: usize, result: Result<SlaveId, BusError>| {
                results.borrow_mut()[index] = Some(result);
            })
        };
        let on_complete = {
            let overall = Rc::clone(&overall);
            let stop = self.reactor.stop_token();
            Box::new(move |_: &mut Reactor, result: Result<(), BusError>| {
                *overall.borrow_mut() = Some(result);
                stop.stop();
            })
        };

        self.manager.reconstitute(
            &mut self.reactor,
            slaves_to_add,
            comm_timeout,
            per_slave,
            on_complete,
        )?;
        self.run_to_completion()?;

        take_overall(&overall)??;
        let mut ids = Vec::with_capacity(count);
        for result in results.borrow_mut().drain(..) {
            ids.push(result.ok_or_else(incomplete)??);
        }
        Ok(ids)
    }

    /// Reconfigures and waits. The first per-slave error, if any, is
    /// returned.
    pub fn reconfigure_sync(
        &mut self,
        configs: Vec<SlaveConfig>,
        comm_timeout: Duration,
    ) -> Result<(), BusError> {
        let failed: Rc<RefCell<Option<BusError>>> = Rc::new(RefCell::new(None));
        let overall: Rc<RefCell<Option<Result<(), BusError>>>> = Rc::new(RefCell::new(None));

        let per_slave = {
            let failed = Rc::clone(&failed);
            Box::new(move |_: &mut Reactor, _: SlaveId, result: Result<(), BusError>| {
                if let Err(e) = result {
                    failed.borrow_mut().get_or_insert(e);
                }
            })
        };
        let on_complete = {
            let overall = Rc::clone(&overall);
            let stop = self.reactor.stop_token();
            Box::new(move |_: &mut Reactor, result: Result<(), BusError>| {
                *overall.borrow_mut() = Some(result);
                stop.stop();
            })
        };

        self.manager.reconfigure(&mut self.reactor, configs, comm_timeout, per_slave, on_complete)?;
        self.run_to_completion()?;

        take_overall(&overall)??;
        let taken = failed.borrow_mut().take();
        match taken {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Performs one step and waits for the barrier.
    pub fn step_sync(
        &mut self,
        step_size: f64,
        comm_timeout: Duration,
    ) -> Result<StepResult, BusError> {
        let overall: Rc<RefCell<Option<Result<StepResult, BusError>>>> =
            Rc::new(RefCell::new(None));
        let on_complete = {
            let overall = Rc::clone(&overall);
            let stop = self.reactor.stop_token();
            Box::new(move |_: &mut Reactor, result: Result<StepResult, BusError>| {
                *overall.borrow_mut() = Some(result);
                stop.stop();
            })
        };

        self.manager.step(
            &mut self.reactor,
            step_size,
            comm_timeout,
            Box::new(|_, _, _| {}),
            on_complete,
        )?;
        self.run_to_completion()?;
        take_overall(&overall)?
    }

    /// Commits the pending step and waits for the barrier.
    pub fn accept_step_sync(&mut self, comm_timeout: Duration) -> Result<(), BusError> {
        let overall: Rc<RefCell<Option<Result<(), BusError>>>> = Rc::new(RefCell::new(None));
        let on_complete = {
            let overall = Rc::clone(&overall);
            let stop = self.reactor.stop_token();
            Box::new(move |_: &mut Reactor, result: Result<(), BusError>| {
                *overall.borrow_mut() = Some(result);
                stop.stop();
            })
        };

        self.manager.accept_step(
            &mut self.reactor,
            comm_timeout,
            Box::new(|_, _, _| {}),
            on_complete,
        )?;
        self.run_to_completion()?;
        take_overall(&overall)?
    }

    /// Ends the execution and gives the TERMINATE broadcasts a moment to
    /// leave the process.
    pub fn terminate(&mut self) -> Result<(), BusError> {
        self.manager.terminate(&mut self.reactor)?;
        self.reactor.add_timer(
            TERMINATE_GRACE,
            Some(1),
            Box::new(|reactor, _| {
                reactor.stop();
                Ok(())
            }),
        );
        self.run_to_completion()
    }

    fn run_to_completion(&mut self) -> Result<(), BusError> {
        self.reactor.run().map_err(|e| BusError::Net(e.to_string()))
    }
}

fn take_overall<T>(
    overall: &Rc<RefCell<Option<Result<T, BusError>>>>,
) -> Result<Result<T, BusError>, BusError> {
    overall.borrow_mut().take().ok_or_else(incomplete)
}

fn incomplete() -> BusError {
    BusError::Net("reactor stopped before the operation completed".into())
}
