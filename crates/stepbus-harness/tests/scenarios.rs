//! End-to-end scenarios: a real master and real slaves over loopback TCP.
//!
//! Each test spawns slave threads bound to ephemeral ports, drives an
//! execution from the test thread, and checks the observable outcomes:
//! state transitions, simulated time, variable propagation, and how
//! failures and termination surface on both sides.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stepbus_harness::{init_test_logging, spawn_slave, MockSlave};
use stepbus_master::{
    AddedSlave, BusError, Execution, ExecutionState, SlaveController, SlaveLifecycle, StepResult,
};
use stepbus_model::{ScalarValue, Variable, VariableSetting};
use stepbus_net::Reactor;
use stepbus_proto::control::Hello;
use stepbus_proto::{ControlRequest, PROTOCOL_VERSION};
use stepbus_slave::{AgentError, SlaveError};

const COMM_TIMEOUT: Duration = Duration::from_secs(5);

const OUT_Y: u32 = 1;
const IN_X: u32 = 1;
const OUT_Z: u32 = 2;

fn added(slave: &stepbus_harness::TestSlave, uuid: &str) -> AddedSlave {
    AddedSlave { name: slave.name.clone(), uuid: uuid.to_string(), locator: slave.locator.clone() }
}

/// Scenario: two slaves, one connection. A value set on the source's output
/// is published at its first step and read by the sink's input at the next,
/// and simulated time advances only on accept.
#[test]
fn two_slave_feedforward_propagates_values() {
    init_test_logging();

    let source = MockSlave::new("source").with_real_output(OUT_Y, "out_y");
    let seen_inputs: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen_inputs);
    let sink = MockSlave::new("relay")
        .with_real_input(IN_X, "in_x")
        .with_real_output(OUT_Z, "out_z")
        .with_on_step(move |values, _, _| {
            if let Some(ScalarValue::Real(u)) = values.get(&IN_X).cloned() {
                recorder.lock().unwrap().push(u);
                values.insert(OUT_Z, ScalarValue::Real(u));
            }
        });

    let slave_a = spawn_slave("a", source);
    let slave_b = spawn_slave("b", sink);

    let mut exe = Execution::new("feedforward", 0.0, 1.0).unwrap();
    let ids = exe
        .reconstitute_sync(
            vec![added(&slave_a, "mock-source"), added(&slave_b, "mock-relay")],
            COMM_TIMEOUT,
        )
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(exe.state(), ExecutionState::Primed);

    exe.reconfigure_sync(
        vec![
            stepbus_master::SlaveConfig {
                slave: ids[0],
                settings: vec![VariableSetting::value(OUT_Y, 2.5)],
            },
            stepbus_master::SlaveConfig {
                slave: ids[1],
                settings: vec![VariableSetting::connect(IN_X, Variable::new(ids[0], OUT_Y))],
            },
        ],
        COMM_TIMEOUT,
    )
    .unwrap();

    // First step: the source publishes 2.5; time stands still until accept.
    let before = exe.current_time();
    assert_eq!(exe.step_sync(0.1, COMM_TIMEOUT).unwrap(), StepResult::Complete);
    assert_eq!(exe.current_time(), before);
    assert_eq!(exe.state(), ExecutionState::StepOk);

    exe.accept_step_sync(COMM_TIMEOUT).unwrap();
    assert!((exe.current_time() - (before + 0.1)).abs() < 1e-12);
    assert_eq!(exe.state(), ExecutionState::Ready);

    // Second step: the sink drains its mailbox and reads 2.5.
    assert_eq!(exe.step_sync(0.1, COMM_TIMEOUT).unwrap(), StepResult::Complete);
    exe.accept_step_sync(COMM_TIMEOUT).unwrap();

    exe.terminate().unwrap();
    assert_eq!(exe.state(), ExecutionState::Terminated);

    slave_a.join().unwrap();
    slave_b.join().unwrap();

    let seen = seen_inputs.lock().unwrap();
    assert_eq!(seen.as_slice(), &[0.0, 2.5]);
}

/// Scenario: a slave whose model rejects the step size. The step barrier
/// reports rejection, accept is refused, terminate still works.
#[test]
fn step_rejection_leaves_only_terminate() {
    init_test_logging();

    let fragile = MockSlave::new("fragile").with_max_step(0.05);
    let slave = spawn_slave("fragile", fragile);

    let mut exe = Execution::new("rejection", 0.0, 1.0).unwrap();
    exe.reconstitute_sync(vec![added(&slave, "mock-fragile")], COMM_TIMEOUT).unwrap();

    assert_eq!(exe.step_sync(0.1, COMM_TIMEOUT).unwrap(), StepResult::Rejected);
    assert_eq!(exe.state(), ExecutionState::StepFailed);

    // Only terminate is allowed now.
    assert!(matches!(
        exe.accept_step_sync(COMM_TIMEOUT),
        Err(BusError::InvalidCommand("StepFailed"))
    ));
    exe.terminate().unwrap();
    slave.join().unwrap();
}

/// Scenario: one slave is too slow for the step deadline. The overall step
/// fails with Timeout, the slow slave is disconnected, and the healthy
/// slave still completed its part.
#[test]
fn slow_slave_times_out_but_others_advance() {
    init_test_logging();

    let healthy = MockSlave::new("healthy").with_real_output(OUT_Y, "out_y");
    let sluggish = MockSlave::new("sluggish").with_step_delay(Duration::from_millis(600));

    let slave_ok = spawn_slave("healthy", healthy);
    let slave_slow = spawn_slave("sluggish", sluggish);

    let mut exe = Execution::new("slow", 0.0, 1.0).unwrap();
    let ids = exe
        .reconstitute_sync(
            vec![added(&slave_ok, "mock-healthy"), added(&slave_slow, "mock-sluggish")],
            Duration::from_millis(1200),
        )
        .unwrap();

    let per_slave: Rc<RefCell<Vec<(u16, Result<StepResult, BusError>)>>> =
        Rc::new(RefCell::new(Vec::new()));
    let overall: Rc<RefCell<Option<Result<StepResult, BusError>>>> = Rc::new(RefCell::new(None));

    {
        let per_slave = Rc::clone(&per_slave);
        let overall = Rc::clone(&overall);
        let stop = exe.reactor_mut().stop_token();
        exe.step(
            0.1,
            Duration::from_millis(200),
            Box::new(move |_, id, result| {
                per_slave.borrow_mut().push((id, result));
            }),
            Box::new(move |_, result| {
                *overall.borrow_mut() = Some(result);
                stop.stop();
            }),
        )
        .unwrap();
    }
    exe.reactor_mut().run().unwrap();

    assert_eq!(overall.borrow_mut().take(), Some(Err(BusError::Timeout)));
    assert_eq!(exe.state(), ExecutionState::StepFailed);
    assert_eq!(exe.slave_lifecycle(ids[1]), Some(SlaveLifecycle::Disconnected));

    let per_slave = per_slave.borrow();
    assert_eq!(per_slave.len(), 2);
    let healthy_result = per_slave.iter().find(|(id, _)| *id == ids[0]).unwrap();
    let slow_result = per_slave.iter().find(|(id, _)| *id == ids[1]).unwrap();
    assert_eq!(healthy_result.1, Ok(StepResult::Complete));
    assert_eq!(slow_result.1, Err(BusError::Timeout));

    exe.terminate().unwrap();
    slave_ok.join().unwrap();
    // The slow slave never hears TERMINATE (it is disconnected) and exits
    // through its own communications timeout.
    assert!(matches!(
        slave_slow.join(),
        Err(SlaveError::Agent(AgentError::Timeout(_)))
    ));
}

/// Scenario: the master advertises a protocol version the slave does not
/// speak. The dialog dies with FATAL(version) and the slave exits.
#[test]
fn protocol_version_mismatch_is_fatal() {
    init_test_logging();

    let slave = spawn_slave("plain", MockSlave::new("plain"));

    let mut reactor = Reactor::new().unwrap();
    let controller =
        SlaveController::connect(&mut reactor, &slave.locator.control, "plain").unwrap();

    let seen: Rc<RefCell<Option<Result<(), BusError>>>> = Rc::new(RefCell::new(None));
    {
        let seen = Rc::clone(&seen);
        let stop = reactor.stop_token();
        controller.send_command(
            &mut reactor,
            ControlRequest::Hello(Hello {
                protocol_version: PROTOCOL_VERSION + 1,
                slave_uuid: "mock-plain".into(),
            }),
            COMM_TIMEOUT,
            Box::new(move |_, result| {
                *seen.borrow_mut() = Some(result.map(|_| ()));
                stop.stop();
            }),
        );
    }
    reactor.run().unwrap();

    assert!(matches!(seen.borrow_mut().take(), Some(Err(BusError::VersionMismatch(_)))));
    assert!(matches!(
        slave.join(),
        Err(SlaveError::Agent(AgentError::VersionMismatch(v))) if v == PROTOCOL_VERSION + 1
    ));
}

/// Scenario: terminate lands while a step barrier is outstanding. Every
/// per-slave callback and the overall callback fire exactly once, with
/// Aborted.
#[test]
fn terminate_during_step_barrier_aborts_callbacks() {
    init_test_logging();

    let slaves: Vec<_> = (0..3)
        .map(|i| {
            spawn_slave(
                &format!("worker{i}"),
                MockSlave::new("worker").with_step_delay(Duration::from_millis(500)),
            )
        })
        .collect();

    let mut exe = Execution::new("abort", 0.0, 1.0).unwrap();
    let to_add = slaves.iter().map(|s| added(s, "mock-worker")).collect();
    exe.reconstitute_sync(to_add, COMM_TIMEOUT).unwrap();

    let per_slave: Rc<RefCell<Vec<Result<StepResult, BusError>>>> =
        Rc::new(RefCell::new(Vec::new()));
    let overall: Rc<RefCell<Vec<Result<StepResult, BusError>>>> =
        Rc::new(RefCell::new(Vec::new()));

    {
        let per_slave = Rc::clone(&per_slave);
        let overall = Rc::clone(&overall);
        let stop = exe.reactor_mut().stop_token();
        exe.step(
            0.1,
            Duration::from_secs(10),
            Box::new(move |_, _, result| {
                per_slave.borrow_mut().push(result);
            }),
            Box::new(move |_, result| {
                overall.borrow_mut().push(result);
                stop.stop();
            }),
        )
        .unwrap();
    }

    let manager = exe.manager().clone();
    exe.reactor_mut().add_timer(
        Duration::from_millis(100),
        Some(1),
        Box::new(move |reactor, _| {
            manager.terminate(reactor).expect("terminate");
            Ok(())
        }),
    );
    exe.reactor_mut().run().unwrap();

    assert_eq!(exe.state(), ExecutionState::Terminated);
    assert_eq!(per_slave.borrow().len(), 3);
    assert!(per_slave.borrow().iter().all(|r| *r == Err(BusError::Aborted)));
    // Exactly one overall completion, with Aborted.
    assert_eq!(overall.borrow().as_slice(), &[Err(BusError::Aborted)]);

    // Keep the reactor alive briefly so the TERMINATE broadcasts reach the
    // slaves, which are still inside their slow steps.
    exe.reactor_mut().add_timer(
        Duration::from_millis(100),
        Some(1),
        Box::new(|reactor, _| {
            reactor.stop();
            Ok(())
        }),
    );
    exe.reactor_mut().run().unwrap();

    for slave in slaves {
        slave.join().unwrap();
    }
}

/// A slave that rejects setup surfaces SetupRejected and is not added.
#[test]
fn setup_rejection_surfaces_and_slave_exits() {
    init_test_logging();

    let slave = spawn_slave("picky", MockSlave::new("picky").rejecting_setup());

    let mut exe = Execution::new("setup", 0.0, 1.0).unwrap();
    let result = exe.reconstitute_sync(vec![added(&slave, "mock-picky")], COMM_TIMEOUT);
    assert!(matches!(result, Err(BusError::SetupRejected(_))));
    assert!(exe.manager().slave_ids().is_empty());

    assert!(matches!(slave.join(), Err(SlaveError::Agent(AgentError::SetupRejected))));

    exe.terminate().unwrap();
}

/// Connection validation happens at the master, synchronously: bad
/// causality and cross-type connections never reach the wire.
#[test]
fn invalid_connections_fail_validation() {
    init_test_logging();

    let source = MockSlave::new("src").with_real_output(OUT_Y, "out_y");
    let sink = MockSlave::new("dst")
        .with_real_input(IN_X, "in_x")
        .with_variable(3, "mode", stepbus_model::DataType::Integer, stepbus_model::Causality::Input);

    let slave_a = spawn_slave("src", source);
    let slave_b = spawn_slave("dst", sink);

    let mut exe = Execution::new("validation", 0.0, 1.0).unwrap();
    let ids = exe
        .reconstitute_sync(
            vec![added(&slave_a, "mock-src"), added(&slave_b, "mock-dst")],
            COMM_TIMEOUT,
        )
        .unwrap();

    // Cross-type: real output into integer input.
    let result = exe.reconfigure_sync(
        vec![stepbus_master::SlaveConfig {
            slave: ids[1],
            settings: vec![VariableSetting::connect(3, Variable::new(ids[0], OUT_Y))],
        }],
        COMM_TIMEOUT,
    );
    assert!(matches!(result, Err(BusError::Model(_))));

    // An output cannot be a sink.
    let result = exe.reconfigure_sync(
        vec![stepbus_master::SlaveConfig {
            slave: ids[0],
            settings: vec![VariableSetting::connect(OUT_Y, Variable::new(ids[1], IN_X))],
        }],
        COMM_TIMEOUT,
    );
    assert!(matches!(result, Err(BusError::Model(_))));

    // The execution is still usable afterwards.
    assert_eq!(exe.step_sync(0.1, COMM_TIMEOUT).unwrap(), StepResult::Complete);
    exe.accept_step_sync(COMM_TIMEOUT).unwrap();

    exe.terminate().unwrap();
    slave_a.join().unwrap();
    slave_b.join().unwrap();
}
