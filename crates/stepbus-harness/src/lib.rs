//! Test harness for the stepbus co-simulation bus.
//!
//! Provides [`MockSlave`], a scriptable [`SlaveInstance`] for exercising
//! the protocol, and [`spawn_slave`], which runs a slave on its own thread
//! against 127.0.0.1 ephemeral ports and reports where it is listening —
//! the same shape a slave provider would give a master in production.

mod mock;

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

pub use mock::MockSlave;
use stepbus_net::{Endpoint, SlaveLocator};
use stepbus_slave::{SlaveError, SlaveRunner};

/// Installs a test-friendly tracing subscriber; safe to call repeatedly.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A 127.0.0.1 endpoint with an OS-assigned port.
pub fn loopback() -> Endpoint {
    Endpoint::new("tcp", "127.0.0.1:*")
}

/// A slave running on its own thread.
pub struct TestSlave {
    /// The slave's name, as it should be registered with the master.
    pub name: String,
    /// Where the slave is listening.
    pub locator: SlaveLocator,
    handle: JoinHandle<Result<(), SlaveError>>,
}

impl TestSlave {
    /// Waits for the slave to leave the execution and returns how it went.
    pub fn join(self) -> Result<(), SlaveError> {
        match self.handle.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Spawns `instance` as a slave named `name` on a fresh thread, bound to
/// loopback ephemeral ports. Panics if the slave cannot bind.
pub fn spawn_slave(name: &str, instance: MockSlave) -> TestSlave {
    let (locator_tx, locator_rx) = mpsc::channel();
    let thread_name = format!("slave-{name}");
    let handle = thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let mut runner = match SlaveRunner::new(instance, &loopback(), &loopback()) {
                Ok(runner) => runner,
                Err(e) => {
                    // The receiver hangs up on drop, which surfaces below.
                    drop(locator_tx);
                    return Err(e);
                }
            };
            let locator = SlaveLocator {
                control: runner.bound_control_endpoint().clone(),
                data_pub: runner.bound_data_pub_endpoint().clone(),
            };
            let _ = locator_tx.send(locator);
            runner.run()
        })
        .expect("spawn slave thread");

    let locator = locator_rx.recv().expect("slave failed to start");
    TestSlave { name: name.to_string(), locator, handle }
}
