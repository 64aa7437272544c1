//! Fuzz target for the slave agent state machine.
//!
//! # Strategy
//!
//! Arbitrary sequences of control requests and data publications, including
//! out-of-order handshakes, duplicate HELLOs, stale steps and unknown
//! variables.
//!
//! # Invariants
//!
//! - The agent never panics, whatever arrives in whatever order
//! - Every control request gets a reply
//! - `Ready` is only reachable through HELLO then SETUP
//! - The acknowledged step id never decreases

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use stepbus_model::{
    Causality, DataType, ScalarValue, SlaveTypeDescription, Variability, Variable,
    VariableDescription, VariableSetting,
};
use stepbus_proto::control::{ConnectVars, Hello, InputConnection, SetVars, Setup, Step};
use stepbus_proto::{ControlRequest, DataMessage, PROTOCOL_VERSION};
use stepbus_slave::{AgentState, InstanceError, SlaveAgent, SlaveInstance, StepOutcome};

#[derive(Debug, Arbitrary)]
enum FuzzEvent {
    Hello { version_offset: u8 },
    Setup { slave_id: u16, start: i16, stop: i16 },
    Describe,
    SetVars { step_id: i8, variable: u8, value: FuzzValue },
    ConnectVars { input: u8, source_slave: u16, source_var: u8, disconnect: bool },
    Step { step_id: i8, size_milli: u16 },
    AcceptStep,
    Terminate,
    Data { source_slave: u16, source_var: u8, step_id: i8, value: FuzzValue },
}

#[derive(Debug, Arbitrary)]
enum FuzzValue {
    Real(f32),
    Integer(i32),
    Boolean(bool),
    Text(u8),
}

impl FuzzValue {
    fn to_scalar(&self) -> ScalarValue {
        match self {
            Self::Real(v) => ScalarValue::Real(f64::from(*v)),
            Self::Integer(v) => ScalarValue::Integer(*v),
            Self::Boolean(v) => ScalarValue::Boolean(*v),
            Self::Text(n) => ScalarValue::String("x".repeat(usize::from(*n % 8))),
        }
    }
}

struct FuzzInstance {
    description: SlaveTypeDescription,
    input: f64,
    output: f64,
}

impl FuzzInstance {
    fn new() -> Self {
        Self {
            description: SlaveTypeDescription {
                name: "fuzz".into(),
                uuid: "fuzz".into(),
                description: String::new(),
                author: String::new(),
                version: "0".into(),
                variables: vec![
                    VariableDescription {
                        id: 0,
                        name: "in".into(),
                        data_type: DataType::Real,
                        causality: Causality::Input,
                        variability: Variability::Continuous,
                    },
                    VariableDescription {
                        id: 1,
                        name: "out".into(),
                        data_type: DataType::Real,
                        causality: Causality::Output,
                        variability: Variability::Continuous,
                    },
                ],
            },
            input: 0.0,
            output: 0.0,
        }
    }
}

impl SlaveInstance for FuzzInstance {
    fn setup(&mut self, start: f64, stop: f64, _: &str, _: &str) -> Result<bool, InstanceError> {
        Ok(start <= stop)
    }

    fn type_description(&self) -> &SlaveTypeDescription {
        &self.description
    }

    fn get_real_variable(&self, variable: u32) -> Result<f64, InstanceError> {
        match variable {
            0 => Ok(self.input),
            1 => Ok(self.output),
            other => Err(InstanceError::UnknownVariable(other)),
        }
    }

    fn get_integer_variable(&self, variable: u32) -> Result<i32, InstanceError> {
        Err(InstanceError::UnknownVariable(variable))
    }

    fn get_boolean_variable(&self, variable: u32) -> Result<bool, InstanceError> {
        Err(InstanceError::UnknownVariable(variable))
    }

    fn get_string_variable(&self, variable: u32) -> Result<String, InstanceError> {
        Err(InstanceError::UnknownVariable(variable))
    }

    fn set_real_variable(&mut self, variable: u32, value: f64) -> Result<(), InstanceError> {
        match variable {
            0 => {
                self.input = value;
                Ok(())
            }
            1 => {
                self.output = value;
                Ok(())
            }
            other => Err(InstanceError::UnknownVariable(other)),
        }
    }

    fn set_integer_variable(&mut self, variable: u32, _: i32) -> Result<(), InstanceError> {
        Err(InstanceError::UnknownVariable(variable))
    }

    fn set_boolean_variable(&mut self, variable: u32, _: bool) -> Result<(), InstanceError> {
        Err(InstanceError::UnknownVariable(variable))
    }

    fn set_string_variable(&mut self, variable: u32, _: &str) -> Result<(), InstanceError> {
        Err(InstanceError::UnknownVariable(variable))
    }

    fn do_step(&mut self, _: f64, dt: f64) -> Result<StepOutcome, InstanceError> {
        if dt > 10.0 {
            return Ok(StepOutcome::TooBig);
        }
        self.output = self.input;
        Ok(StepOutcome::Complete)
    }
}

fn to_request(event: &FuzzEvent) -> Option<ControlRequest> {
    Some(match event {
        FuzzEvent::Hello { version_offset } => ControlRequest::Hello(Hello {
            protocol_version: PROTOCOL_VERSION.wrapping_add(u16::from(*version_offset % 3)),
            slave_uuid: "fuzz".into(),
        }),
        FuzzEvent::Setup { slave_id, start, stop } => ControlRequest::Setup(Setup {
            slave_id: *slave_id,
            start_time: f64::from(*start),
            stop_time: f64::from(*stop),
            execution_name: "fuzz".into(),
            slave_name: "fuzz".into(),
            comm_timeout_ms: 1000,
        }),
        FuzzEvent::Describe => ControlRequest::Describe,
        FuzzEvent::SetVars { step_id, variable, value } => ControlRequest::SetVars(SetVars {
            step_id: i64::from(*step_id),
            settings: vec![VariableSetting {
                variable: u32::from(*variable % 4),
                value: Some(value.to_scalar()),
                connection: Default::default(),
            }],
        }),
        FuzzEvent::ConnectVars { input, source_slave, source_var, disconnect } => {
            let connect_vars = if *disconnect {
                ConnectVars { connections: vec![], disconnects: vec![u32::from(*input % 4)] }
            } else {
                ConnectVars {
                    connections: vec![InputConnection {
                        input: u32::from(*input % 4),
                        source: Variable::new(*source_slave, u32::from(*source_var)),
                        source_data_pub: "tcp://127.0.0.1:1".into(),
                    }],
                    disconnects: vec![],
                }
            };
            ControlRequest::ConnectVars(connect_vars)
        }
        FuzzEvent::Step { step_id, size_milli } => ControlRequest::Step(Step {
            step_id: i64::from(*step_id),
            current_time: 0.0,
            step_size: f64::from(*size_milli) / 1000.0,
        }),
        FuzzEvent::AcceptStep => ControlRequest::AcceptStep,
        FuzzEvent::Terminate => ControlRequest::Terminate,
        FuzzEvent::Data { .. } => return None,
    })
}

fuzz_target!(|events: Vec<FuzzEvent>| {
    let mut agent = SlaveAgent::new(FuzzInstance::new());
    let mut was_set_up = false;
    let mut last_acknowledged = agent.last_step_id();

    for event in &events {
        match to_request(event) {
            Some(request) => {
                let ready_possible = was_set_up || matches!(event, FuzzEvent::Setup { .. });
                let outcome = agent.handle_control(request);
                assert!(outcome.reply.is_some(), "every request gets a reply");
                if agent.state() == AgentState::Ready && !ready_possible {
                    panic!("Ready reached without HELLO + SETUP");
                }
                if matches!(event, FuzzEvent::Setup { .. })
                    && agent.state() == AgentState::Ready
                {
                    was_set_up = true;
                }
            }
            None => {
                if let FuzzEvent::Data { source_slave, source_var, step_id, value } = event {
                    agent.handle_data(DataMessage {
                        variable: Variable::new(*source_slave, u32::from(*source_var)),
                        step_id: i64::from(*step_id).max(0),
                        value: value.to_scalar(),
                    });
                }
            }
        }
        assert!(agent.last_step_id() >= last_acknowledged, "step ids never move backwards");
        last_acknowledged = agent.last_step_id();
    }
});
