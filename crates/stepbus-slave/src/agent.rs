//! The per-slave agent state machine.
//!
//! The agent is a pure state machine: it consumes decoded control requests
//! and data-bus publications and returns the reply to send plus actions for
//! the runner to execute (publish, change subscriptions, arm the comm
//! timer, shut down). It performs no I/O of its own, which is what makes
//! the whole slave-side protocol testable without a network.

use std::collections::HashMap;
use std::time::Duration;

use stepbus_model::{Causality, ScalarValue, SlaveId, StepId, Variable, VariableId, NO_STEP_ID};
use stepbus_proto::control::{ConnectVars, Hello, SetVars, Setup, Step};
use stepbus_proto::exe_data;
use stepbus_proto::{ControlReply, ControlRequest, DataMessage, Fatal, FatalKind, PROTOCOL_VERSION};
use tracing::{debug, trace, warn};

use crate::{AgentError, InstanceError, SlaveInstance, StepOutcome};

/// The agent's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// No HELLO received yet.
    NotConnected,
    /// HELLO accepted, SETUP outstanding.
    Connected,
    /// Set up and between steps.
    Ready,
    /// Inside a `do_step` call.
    Stepping,
    /// Last step completed, awaiting ACCEPT_STEP.
    StepOk,
    /// Last step was rejected as too big.
    StepFailed,
    /// TERMINATE received or the dialog failed fatally.
    Terminated,
}

/// Something the runner must do on the agent's behalf.
#[derive(Debug)]
pub enum AgentAction {
    /// Publish a value on the data-pub channel.
    Publish(DataMessage),
    /// Subscribe to a source variable published at `endpoint`.
    Subscribe {
        /// The remote variable being consumed.
        source: Variable,
        /// URL of the publisher's data-pub endpoint.
        endpoint: String,
    },
    /// Release one subscription to a source variable.
    Unsubscribe {
        /// The remote variable no longer consumed through this connection.
        source: Variable,
        /// URL of the publisher's data-pub endpoint.
        endpoint: String,
    },
    /// Arm the communications timeout with the given duration.
    StartCommTimer(Duration),
    /// Stop the reactor; `None` is an orderly termination.
    Shutdown(Option<AgentError>),
}

/// A reply to send plus the actions it entails.
#[derive(Debug, Default)]
pub struct AgentOutcome {
    /// The control reply, if one is owed.
    pub reply: Option<ControlReply>,
    /// Side effects for the runner.
    pub actions: Vec<AgentAction>,
}

impl AgentOutcome {
    fn reply(reply: ControlReply) -> Self {
        Self { reply: Some(reply), actions: Vec::new() }
    }

    fn fatal(kind: FatalKind, message: impl Into<String>, error: AgentError) -> Self {
        Self {
            reply: Some(ControlReply::Fatal(Fatal { kind, message: message.into() })),
            actions: vec![AgentAction::Shutdown(Some(error))],
        }
    }
}

/// One input's connection to a remote output.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Connection {
    source: Variable,
    endpoint: String,
}

/// The slave-side protocol state machine.
pub struct SlaveAgent<I> {
    instance: I,
    state: AgentState,
    slave_id: SlaveId,
    last_step_id: StepId,
    /// Input variable id → where its values come from.
    connections: HashMap<VariableId, Connection>,
    /// Last usable value per subscribed source variable.
    mailbox: HashMap<Variable, (StepId, ScalarValue)>,
}

impl<I: SlaveInstance> SlaveAgent<I> {
    /// Wraps `instance` in a fresh agent.
    pub fn new(instance: I) -> Self {
        Self {
            instance,
            state: AgentState::NotConnected,
            slave_id: 0,
            last_step_id: NO_STEP_ID,
            connections: HashMap::new(),
            mailbox: HashMap::new(),
        }
    }

    /// The agent's current lifecycle state.
    pub fn state(&self) -> AgentState {
        self.state
    }

    /// The id the master assigned at SETUP; zero before that.
    pub fn slave_id(&self) -> SlaveId {
        self.slave_id
    }

    /// The most recently completed step.
    pub fn last_step_id(&self) -> StepId {
        self.last_step_id
    }

    /// Access to the wrapped instance.
    pub fn instance(&self) -> &I {
        &self.instance
    }

    /// Processes one control request and returns the reply plus actions.
    pub fn handle_control(&mut self, request: ControlRequest) -> AgentOutcome {
        trace!(state = ?self.state, request = ?request_name(&request), "control request");
        match (self.state, request) {
            (_, ControlRequest::Terminate) => self.on_terminate(),
            (AgentState::NotConnected, ControlRequest::Hello(hello)) => self.on_hello(&hello),
            (AgentState::Connected, ControlRequest::Setup(setup)) => self.on_setup(&setup),
            (AgentState::Ready, ControlRequest::SetVars(set_vars)) => self.on_set_vars(set_vars),
            (AgentState::Ready, ControlRequest::ConnectVars(connect_vars)) => {
                self.on_connect_vars(connect_vars)
            }
            (AgentState::Ready, ControlRequest::Describe) => {
                AgentOutcome::reply(ControlReply::Description(
                    self.instance.type_description().clone(),
                ))
            }
            (AgentState::Ready, ControlRequest::Step(step)) => self.on_step(&step),
            (AgentState::StepOk, ControlRequest::AcceptStep) => {
                self.state = AgentState::Ready;
                AgentOutcome::reply(ControlReply::Ok)
            }
            (AgentState::StepFailed, ControlRequest::AcceptStep) => {
                self.state = AgentState::Terminated;
                AgentOutcome::fatal(
                    FatalKind::StepNotAccepted,
                    "the pending step was rejected, not completed",
                    AgentError::Protocol("ACCEPT_STEP after STEP_FAILED".into()),
                )
            }
            (state, request) => {
                let detail = format!("{} not allowed in {state:?}", request_name(&request));
                warn!(%detail, "protocol violation");
                self.state = AgentState::Terminated;
                AgentOutcome::fatal(FatalKind::Protocol, detail.clone(), AgentError::Protocol(detail))
            }
        }
    }

    /// Absorbs one data-bus publication into the input mailbox.
    ///
    /// Publications are matched against the subscription set by topic
    /// prefix. Per source only the value with the highest step id not
    /// beyond the next step is kept; anything staler or newer is discarded.
    pub fn handle_data(&mut self, publication: DataMessage) {
        let received = exe_data::topic(publication.variable);
        let subscribed = self
            .connections
            .values()
            .any(|c| exe_data::topic_matches(&exe_data::topic(c.source), &received));
        if !subscribed {
            trace!(variable = %publication.variable, "publication for unsubscribed variable");
            return;
        }
        if publication.step_id > self.last_step_id + 1 {
            trace!(
                variable = %publication.variable,
                step_id = publication.step_id,
                "publication ahead of lockstep, dropped"
            );
            return;
        }
        match self.mailbox.get(&publication.variable) {
            Some((stored, _)) if *stored > publication.step_id => {
                trace!(
                    variable = %publication.variable,
                    step_id = publication.step_id,
                    stored,
                    "stale publication discarded"
                );
            }
            _ => {
                self.mailbox
                    .insert(publication.variable, (publication.step_id, publication.value));
            }
        }
    }

    fn on_hello(&mut self, hello: &Hello) -> AgentOutcome {
        if hello.protocol_version != PROTOCOL_VERSION {
            self.state = AgentState::Terminated;
            return AgentOutcome::fatal(
                FatalKind::Version,
                format!("this slave speaks protocol version {PROTOCOL_VERSION}"),
                AgentError::VersionMismatch(hello.protocol_version),
            );
        }
        debug!(uuid = %hello.slave_uuid, "control dialog opened");
        self.state = AgentState::Connected;
        AgentOutcome::reply(ControlReply::Ready)
    }

    fn on_setup(&mut self, setup: &Setup) -> AgentOutcome {
        match self.instance.setup(
            setup.start_time,
            setup.stop_time,
            &setup.execution_name,
            &setup.slave_name,
        ) {
            Ok(true) => {
                self.slave_id = setup.slave_id;
                self.state = AgentState::Ready;
                debug!(
                    slave_id = setup.slave_id,
                    slave_name = %setup.slave_name,
                    execution = %setup.execution_name,
                    "set up"
                );
                AgentOutcome {
                    reply: Some(ControlReply::Ok),
                    actions: vec![AgentAction::StartCommTimer(Duration::from_millis(
                        setup.comm_timeout_ms,
                    ))],
                }
            }
            Ok(false) => {
                self.state = AgentState::Terminated;
                AgentOutcome::fatal(
                    FatalKind::Setup,
                    "instance cannot operate in the requested interval",
                    AgentError::SetupRejected,
                )
            }
            Err(e) => {
                self.state = AgentState::Terminated;
                AgentOutcome::fatal(FatalKind::Setup, e.to_string(), AgentError::Instance(e.to_string()))
            }
        }
    }

    fn on_set_vars(&mut self, set_vars: SetVars) -> AgentOutcome {
        if set_vars.step_id < self.last_step_id {
            self.state = AgentState::Terminated;
            return AgentOutcome::fatal(
                FatalKind::StaleStep,
                format!(
                    "SET_VARS for step {} but step {} is already done",
                    set_vars.step_id, self.last_step_id
                ),
                AgentError::Protocol("stale SET_VARS".into()),
            );
        }
        // Value assignments apply here, in list order; connection changes
        // travel separately in CONNECT_VARS.
        for setting in &set_vars.settings {
            if let Some(value) = &setting.value {
                if let Err(e) = self.instance.set_variable(setting.variable, value) {
                    return self.variable_fault(e);
                }
            }
        }
        AgentOutcome::reply(ControlReply::Ok)
    }

    fn on_connect_vars(&mut self, connect_vars: ConnectVars) -> AgentOutcome {
        let mut actions = Vec::new();
        for connection in connect_vars.connections {
            if self.instance.type_description().variable(connection.input).is_none() {
                return self.variable_fault(InstanceError::UnknownVariable(connection.input));
            }
            let new = Connection {
                source: connection.source,
                endpoint: connection.source_data_pub,
            };
            match self.connections.get(&connection.input) {
                Some(old) if *old == new => continue,
                _ => {}
            }
            if let Some(old) = self.connections.insert(connection.input, new.clone()) {
                self.forget_source_if_unused(&old, &mut actions);
            }
            actions.push(AgentAction::Subscribe {
                source: new.source,
                endpoint: new.endpoint,
            });
        }
        for input in connect_vars.disconnects {
            if let Some(old) = self.connections.remove(&input) {
                self.forget_source_if_unused(&old, &mut actions);
            }
        }
        AgentOutcome { reply: Some(ControlReply::Ok), actions }
    }

    fn forget_source_if_unused(&mut self, old: &Connection, actions: &mut Vec<AgentAction>) {
        actions.push(AgentAction::Unsubscribe {
            source: old.source,
            endpoint: old.endpoint.clone(),
        });
        if !self.connections.values().any(|c| c.source == old.source) {
            self.mailbox.remove(&old.source);
        }
    }

    fn on_step(&mut self, step: &Step) -> AgentOutcome {
        if step.step_id != self.last_step_id + 1 {
            self.state = AgentState::Terminated;
            return AgentOutcome::fatal(
                FatalKind::Protocol,
                format!(
                    "STEP {} does not follow step {}",
                    step.step_id, self.last_step_id
                ),
                AgentError::Protocol("non-consecutive step id".into()),
            );
        }

        // Feed each connected input its latest published value.
        let inputs: Vec<(VariableId, Variable)> =
            self.connections.iter().map(|(input, c)| (*input, c.source)).collect();
        for (input, source) in inputs {
            if let Some((_, value)) = self.mailbox.get(&source) {
                let value = value.clone();
                if let Err(e) = self.instance.set_variable(input, &value) {
                    return self.variable_fault(e);
                }
            }
        }

        self.state = AgentState::Stepping;
        match self.instance.do_step(step.current_time, step.step_size) {
            Ok(StepOutcome::Complete) => {
                self.last_step_id = step.step_id;
                self.state = AgentState::StepOk;
                let mut actions = Vec::new();
                if let Err(e) = self.publish_outputs(step.step_id, &mut actions) {
                    self.state = AgentState::Terminated;
                    return AgentOutcome::fatal(
                        FatalKind::Step,
                        e.to_string(),
                        AgentError::Instance(e.to_string()),
                    );
                }
                debug!(step_id = step.step_id, "step complete");
                AgentOutcome { reply: Some(ControlReply::StepOk), actions }
            }
            Ok(StepOutcome::TooBig) => {
                self.state = AgentState::StepFailed;
                debug!(step_id = step.step_id, step_size = step.step_size, "step rejected");
                AgentOutcome::reply(ControlReply::StepFailed)
            }
            Err(e) => {
                self.state = AgentState::Terminated;
                AgentOutcome::fatal(FatalKind::Step, e.to_string(), AgentError::Instance(e.to_string()))
            }
        }
    }

    fn publish_outputs(
        &mut self,
        step_id: StepId,
        actions: &mut Vec<AgentAction>,
    ) -> Result<(), InstanceError> {
        let outputs: Vec<VariableId> = self
            .instance
            .type_description()
            .variables
            .iter()
            .filter(|v| v.causality == Causality::Output)
            .map(|v| v.id)
            .collect();
        for id in outputs {
            let value = self.instance.get_variable(id)?;
            actions.push(AgentAction::Publish(DataMessage {
                variable: Variable::new(self.slave_id, id),
                step_id,
                value,
            }));
        }
        Ok(())
    }

    fn on_terminate(&mut self) -> AgentOutcome {
        debug!("terminating");
        self.state = AgentState::Terminated;
        AgentOutcome {
            reply: Some(ControlReply::Ok),
            actions: vec![AgentAction::Shutdown(None)],
        }
    }

    fn variable_fault(&mut self, error: InstanceError) -> AgentOutcome {
        self.state = AgentState::Terminated;
        AgentOutcome::fatal(
            FatalKind::Variable,
            error.to_string(),
            AgentError::Instance(error.to_string()),
        )
    }
}

fn request_name(request: &ControlRequest) -> &'static str {
    match request {
        ControlRequest::Hello(_) => "HELLO",
        ControlRequest::Setup(_) => "SETUP",
        ControlRequest::Describe => "DESCRIBE",
        ControlRequest::SetVars(_) => "SET_VARS",
        ControlRequest::ConnectVars(_) => "CONNECT_VARS",
        ControlRequest::Step(_) => "STEP",
        ControlRequest::AcceptStep => "ACCEPT_STEP",
        ControlRequest::Terminate => "TERMINATE",
    }
}

#[cfg(test)]
mod tests {
    use stepbus_model::{
        Causality, DataType, ScalarValue, SlaveTypeDescription, Variability,
        VariableDescription, VariableSetting,
    };
    use stepbus_proto::control::InputConnection;

    use super::*;

    const IN_U: VariableId = 1;
    const OUT_Y: VariableId = 2;

    /// y = 2·u, rejects steps longer than `max_step`.
    struct Doubler {
        description: SlaveTypeDescription,
        u: f64,
        y: f64,
        max_step: f64,
    }

    impl Doubler {
        fn new(max_step: f64) -> Self {
            Self {
                description: SlaveTypeDescription {
                    name: "doubler".into(),
                    uuid: "test-doubler".into(),
                    description: String::new(),
                    author: String::new(),
                    version: "1".into(),
                    variables: vec![
                        VariableDescription {
                            id: IN_U,
                            name: "u".into(),
                            data_type: DataType::Real,
                            causality: Causality::Input,
                            variability: Variability::Continuous,
                        },
                        VariableDescription {
                            id: OUT_Y,
                            name: "y".into(),
                            data_type: DataType::Real,
                            causality: Causality::Output,
                            variability: Variability::Continuous,
                        },
                    ],
                },
                u: 0.0,
                y: 0.0,
                max_step,
            }
        }
    }

    impl SlaveInstance for Doubler {
        fn setup(
            &mut self,
            start: f64,
            stop: f64,
            _execution_name: &str,
            _slave_name: &str,
        ) -> Result<bool, InstanceError> {
            Ok(start <= stop)
        }

        fn type_description(&self) -> &SlaveTypeDescription {
            &self.description
        }

        fn get_real_variable(&self, variable: VariableId) -> Result<f64, InstanceError> {
            match variable {
                IN_U => Ok(self.u),
                OUT_Y => Ok(self.y),
                other => Err(InstanceError::UnknownVariable(other)),
            }
        }

        fn get_integer_variable(&self, variable: VariableId) -> Result<i32, InstanceError> {
            Err(InstanceError::UnknownVariable(variable))
        }

        fn get_boolean_variable(&self, variable: VariableId) -> Result<bool, InstanceError> {
            Err(InstanceError::UnknownVariable(variable))
        }

        fn get_string_variable(&self, variable: VariableId) -> Result<String, InstanceError> {
            Err(InstanceError::UnknownVariable(variable))
        }

        fn set_real_variable(
            &mut self,
            variable: VariableId,
            value: f64,
        ) -> Result<(), InstanceError> {
            match variable {
                IN_U => {
                    self.u = value;
                    Ok(())
                }
                other => Err(InstanceError::UnknownVariable(other)),
            }
        }

        fn set_integer_variable(&mut self, v: VariableId, _: i32) -> Result<(), InstanceError> {
            Err(InstanceError::UnknownVariable(v))
        }

        fn set_boolean_variable(&mut self, v: VariableId, _: bool) -> Result<(), InstanceError> {
            Err(InstanceError::UnknownVariable(v))
        }

        fn set_string_variable(&mut self, v: VariableId, _: &str) -> Result<(), InstanceError> {
            Err(InstanceError::UnknownVariable(v))
        }

        fn do_step(&mut self, _t: f64, dt: f64) -> Result<StepOutcome, InstanceError> {
            if dt > self.max_step {
                return Ok(StepOutcome::TooBig);
            }
            self.y = 2.0 * self.u;
            Ok(StepOutcome::Complete)
        }
    }

    fn hello() -> ControlRequest {
        ControlRequest::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            slave_uuid: "test-doubler".into(),
        })
    }

    fn setup(slave_id: SlaveId) -> ControlRequest {
        ControlRequest::Setup(Setup {
            slave_id,
            start_time: 0.0,
            stop_time: 10.0,
            execution_name: "test".into(),
            slave_name: "doubler".into(),
            comm_timeout_ms: 1000,
        })
    }

    fn ready_agent() -> SlaveAgent<Doubler> {
        let mut agent = SlaveAgent::new(Doubler::new(1.0));
        assert_eq!(agent.handle_control(hello()).reply, Some(ControlReply::Ready));
        let outcome = agent.handle_control(setup(7));
        assert_eq!(outcome.reply, Some(ControlReply::Ok));
        assert!(matches!(outcome.actions[..], [AgentAction::StartCommTimer(_)]));
        assert_eq!(agent.state(), AgentState::Ready);
        agent
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let mut agent = SlaveAgent::new(Doubler::new(1.0));
        let outcome = agent.handle_control(ControlRequest::Hello(Hello {
            protocol_version: PROTOCOL_VERSION + 1,
            slave_uuid: String::new(),
        }));
        assert!(matches!(
            outcome.reply,
            Some(ControlReply::Fatal(Fatal { kind: FatalKind::Version, .. }))
        ));
        assert!(matches!(
            outcome.actions[..],
            [AgentAction::Shutdown(Some(AgentError::VersionMismatch(_)))]
        ));
    }

    #[test]
    fn setup_adopts_the_assigned_id() {
        let agent = ready_agent();
        assert_eq!(agent.slave_id(), 7);
    }

    #[test]
    fn step_publishes_outputs_with_the_step_id() {
        let mut agent = ready_agent();
        agent.handle_control(ControlRequest::SetVars(SetVars {
            step_id: NO_STEP_ID,
            settings: vec![VariableSetting::value(IN_U, 2.5)],
        }));

        let outcome = agent.handle_control(ControlRequest::Step(Step {
            step_id: 0,
            current_time: 0.0,
            step_size: 0.1,
        }));
        assert_eq!(outcome.reply, Some(ControlReply::StepOk));
        assert_eq!(agent.state(), AgentState::StepOk);
        match &outcome.actions[..] {
            [AgentAction::Publish(publication)] => {
                assert_eq!(publication.variable, Variable::new(7, OUT_Y));
                assert_eq!(publication.step_id, 0);
                assert_eq!(publication.value, ScalarValue::Real(5.0));
            }
            other => panic!("unexpected actions {other:?}"),
        }

        let outcome = agent.handle_control(ControlRequest::AcceptStep);
        assert_eq!(outcome.reply, Some(ControlReply::Ok));
        assert_eq!(agent.state(), AgentState::Ready);
    }

    #[test]
    fn too_big_step_is_rejected_and_accept_fails() {
        let mut agent = ready_agent();
        let outcome = agent.handle_control(ControlRequest::Step(Step {
            step_id: 0,
            current_time: 0.0,
            step_size: 5.0,
        }));
        assert_eq!(outcome.reply, Some(ControlReply::StepFailed));
        assert_eq!(agent.state(), AgentState::StepFailed);
        // The rejected step is not acknowledged.
        assert_eq!(agent.last_step_id(), NO_STEP_ID);

        let outcome = agent.handle_control(ControlRequest::AcceptStep);
        assert!(matches!(
            outcome.reply,
            Some(ControlReply::Fatal(Fatal { kind: FatalKind::StepNotAccepted, .. }))
        ));
    }

    #[test]
    fn non_consecutive_step_id_is_fatal() {
        let mut agent = ready_agent();
        let outcome = agent.handle_control(ControlRequest::Step(Step {
            step_id: 3,
            current_time: 0.0,
            step_size: 0.1,
        }));
        assert!(matches!(outcome.reply, Some(ControlReply::Fatal(_))));
    }

    #[test]
    fn stale_set_vars_is_fatal() {
        let mut agent = ready_agent();
        agent.handle_control(ControlRequest::Step(Step {
            step_id: 0,
            current_time: 0.0,
            step_size: 0.1,
        }));
        agent.handle_control(ControlRequest::AcceptStep);

        let outcome = agent.handle_control(ControlRequest::SetVars(SetVars {
            step_id: -1,
            settings: vec![],
        }));
        assert!(matches!(
            outcome.reply,
            Some(ControlReply::Fatal(Fatal { kind: FatalKind::StaleStep, .. }))
        ));
    }

    #[test]
    fn connected_input_reads_the_mailbox_value() {
        let mut agent = ready_agent();
        let source = Variable::new(3, 9);
        let outcome = agent.handle_control(ControlRequest::ConnectVars(ConnectVars {
            connections: vec![InputConnection {
                input: IN_U,
                source,
                source_data_pub: "tcp://127.0.0.1:7000".into(),
            }],
            disconnects: vec![],
        }));
        assert_eq!(outcome.reply, Some(ControlReply::Ok));
        assert!(matches!(outcome.actions[..], [AgentAction::Subscribe { .. }]));

        agent.handle_data(DataMessage {
            variable: source,
            step_id: 0,
            value: ScalarValue::Real(4.0),
        });
        let outcome = agent.handle_control(ControlRequest::Step(Step {
            step_id: 0,
            current_time: 0.0,
            step_size: 0.1,
        }));
        assert_eq!(outcome.reply, Some(ControlReply::StepOk));
        match &outcome.actions[..] {
            [AgentAction::Publish(publication)] => {
                assert_eq!(publication.value, ScalarValue::Real(8.0));
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }

    #[test]
    fn stale_publication_leaves_mailbox_unchanged() {
        let mut agent = ready_agent();
        let source = Variable::new(3, 9);
        agent.handle_control(ControlRequest::ConnectVars(ConnectVars {
            connections: vec![InputConnection {
                input: IN_U,
                source,
                source_data_pub: "tcp://127.0.0.1:7000".into(),
            }],
            disconnects: vec![],
        }));

        agent.handle_data(DataMessage {
            variable: source,
            step_id: 1,
            value: ScalarValue::Real(9.0),
        });
        // Lower step id arrives later: discarded.
        agent.handle_data(DataMessage {
            variable: source,
            step_id: 0,
            value: ScalarValue::Real(1.0),
        });
        assert_eq!(agent.mailbox[&source], (1, ScalarValue::Real(9.0)));
    }

    #[test]
    fn publication_ahead_of_lockstep_is_dropped() {
        let mut agent = ready_agent();
        let source = Variable::new(3, 9);
        agent.handle_control(ControlRequest::ConnectVars(ConnectVars {
            connections: vec![InputConnection {
                input: IN_U,
                source,
                source_data_pub: "tcp://127.0.0.1:7000".into(),
            }],
            disconnects: vec![],
        }));

        agent.handle_data(DataMessage {
            variable: source,
            step_id: 5,
            value: ScalarValue::Real(9.0),
        });
        assert!(agent.mailbox.is_empty());
    }

    #[test]
    fn disconnect_unsubscribes_and_clears_the_mailbox() {
        let mut agent = ready_agent();
        let source = Variable::new(3, 9);
        agent.handle_control(ControlRequest::ConnectVars(ConnectVars {
            connections: vec![InputConnection {
                input: IN_U,
                source,
                source_data_pub: "tcp://127.0.0.1:7000".into(),
            }],
            disconnects: vec![],
        }));
        agent.handle_data(DataMessage {
            variable: source,
            step_id: 0,
            value: ScalarValue::Real(4.0),
        });

        let outcome = agent.handle_control(ControlRequest::ConnectVars(ConnectVars {
            connections: vec![],
            disconnects: vec![IN_U],
        }));
        assert!(matches!(outcome.actions[..], [AgentAction::Unsubscribe { .. }]));
        assert!(agent.mailbox.is_empty());
    }

    #[test]
    fn terminate_works_from_any_state() {
        let mut agent = SlaveAgent::new(Doubler::new(1.0));
        let outcome = agent.handle_control(ControlRequest::Terminate);
        assert_eq!(outcome.reply, Some(ControlReply::Ok));
        assert!(matches!(outcome.actions[..], [AgentAction::Shutdown(None)]));
        assert_eq!(agent.state(), AgentState::Terminated);
    }

    #[test]
    fn command_in_wrong_state_is_a_protocol_fault() {
        let mut agent = SlaveAgent::new(Doubler::new(1.0));
        let outcome = agent.handle_control(ControlRequest::AcceptStep);
        assert!(matches!(
            outcome.reply,
            Some(ControlReply::Fatal(Fatal { kind: FatalKind::Protocol, .. }))
        ));
    }
}
