//! The request/reply control protocol.
//!
//! Every control message is two frames at most: a 2-byte big-endian command
//! code, then an optional CBOR payload record. Replies use the same shape.
//! The payload records are plain serde structs; their CBOR form is opaque to
//! the framing layer and may grow fields without breaking the frame format.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use stepbus_model::{
    SlaveId, SlaveTypeDescription, StepId, TimeDuration, TimePoint, Variable, VariableId,
    VariableSetting,
};
use stepbus_net::Message;

use crate::ProtoError;

// Request codes.
const CODE_HELLO: u16 = 0x0010;
const CODE_SETUP: u16 = 0x0011;
const CODE_DESCRIBE: u16 = 0x0012;
const CODE_SET_VARS: u16 = 0x0013;
const CODE_CONNECT_VARS: u16 = 0x0014;
const CODE_STEP: u16 = 0x0015;
const CODE_ACCEPT_STEP: u16 = 0x0016;
const CODE_TERMINATE: u16 = 0x0017;

// Reply codes.
const CODE_READY: u16 = 0x0020;
const CODE_OK: u16 = 0x0021;
const CODE_DESCRIPTION: u16 = 0x0022;
const CODE_STEP_OK: u16 = 0x0023;
const CODE_STEP_FAILED: u16 = 0x0024;
const CODE_FATAL: u16 = 0x002f;

/// HELLO payload: opens a control dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// The protocol version the master speaks.
    pub protocol_version: u16,
    /// The uuid of the slave type the master expects to be talking to.
    pub slave_uuid: String,
}

/// SETUP payload: binds the slave into an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setup {
    /// The id the master has assigned to this slave.
    pub slave_id: SlaveId,
    /// Earliest simulated time the slave must support.
    pub start_time: TimePoint,
    /// Latest simulated time the slave must support.
    pub stop_time: TimePoint,
    /// The execution's name.
    pub execution_name: String,
    /// This slave's name in the execution.
    pub slave_name: String,
    /// Communications silence after which the slave shuts itself down.
    pub comm_timeout_ms: u64,
}

/// SET_VARS payload: value assignments, applied in list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetVars {
    /// The step id this reconfiguration belongs to.
    pub step_id: StepId,
    /// The settings to apply.
    pub settings: Vec<VariableSetting>,
}

/// One new input connection: which local input listens to which remote
/// output, and where that output is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputConnection {
    /// The local input variable.
    pub input: VariableId,
    /// The remote source variable.
    pub source: Variable,
    /// URL of the source slave's data-pub endpoint.
    pub source_data_pub: String,
}

/// CONNECT_VARS payload: subscription set changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConnectVars {
    /// Inputs to connect.
    pub connections: Vec<InputConnection>,
    /// Inputs whose connections are broken.
    pub disconnects: Vec<VariableId>,
}

/// STEP payload: perform one time step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// The step's id; must be exactly one past the slave's last step.
    pub step_id: StepId,
    /// The simulated time at which the step starts.
    pub current_time: TimePoint,
    /// The step's duration.
    pub step_size: TimeDuration,
}

/// Why a FATAL reply was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatalKind {
    /// Protocol version not supported.
    Version,
    /// Setup was rejected or failed.
    Setup,
    /// A SET_VARS referred to an already-finished step.
    StaleStep,
    /// A variable id was unknown or used with the wrong data type.
    Variable,
    /// The step failed in a way a smaller step size will not fix.
    Step,
    /// ACCEPT_STEP arrived for a step the slave had rejected.
    StepNotAccepted,
    /// The dialog violated the protocol.
    Protocol,
}

/// FATAL payload: the slave is lost to the execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fatal {
    /// What went wrong.
    pub kind: FatalKind,
    /// Human-readable detail.
    pub message: String,
}

/// A decoded control request, master to slave.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    /// Open the dialog.
    Hello(Hello),
    /// Bind the slave into the execution.
    Setup(Setup),
    /// Ask for the slave's type description.
    Describe,
    /// Apply variable value settings.
    SetVars(SetVars),
    /// Change the slave's input subscriptions.
    ConnectVars(ConnectVars),
    /// Perform one time step.
    Step(Step),
    /// Commit the pending step.
    AcceptStep,
    /// Leave the execution.
    Terminate,
}

/// A decoded control reply, slave to master.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlReply {
    /// HELLO accepted.
    Ready,
    /// Command carried out.
    Ok,
    /// Reply to DESCRIBE.
    Description(SlaveTypeDescription),
    /// The step completed.
    StepOk,
    /// The step was too big for the slave.
    StepFailed,
    /// The slave is lost.
    Fatal(Fatal),
}

impl ControlRequest {
    /// This request's wire code.
    pub fn code(&self) -> u16 {
        match self {
            Self::Hello(_) => CODE_HELLO,
            Self::Setup(_) => CODE_SETUP,
            Self::Describe => CODE_DESCRIBE,
            Self::SetVars(_) => CODE_SET_VARS,
            Self::ConnectVars(_) => CODE_CONNECT_VARS,
            Self::Step(_) => CODE_STEP,
            Self::AcceptStep => CODE_ACCEPT_STEP,
            Self::Terminate => CODE_TERMINATE,
        }
    }

    /// Encodes this request as a control message.
    pub fn encode(&self) -> Result<Message, ProtoError> {
        let payload = match self {
            Self::Hello(p) => Some(to_payload(p)?),
            Self::Setup(p) => Some(to_payload(p)?),
            Self::SetVars(p) => Some(to_payload(p)?),
            Self::ConnectVars(p) => Some(to_payload(p)?),
            Self::Step(p) => Some(to_payload(p)?),
            Self::Describe | Self::AcceptStep | Self::Terminate => None,
        };
        Ok(compose(self.code(), payload))
    }

    /// Decodes a control message as a request.
    pub fn decode(message: &Message) -> Result<Self, ProtoError> {
        let (code, payload) = split(message)?;
        match code {
            CODE_HELLO => Ok(Self::Hello(from_payload(code, payload)?)),
            CODE_SETUP => Ok(Self::Setup(from_payload(code, payload)?)),
            CODE_DESCRIBE => Ok(Self::Describe),
            CODE_SET_VARS => Ok(Self::SetVars(from_payload(code, payload)?)),
            CODE_CONNECT_VARS => Ok(Self::ConnectVars(from_payload(code, payload)?)),
            CODE_STEP => Ok(Self::Step(from_payload(code, payload)?)),
            CODE_ACCEPT_STEP => Ok(Self::AcceptStep),
            CODE_TERMINATE => Ok(Self::Terminate),
            other => Err(ProtoError::UnknownCode(other)),
        }
    }
}

impl ControlReply {
    /// This reply's wire code.
    pub fn code(&self) -> u16 {
        match self {
            Self::Ready => CODE_READY,
            Self::Ok => CODE_OK,
            Self::Description(_) => CODE_DESCRIPTION,
            Self::StepOk => CODE_STEP_OK,
            Self::StepFailed => CODE_STEP_FAILED,
            Self::Fatal(_) => CODE_FATAL,
        }
    }

    /// Encodes this reply as a control message.
    pub fn encode(&self) -> Result<Message, ProtoError> {
        let payload = match self {
            Self::Description(p) => Some(to_payload(p)?),
            Self::Fatal(p) => Some(to_payload(p)?),
            Self::Ready | Self::Ok | Self::StepOk | Self::StepFailed => None,
        };
        Ok(compose(self.code(), payload))
    }

    /// Decodes a control message as a reply.
    pub fn decode(message: &Message) -> Result<Self, ProtoError> {
        let (code, payload) = split(message)?;
        match code {
            CODE_READY => Ok(Self::Ready),
            CODE_OK => Ok(Self::Ok),
            CODE_DESCRIPTION => Ok(Self::Description(from_payload(code, payload)?)),
            CODE_STEP_OK => Ok(Self::StepOk),
            CODE_STEP_FAILED => Ok(Self::StepFailed),
            CODE_FATAL => Ok(Self::Fatal(from_payload(code, payload)?)),
            other => Err(ProtoError::UnknownCode(other)),
        }
    }
}

fn compose(code: u16, payload: Option<Bytes>) -> Message {
    let mut message = Message::new();
    message.push(Bytes::copy_from_slice(&code.to_be_bytes()));
    if let Some(payload) = payload {
        message.push(payload);
    }
    message
}

fn split(message: &Message) -> Result<(u16, Option<&Bytes>), ProtoError> {
    let code_frame = message.frame(0).ok_or(ProtoError::Malformed("no command frame"))?;
    if code_frame.len() != 2 {
        return Err(ProtoError::Malformed("command frame is not 2 bytes"));
    }
    let code = u16::from_be_bytes([code_frame[0], code_frame[1]]);
    Ok((code, message.frame(1)))
}

fn to_payload<T: Serialize>(payload: &T) -> Result<Bytes, ProtoError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(payload, &mut buf)
        .map_err(|e| ProtoError::Payload(e.to_string()))?;
    Ok(Bytes::from(buf))
}

fn from_payload<T: for<'de> Deserialize<'de>>(
    code: u16,
    payload: Option<&Bytes>,
) -> Result<T, ProtoError> {
    let payload = payload.ok_or(ProtoError::Malformed("missing payload frame"))?;
    ciborium::de::from_reader(payload.as_ref())
        .map_err(|e| ProtoError::Payload(format!("command {code:#06x}: {e}")))
}

#[cfg(test)]
mod tests {
    use stepbus_model::{Causality, DataType, Variability, VariableDescription};

    use super::*;

    #[test]
    fn hello_round_trip() {
        let req = ControlRequest::Hello(Hello {
            protocol_version: crate::PROTOCOL_VERSION,
            slave_uuid: "4b2e…".into(),
        });
        let msg = req.encode().unwrap();
        assert_eq!(msg.frame(0).unwrap().as_ref(), &[0x00, 0x10]);
        assert_eq!(ControlRequest::decode(&msg).unwrap(), req);
    }

    #[test]
    fn payloadless_commands_are_one_frame() {
        for req in [ControlRequest::Describe, ControlRequest::AcceptStep, ControlRequest::Terminate]
        {
            let msg = req.encode().unwrap();
            assert_eq!(msg.len(), 1);
            assert_eq!(ControlRequest::decode(&msg).unwrap(), req);
        }
    }

    #[test]
    fn step_round_trip() {
        let req =
            ControlRequest::Step(Step { step_id: 12, current_time: 0.5, step_size: 0.125 });
        let msg = req.encode().unwrap();
        assert_eq!(ControlRequest::decode(&msg).unwrap(), req);
    }

    #[test]
    fn set_vars_round_trip() {
        let req = ControlRequest::SetVars(SetVars {
            step_id: 3,
            settings: vec![
                VariableSetting::value(1, 2.5),
                VariableSetting::connect(2, Variable::new(7, 4)),
                VariableSetting::disconnect(3),
            ],
        });
        let msg = req.encode().unwrap();
        assert_eq!(ControlRequest::decode(&msg).unwrap(), req);
    }

    #[test]
    fn description_reply_round_trip() {
        let reply = ControlReply::Description(SlaveTypeDescription {
            name: "spring".into(),
            uuid: "a1".into(),
            description: "damped spring".into(),
            author: "".into(),
            version: "2".into(),
            variables: vec![VariableDescription {
                id: 0,
                name: "x".into(),
                data_type: DataType::Real,
                causality: Causality::Output,
                variability: Variability::Continuous,
            }],
        });
        let msg = reply.encode().unwrap();
        assert_eq!(ControlReply::decode(&msg).unwrap(), reply);
    }

    #[test]
    fn fatal_reply_round_trip() {
        let reply = ControlReply::Fatal(Fatal {
            kind: FatalKind::Version,
            message: "only version 0 supported".into(),
        });
        let msg = reply.encode().unwrap();
        assert_eq!(ControlReply::decode(&msg).unwrap(), reply);
    }

    #[test]
    fn unknown_code_is_rejected() {
        let mut msg = Message::new();
        msg.push(Bytes::from_static(&[0xff, 0xff]));
        assert!(matches!(
            ControlRequest::decode(&msg),
            Err(ProtoError::UnknownCode(0xffff))
        ));
    }

    #[test]
    fn short_code_frame_is_rejected() {
        let mut msg = Message::new();
        msg.push(Bytes::from_static(&[0x10]));
        assert!(matches!(ControlRequest::decode(&msg), Err(ProtoError::Malformed(_))));
    }

    #[test]
    fn missing_payload_is_rejected() {
        let mut msg = Message::new();
        msg.push(Bytes::from_static(&[0x00, 0x15]));
        assert!(matches!(ControlRequest::decode(&msg), Err(ProtoError::Malformed(_))));
    }
}
