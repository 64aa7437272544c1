//! Data model for the stepbus co-simulation bus.
//!
//! This crate defines the vocabulary shared by masters and slaves: identifier
//! types, the [`ScalarValue`] sum type, variable metadata
//! ([`VariableDescription`]), and slave metadata ([`SlaveTypeDescription`],
//! [`SlaveDescription`]). Everything here is plain data; the wire encodings
//! live in `stepbus-proto`.

mod error;
mod slave;
mod value;
mod variable;

pub use error::ModelError;
pub use slave::{SlaveDescription, SlaveTypeDescription, is_valid_slave_name};
pub use value::{DataType, ScalarValue};
pub use variable::{
    Causality, ConnectionChange, Variability, Variable, VariableDescription, VariableSetting,
    validate_connection,
};

/// Identifies a slave within one execution.
///
/// Assigned by the master when the slave is added; stable for the slave's
/// lifetime. Zero is reserved and never assigned.
pub type SlaveId = u16;

/// The reserved "no slave" id.
pub const UNASSIGNED_SLAVE_ID: SlaveId = 0;

/// Identifies a variable within one slave's type description.
pub type VariableId = u32;

/// Identifies one time step of an execution.
///
/// The master issues a fresh, strictly increasing id per step. The value −1
/// means "no step performed yet"; ids that travel on the wire are always
/// non-negative.
pub type StepId = i64;

/// The [`StepId`] of a manager that has not yet stepped.
pub const NO_STEP_ID: StepId = -1;

/// A point in simulated time, in model units.
pub type TimePoint = f64;

/// A duration in simulated time, in model units.
pub type TimeDuration = f64;

/// The largest representable simulated time, used as "no stop time".
pub const ETERNITY: TimePoint = f64::INFINITY;
