//! Variable metadata and reconfiguration settings.

use serde::{Deserialize, Serialize};

use crate::{DataType, ModelError, ScalarValue, SlaveId, VariableId};

/// How a variable participates in the model's calculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Causality {
    /// Set by the environment, constant during simulation.
    Parameter,
    /// Computed from parameters, constant during simulation.
    CalculatedParameter,
    /// Consumed by the model each step.
    Input,
    /// Produced by the model each step.
    Output,
    /// Internal to the model; exposed for inspection only.
    Local,
}

/// When a variable's value may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variability {
    /// Never changes.
    Constant,
    /// Fixed after initialisation.
    Fixed,
    /// May be changed between steps by reconfiguration.
    Tunable,
    /// Changes only at step boundaries.
    Discrete,
    /// May change continuously within a step.
    Continuous,
}

/// Immutable description of one variable in a slave's type description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDescription {
    /// The variable's id, unique within the owning type description.
    pub id: VariableId,
    /// Human-readable variable name.
    pub name: String,
    /// The variable's data type.
    pub data_type: DataType,
    /// The variable's causality.
    pub causality: Causality,
    /// The variable's variability.
    pub variability: Variability,
}

/// A reference to one variable instance in an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Variable {
    /// The slave that owns the variable.
    pub slave: SlaveId,
    /// The variable's id within that slave.
    pub variable: VariableId,
}

impl Variable {
    /// Creates a variable reference.
    pub fn new(slave: SlaveId, variable: VariableId) -> Self {
        Self { slave, variable }
    }
}

impl std::fmt::Display for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.slave, self.variable)
    }
}

/// A requested change to a variable's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionChange {
    /// Leave any existing connection as it is.
    #[default]
    Unchanged,
    /// Connect the variable to the given source.
    Connect(Variable),
    /// Break any existing connection.
    Disconnect,
}

/// One atomic change to a variable at reconfiguration time: a new value,
/// a connection change, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSetting {
    /// The variable being changed.
    pub variable: VariableId,
    /// A new value, if any.
    pub value: Option<ScalarValue>,
    /// A connection change, if any.
    pub connection: ConnectionChange,
}

impl VariableSetting {
    /// A setting which only assigns a new value.
    pub fn value(variable: VariableId, value: impl Into<ScalarValue>) -> Self {
        Self { variable, value: Some(value.into()), connection: ConnectionChange::Unchanged }
    }

    /// A setting which only connects the variable to `source`.
    pub fn connect(variable: VariableId, source: Variable) -> Self {
        Self { variable, value: None, connection: ConnectionChange::Connect(source) }
    }

    /// A setting which only breaks the variable's connection.
    pub fn disconnect(variable: VariableId) -> Self {
        Self { variable, value: None, connection: ConnectionChange::Disconnect }
    }
}

/// Validates that `source` may feed `sink`.
///
/// The source must have causality Output or CalculatedParameter, the sink
/// Input or Parameter, and the data types must be equal.
pub fn validate_connection(
    source: &VariableDescription,
    sink: &VariableDescription,
) -> Result<(), ModelError> {
    match source.causality {
        Causality::Output | Causality::CalculatedParameter => {}
        _ => return Err(ModelError::InvalidConnectionSource(source.id)),
    }
    match sink.causality {
        Causality::Input | Causality::Parameter => {}
        _ => return Err(ModelError::InvalidConnectionSink(sink.id)),
    }
    if source.data_type != sink.data_type {
        return Err(ModelError::TypeMismatch {
            expected: sink.data_type,
            actual: source.data_type,
        });
    }
    Ok(())
}
