//! The interface a plugged-in slave model must provide.

use stepbus_model::{
    DataType, ScalarValue, SlaveTypeDescription, TimeDuration, TimePoint, VariableId,
};

/// The result of one [`SlaveInstance::do_step`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step's calculations were carried out.
    Complete,
    /// The step size was too big for the model; a smaller step may work if
    /// the instance supports retrying.
    TooBig,
}

/// Errors from a slave instance.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstanceError {
    /// The variable id is not in the type description.
    #[error("unknown variable {0}")]
    UnknownVariable(VariableId),

    /// A value of the wrong data type was supplied or requested.
    #[error("type mismatch on variable {variable}: expected {expected}, got {actual}")]
    TypeMismatch {
        /// The variable involved.
        variable: VariableId,
        /// The variable's declared data type.
        expected: DataType,
        /// The data type actually used.
        actual: DataType,
    },

    /// The model failed in a way a smaller step will not fix.
    #[error("{0}")]
    Failed(String),
}

/// A slave model: the computation a slave process advances for the master.
///
/// All calls run to completion on the slave's reactor thread; `do_step` in
/// particular is synchronous, and the agent does not report `STEP_OK` until
/// it returns.
pub trait SlaveInstance {
    /// Prepares the instance for an execution covering `[start_time,
    /// stop_time]`. Returns false if the instance cannot operate in that
    /// interval.
    fn setup(
        &mut self,
        start_time: TimePoint,
        stop_time: TimePoint,
        execution_name: &str,
        slave_name: &str,
    ) -> Result<bool, InstanceError>;

    /// Describes this slave's type. Stable across the instance's life.
    fn type_description(&self) -> &SlaveTypeDescription;

    /// Reads a real variable.
    fn get_real_variable(&self, variable: VariableId) -> Result<f64, InstanceError>;

    /// Reads an integer variable.
    fn get_integer_variable(&self, variable: VariableId) -> Result<i32, InstanceError>;

    /// Reads a boolean variable.
    fn get_boolean_variable(&self, variable: VariableId) -> Result<bool, InstanceError>;

    /// Reads a string variable.
    fn get_string_variable(&self, variable: VariableId) -> Result<String, InstanceError>;

    /// Writes a real variable.
    fn set_real_variable(&mut self, variable: VariableId, value: f64)
    -> Result<(), InstanceError>;

    /// Writes an integer variable.
    fn set_integer_variable(
        &mut self,
        variable: VariableId,
        value: i32,
    ) -> Result<(), InstanceError>;

    /// Writes a boolean variable.
    fn set_boolean_variable(
        &mut self,
        variable: VariableId,
        value: bool,
    ) -> Result<(), InstanceError>;

    /// Writes a string variable.
    fn set_string_variable(
        &mut self,
        variable: VariableId,
        value: &str,
    ) -> Result<(), InstanceError>;

    /// Performs the model calculations for the step starting at
    /// `current_time` with duration `delta_time`.
    fn do_step(
        &mut self,
        current_time: TimePoint,
        delta_time: TimeDuration,
    ) -> Result<StepOutcome, InstanceError>;

    /// Reads any variable as a tagged value, dispatching on its declared
    /// data type.
    fn get_variable(&self, variable: VariableId) -> Result<ScalarValue, InstanceError> {
        let data_type = self
            .type_description()
            .variable(variable)
            .ok_or(InstanceError::UnknownVariable(variable))?
            .data_type;
        match data_type {
            DataType::Real => self.get_real_variable(variable).map(ScalarValue::Real),
            DataType::Integer => self.get_integer_variable(variable).map(ScalarValue::Integer),
            DataType::Boolean => self.get_boolean_variable(variable).map(ScalarValue::Boolean),
            DataType::String => self.get_string_variable(variable).map(ScalarValue::String),
        }
    }

    /// Writes any variable from a tagged value, rejecting cross-type writes.
    fn set_variable(
        &mut self,
        variable: VariableId,
        value: &ScalarValue,
    ) -> Result<(), InstanceError> {
        let expected = self
            .type_description()
            .variable(variable)
            .ok_or(InstanceError::UnknownVariable(variable))?
            .data_type;
        let actual = value.data_type();
        if expected != actual {
            return Err(InstanceError::TypeMismatch { variable, expected, actual });
        }
        match value {
            ScalarValue::Real(v) => self.set_real_variable(variable, *v),
            ScalarValue::Integer(v) => self.set_integer_variable(variable, *v),
            ScalarValue::Boolean(v) => self.set_boolean_variable(variable, *v),
            ScalarValue::String(v) => self.set_string_variable(variable, v),
        }
    }
}
