//! A scriptable slave instance.

use std::collections::HashMap;
use std::time::Duration;

use stepbus_model::{
    Causality, DataType, ScalarValue, SlaveTypeDescription, TimeDuration, TimePoint, Variability,
    VariableDescription, VariableId,
};
use stepbus_slave::{InstanceError, SlaveInstance, StepOutcome};

type Values = HashMap<VariableId, ScalarValue>;
type StepFn = Box<dyn FnMut(&mut Values, TimePoint, TimeDuration) + Send>;

/// A configurable in-memory slave model.
///
/// Variables live in a value map; `on_step` recomputes outputs from inputs.
/// Steps longer than `max_step` are rejected as too big, and `step_delay`
/// simulates a slow model by blocking inside `do_step`.
pub struct MockSlave {
    description: SlaveTypeDescription,
    values: Values,
    max_step: TimeDuration,
    step_delay: Duration,
    reject_setup: bool,
    on_step: Option<StepFn>,
}

impl MockSlave {
    /// A mock of type `type_name` with no variables.
    pub fn new(type_name: &str) -> Self {
        Self {
            description: SlaveTypeDescription {
                name: type_name.to_string(),
                uuid: format!("mock-{type_name}"),
                description: "harness mock".to_string(),
                author: "stepbus-harness".to_string(),
                version: "1".to_string(),
                variables: Vec::new(),
            },
            values: HashMap::new(),
            max_step: f64::INFINITY,
            step_delay: Duration::ZERO,
            reject_setup: false,
            on_step: None,
        }
    }

    /// The mock's type uuid, for HELLO.
    pub fn uuid(&self) -> String {
        self.description.uuid.clone()
    }

    /// Adds a variable with a default initial value for its type.
    pub fn with_variable(
        mut self,
        id: VariableId,
        name: &str,
        data_type: DataType,
        causality: Causality,
    ) -> Self {
        self.description.variables.push(VariableDescription {
            id,
            name: name.to_string(),
            data_type,
            causality,
            variability: Variability::Continuous,
        });
        let initial = match data_type {
            DataType::Real => ScalarValue::Real(0.0),
            DataType::Integer => ScalarValue::Integer(0),
            DataType::Boolean => ScalarValue::Boolean(false),
            DataType::String => ScalarValue::String(String::new()),
        };
        self.values.insert(id, initial);
        self
    }

    /// Adds a real-valued input.
    pub fn with_real_input(self, id: VariableId, name: &str) -> Self {
        self.with_variable(id, name, DataType::Real, Causality::Input)
    }

    /// Adds a real-valued output.
    pub fn with_real_output(self, id: VariableId, name: &str) -> Self {
        self.with_variable(id, name, DataType::Real, Causality::Output)
    }

    /// Sets a variable's initial value.
    pub fn with_initial(mut self, id: VariableId, value: impl Into<ScalarValue>) -> Self {
        self.values.insert(id, value.into());
        self
    }

    /// Rejects steps longer than `max_step`.
    pub fn with_max_step(mut self, max_step: TimeDuration) -> Self {
        self.max_step = max_step;
        self
    }

    /// Blocks for `delay` inside every `do_step`.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Makes `setup` report that the instance cannot run.
    pub fn rejecting_setup(mut self) -> Self {
        self.reject_setup = true;
        self
    }

    /// Recomputes variables on every completed step.
    pub fn with_on_step(
        mut self,
        f: impl FnMut(&mut Values, TimePoint, TimeDuration) + Send + 'static,
    ) -> Self {
        self.on_step = Some(Box::new(f));
        self
    }

    fn declared(&self, variable: VariableId) -> Result<DataType, InstanceError> {
        self.description
            .variable(variable)
            .map(|v| v.data_type)
            .ok_or(InstanceError::UnknownVariable(variable))
    }

    fn typed_get(&self, variable: VariableId, wanted: DataType) -> Result<&ScalarValue, InstanceError> {
        let declared = self.declared(variable)?;
        if declared != wanted {
            return Err(InstanceError::TypeMismatch {
                variable,
                expected: declared,
                actual: wanted,
            });
        }
        // Present by construction once declared.
        self.values.get(&variable).ok_or(InstanceError::UnknownVariable(variable))
    }

    fn typed_set(
        &mut self,
        variable: VariableId,
        value: ScalarValue,
    ) -> Result<(), InstanceError> {
        let declared = self.declared(variable)?;
        if declared != value.data_type() {
            return Err(InstanceError::TypeMismatch {
                variable,
                expected: declared,
                actual: value.data_type(),
            });
        }
        self.values.insert(variable, value);
        Ok(())
    }
}

impl SlaveInstance for MockSlave {
    fn setup(
        &mut self,
        start_time: TimePoint,
        stop_time: TimePoint,
        _execution_name: &str,
        _slave_name: &str,
    ) -> Result<bool, InstanceError> {
        Ok(!self.reject_setup && start_time <= stop_time)
    }

    fn type_description(&self) -> &SlaveTypeDescription {
        &self.description
    }

    fn get_real_variable(&self, variable: VariableId) -> Result<f64, InstanceError> {
        match self.typed_get(variable, DataType::Real)? {
            ScalarValue::Real(v) => Ok(*v),
            _ => Err(InstanceError::UnknownVariable(variable)),
        }
    }

    fn get_integer_variable(&self, variable: VariableId) -> Result<i32, InstanceError> {
        match self.typed_get(variable, DataType::Integer)? {
            ScalarValue::Integer(v) => Ok(*v),
            _ => Err(InstanceError::UnknownVariable(variable)),
        }
    }

    fn get_boolean_variable(&self, variable: VariableId) -> Result<bool, InstanceError> {
        match self.typed_get(variable, DataType::Boolean)? {
            ScalarValue::Boolean(v) => Ok(*v),
            _ => Err(InstanceError::UnknownVariable(variable)),
        }
    }

    fn get_string_variable(&self, variable: VariableId) -> Result<String, InstanceError> {
        match self.typed_get(variable, DataType::String)? {
            ScalarValue::String(v) => Ok(v.clone()),
            _ => Err(InstanceError::UnknownVariable(variable)),
        }
    }

    fn set_real_variable(
        &mut self,
        variable: VariableId,
        value: f64,
    ) -> Result<(), InstanceError> {
        self.typed_set(variable, ScalarValue::Real(value))
    }

    fn set_integer_variable(
        &mut self,
        variable: VariableId,
        value: i32,
    ) -> Result<(), InstanceError> {
        self.typed_set(variable, ScalarValue::Integer(value))
    }

    fn set_boolean_variable(
        &mut self,
        variable: VariableId,
        value: bool,
    ) -> Result<(), InstanceError> {
        self.typed_set(variable, ScalarValue::Boolean(value))
    }

    fn set_string_variable(
        &mut self,
        variable: VariableId,
        value: &str,
    ) -> Result<(), InstanceError> {
        self.typed_set(variable, ScalarValue::String(value.to_string()))
    }

    fn do_step(
        &mut self,
        current_time: TimePoint,
        delta_time: TimeDuration,
    ) -> Result<StepOutcome, InstanceError> {
        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }
        if delta_time > self.max_step {
            return Ok(StepOutcome::TooBig);
        }
        if let Some(on_step) = self.on_step.as_mut() {
            on_step(&mut self.values, current_time, delta_time);
        }
        Ok(StepOutcome::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_enforce_declared_types() {
        let mut mock = MockSlave::new("m")
            .with_variable(1, "count", DataType::Integer, Causality::Parameter);

        assert_eq!(mock.get_integer_variable(1), Ok(0));
        assert!(matches!(
            mock.get_real_variable(1),
            Err(InstanceError::TypeMismatch { .. })
        ));
        assert!(matches!(
            mock.set_real_variable(1, 1.0),
            Err(InstanceError::TypeMismatch { .. })
        ));
        assert!(matches!(
            mock.get_integer_variable(9),
            Err(InstanceError::UnknownVariable(9))
        ));
    }

    #[test]
    fn on_step_recomputes_outputs() {
        let mut mock = MockSlave::new("gain")
            .with_real_input(1, "u")
            .with_real_output(2, "y")
            .with_on_step(|values, _, _| {
                if let Some(ScalarValue::Real(u)) = values.get(&1).cloned() {
                    values.insert(2, ScalarValue::Real(3.0 * u));
                }
            });

        mock.set_real_variable(1, 2.0).unwrap();
        assert_eq!(mock.do_step(0.0, 0.1), Ok(StepOutcome::Complete));
        assert_eq!(mock.get_real_variable(2), Ok(6.0));
    }

    #[test]
    fn steps_beyond_max_are_too_big() {
        let mut mock = MockSlave::new("fragile").with_max_step(0.05);
        assert_eq!(mock.do_step(0.0, 0.1), Ok(StepOutcome::TooBig));
        assert_eq!(mock.do_step(0.0, 0.01), Ok(StepOutcome::Complete));
    }
}
