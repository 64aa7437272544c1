//! Model-level validation errors.

use crate::{DataType, VariableId};

/// Errors from validating model data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// A value of one data type was used where another was required.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// The data type the context required.
        expected: DataType,
        /// The data type actually supplied.
        actual: DataType,
    },

    /// A slave name is empty or not a valid identifier.
    #[error("invalid slave name: {0:?}")]
    InvalidSlaveName(String),

    /// A connection source has a causality other than Output or
    /// CalculatedParameter.
    #[error("variable {0} cannot be a connection source")]
    InvalidConnectionSource(VariableId),

    /// A connection sink has a causality other than Input or Parameter.
    #[error("variable {0} cannot be a connection sink")]
    InvalidConnectionSink(VariableId),
}
