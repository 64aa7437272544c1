//! Scalar variable values.

use serde::{Deserialize, Serialize};

use crate::ModelError;

/// The data type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 64-bit floating point.
    Real,
    /// 32-bit signed integer.
    Integer,
    /// Boolean.
    Boolean,
    /// UTF-8 string.
    String,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Real => "real",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::String => "string",
        };
        f.write_str(name)
    }
}

/// The value of a variable, tagged with its data type.
///
/// There is no implicit coercion: assigning a value to a variable of a
/// different data type is rejected wherever values meet variable metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    /// A real (floating point) value.
    Real(f64),
    /// An integer value.
    Integer(i32),
    /// A boolean value.
    Boolean(bool),
    /// A string value.
    String(String),
}

impl ScalarValue {
    /// Returns the data type this value carries.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Real(_) => DataType::Real,
            Self::Integer(_) => DataType::Integer,
            Self::Boolean(_) => DataType::Boolean,
            Self::String(_) => DataType::String,
        }
    }

    /// Checks that this value has the given data type.
    pub fn expect_type(&self, expected: DataType) -> Result<(), ModelError> {
        let actual = self.data_type();
        if actual == expected {
            Ok(())
        } else {
            Err(ModelError::TypeMismatch { expected, actual })
        }
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}
