//! Slave metadata.

use serde::{Deserialize, Serialize};

use crate::{SlaveId, VariableDescription, VariableId};

/// Describes a slave type: what a slave of this kind is and which variables
/// it exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveTypeDescription {
    /// The type's name.
    pub name: String,
    /// A unique identifier for this exact type and version.
    pub uuid: String,
    /// Free-form description.
    pub description: String,
    /// The type's author.
    pub author: String,
    /// The type's version string.
    pub version: String,
    /// The variables a slave of this type exposes, in declaration order.
    pub variables: Vec<VariableDescription>,
}

impl SlaveTypeDescription {
    /// Looks up a variable description by id.
    pub fn variable(&self, id: VariableId) -> Option<&VariableDescription> {
        self.variables.iter().find(|v| v.id == id)
    }
}

/// Describes one slave in an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveDescription {
    /// The slave's id in the execution.
    pub id: SlaveId,
    /// The slave's name, unique in the execution.
    pub name: String,
    /// The slave's type.
    pub type_description: SlaveTypeDescription,
}

/// Checks whether `name` is a valid slave name: nonempty, starting with a
/// letter or underscore, containing only letters, digits and underscores.
pub fn is_valid_slave_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Causality, DataType, Variability};

    #[test]
    fn valid_and_invalid_slave_names() {
        assert!(is_valid_slave_name("engine"));
        assert!(is_valid_slave_name("_x1"));
        assert!(is_valid_slave_name("Pump_2"));
        assert!(!is_valid_slave_name(""));
        assert!(!is_valid_slave_name("1pump"));
        assert!(!is_valid_slave_name("a b"));
        assert!(!is_valid_slave_name("a-b"));
    }

    #[test]
    fn variable_lookup_by_id() {
        let td = SlaveTypeDescription {
            name: "gain".into(),
            uuid: "f2b9…".into(),
            description: String::new(),
            author: String::new(),
            version: "1.0".into(),
            variables: vec![VariableDescription {
                id: 4,
                name: "u".into(),
                data_type: DataType::Real,
                causality: Causality::Input,
                variability: Variability::Continuous,
            }],
        };
        assert_eq!(td.variable(4).map(|v| v.name.as_str()), Some("u"));
        assert!(td.variable(5).is_none());
    }
}
