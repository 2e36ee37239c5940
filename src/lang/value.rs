use serde::{Deserialize, Serialize};

/// A value observed on the operand stack.
///
/// The machine stores values as heap nodes; this is the host-side view used
/// for program results and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// IEEE-754 double, the only numeric type.
    Number(f64),

    /// Boolean value.
    Bool(bool),

    /// The undefined value. Unassigned bindings also read as undefined.
    Undefined,

    /// A function value: its entry address and how many slots a call binds.
    Closure {
        address: usize,
        env_extension: usize,
    },
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Undefined => "undefined",
            Value::Closure { .. } => "function",
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Undefined => write!(f, "undefined"),
            Value::Closure { address, .. } => write!(f, "<closure @{:04}>", address),
        }
    }
}
