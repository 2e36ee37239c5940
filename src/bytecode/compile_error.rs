use crate::bytecode::verify::VerifyError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// A name that no enclosing scope declares.
    #[error("name not found: {name}")]
    UnboundName { name: String },

    /// An operator symbol the instruction set has no encoding for.
    #[error("unknown operator: {operator} (in {node_type})")]
    UnknownOperator {
        operator: String,
        node_type: &'static str,
    },

    /// A literal form other than number or boolean.
    #[error("unknown literal: {literal}")]
    UnsupportedLiteral { literal: String },

    /// Generated code failed verification (shouldn't happen in normal use).
    #[error("internal compiler error: {0}")]
    Internal(#[from] VerifyError),
}

impl CompileError {
    pub fn unbound(name: &str) -> Self {
        CompileError::UnboundName {
            name: name.to_string(),
        }
    }

    pub fn unknown_operator(operator: &str, node_type: &'static str) -> Self {
        CompileError::UnknownOperator {
            operator: operator.to_string(),
            node_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            CompileError::unbound("foo").to_string(),
            "name not found: foo"
        );
        assert_eq!(
            CompileError::unknown_operator("%", "binary operator combination").to_string(),
            "unknown operator: % (in binary operator combination)"
        );
    }
}
