use thiserror::Error;

/// Rejection of untrusted query text. Never retried and never partially applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("unknown field '{field}'")]
    UnknownField { field: String },
    #[error("unsupported operator '{operator}' at offset {position}")]
    UnsupportedOperator { operator: String, position: usize },
    #[error("malformed literal at offset {position}: {reason}")]
    MalformedLiteral { position: usize, reason: String },
    #[error("syntax error at offset {position}: {reason}")]
    SyntaxError { position: usize, reason: String },
    #[error("invalid pagination: {reason}")]
    InvalidPagination { reason: String },
}

impl CompileError {
    pub(crate) fn syntax(position: usize, reason: impl Into<String>) -> Self {
        CompileError::SyntaxError {
            position,
            reason: reason.into(),
        }
    }

    pub(crate) fn literal(position: usize, reason: impl Into<String>) -> Self {
        CompileError::MalformedLiteral {
            position,
            reason: reason.into(),
        }
    }

    pub(crate) fn unknown_field(field: impl Into<String>) -> Self {
        CompileError::UnknownField {
            field: field.into(),
        }
    }
}
