use crate::permission::PermissionError;
use crate::query::error::CompileError;
use crate::storage::StorageError;
use thiserror::Error;

/// HTTP-agnostic classification of a request outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
    Forbidden,
    BadQuery,
    Unavailable,
    Internal,
}

impl Status {
    pub fn of<T>(result: &Result<T, Error>) -> Status {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => e.status(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::NotFound => "not_found",
            Status::Forbidden => "forbidden",
            Status::BadQuery => "bad_query",
            Status::Unavailable => "unavailable",
            Status::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnknownField,
    UnsupportedOperator,
    MalformedLiteral,
    SyntaxError,
    InvalidPagination,
    ModelNotWritable,
    FieldNotWritable,
    ImmutableField,
    TypeMismatch,
    UnknownKind,
    UnknownEdge,
    NotFound,
    StorageFailure,
    Timeout,
    InvalidSchema,
    InvalidConfig,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnknownField => "unknown_field",
            ErrorCode::UnsupportedOperator => "unsupported_operator",
            ErrorCode::MalformedLiteral => "malformed_literal",
            ErrorCode::SyntaxError => "syntax_error",
            ErrorCode::InvalidPagination => "invalid_pagination",
            ErrorCode::ModelNotWritable => "model_not_writable",
            ErrorCode::FieldNotWritable => "field_not_writable",
            ErrorCode::ImmutableField => "immutable_field",
            ErrorCode::TypeMismatch => "type_mismatch",
            ErrorCode::UnknownKind => "unknown_kind",
            ErrorCode::UnknownEdge => "unknown_edge",
            ErrorCode::NotFound => "not_found",
            ErrorCode::StorageFailure => "storage_failure",
            ErrorCode::Timeout => "timeout",
            ErrorCode::InvalidSchema => "invalid_schema",
            ErrorCode::InvalidConfig => "invalid_config",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad query: {0}")]
    Compile(#[from] CompileError),
    #[error("forbidden: {0}")]
    Permission(#[from] PermissionError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("unknown kind '{kind}'")]
    UnknownKind { kind: String },
    #[error("kind '{kind}' has no edge '{edge}'")]
    UnknownEdge { kind: String, edge: String },
    #[error("{kind} '{id}' not found")]
    NotFound { kind: String, id: String },
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
    #[error("invalid schema for kind '{kind}': {reason}")]
    InvalidSchema { kind: String, reason: String },
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Compile(e) => match e {
                CompileError::UnknownField { .. } => ErrorCode::UnknownField,
                CompileError::UnsupportedOperator { .. } => ErrorCode::UnsupportedOperator,
                CompileError::MalformedLiteral { .. } => ErrorCode::MalformedLiteral,
                CompileError::SyntaxError { .. } => ErrorCode::SyntaxError,
                CompileError::InvalidPagination { .. } => ErrorCode::InvalidPagination,
            },
            Error::Permission(e) => match e {
                PermissionError::ModelNotWritable { .. } => ErrorCode::ModelNotWritable,
                PermissionError::FieldNotWritable { .. } => ErrorCode::FieldNotWritable,
                PermissionError::UnknownField { .. } => ErrorCode::UnknownField,
                PermissionError::ImmutableField { .. } => ErrorCode::ImmutableField,
                PermissionError::TypeMismatch { .. } => ErrorCode::TypeMismatch,
            },
            Error::Storage(StorageError::Timeout) => ErrorCode::Timeout,
            Error::Storage(StorageError::Execution(_)) => ErrorCode::StorageFailure,
            Error::UnknownKind { .. } => ErrorCode::UnknownKind,
            Error::UnknownEdge { .. } => ErrorCode::UnknownEdge,
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::Timeout { .. } => ErrorCode::Timeout,
            Error::InvalidSchema { .. } => ErrorCode::InvalidSchema,
            Error::InvalidConfig { .. } => ErrorCode::InvalidConfig,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn status(&self) -> Status {
        match self.code() {
            ErrorCode::UnknownField
            | ErrorCode::UnsupportedOperator
            | ErrorCode::MalformedLiteral
            | ErrorCode::SyntaxError
            | ErrorCode::InvalidPagination
            | ErrorCode::UnknownEdge
            | ErrorCode::TypeMismatch => Status::BadQuery,
            ErrorCode::ModelNotWritable
            | ErrorCode::FieldNotWritable
            | ErrorCode::ImmutableField => Status::Forbidden,
            ErrorCode::UnknownKind | ErrorCode::NotFound => Status::NotFound,
            ErrorCode::Timeout => Status::Unavailable,
            ErrorCode::StorageFailure | ErrorCode::InvalidSchema | ErrorCode::InvalidConfig => {
                Status::Internal
            }
        }
    }
}
