#![forbid(unsafe_code)]

use std::collections::TryReserveError;

use thiserror::Error;

use crate::types::{ErrorCode, TesseraError};

/// Error raised while parsing query text.
///
/// Grammar errors carry [`ErrorCode::QueryParse`]; scoping and function
/// errors detected by the parser carry their own codes. `line` is 1-based,
/// `column` 0-based, both counted in characters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SyntaxError {
    /// Status code for the failure.
    pub code: ErrorCode,
    /// Line the error was detected on.
    pub line: usize,
    /// Column the error was detected at.
    pub column: usize,
    /// Full, formatted message.
    pub message: String,
}

impl SyntaxError {
    /// Allocation failure while interning strings.
    pub fn out_of_memory(line: usize, column: usize) -> Self {
        Self {
            code: ErrorCode::OutOfMemory,
            line,
            column,
            message: ErrorCode::OutOfMemory.base_text().to_owned(),
        }
    }
}

/// Recoverable faults raised by the query lifecycle.
///
/// Each public entry point of [`Query`](super::Query) converts these into a
/// failed [`QueryResult`](super::QueryResult). Broken transaction invariants
/// are not represented here; they panic.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryError {
    /// Parser rejected the query text.
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    /// Bind parameters did not match the query.
    #[error("{message}")]
    BindParameter {
        /// Status code.
        code: ErrorCode,
        /// Formatted message.
        message: String,
    },
    /// Transaction could not begin.
    #[error("{message}")]
    TransactionBegin {
        /// Status code of the underlying failure.
        code: ErrorCode,
        /// Message including transaction detail and query text.
        message: String,
    },
    /// Plan construction produced nothing, without a more specific error.
    #[error("failed to create query execution plan")]
    PlanInstantiation,
    /// An allocation failed.
    #[error("out of memory")]
    OutOfMemory,
    /// Domain error with a known code.
    #[error("{message}")]
    Application {
        /// Status code.
        code: ErrorCode,
        /// Formatted message.
        message: String,
    },
    /// Anything unexpected.
    #[error("{0}")]
    Internal(String),
}

impl QueryError {
    /// Builds an application error whose message is the code's base text
    /// followed by `detail`.
    pub fn application(code: ErrorCode, detail: impl AsRef<str>) -> Self {
        let detail = detail.as_ref();
        let message = if detail.is_empty() {
            code.base_text().to_owned()
        } else {
            format!("{}: {detail}", code.base_text())
        };
        QueryError::Application { code, message }
    }

    /// Builds an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        QueryError::Internal(message.into())
    }

    /// Status code reported for this fault.
    pub fn code(&self) -> ErrorCode {
        match self {
            QueryError::Syntax(err) => err.code,
            QueryError::BindParameter { code, .. }
            | QueryError::TransactionBegin { code, .. }
            | QueryError::Application { code, .. } => *code,
            QueryError::PlanInstantiation | QueryError::Internal(_) => ErrorCode::Internal,
            QueryError::OutOfMemory => ErrorCode::OutOfMemory,
        }
    }
}

impl From<TesseraError> for QueryError {
    fn from(err: TesseraError) -> Self {
        QueryError::Application {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<TryReserveError> for QueryError {
    fn from(_: TryReserveError) -> Self {
        QueryError::OutOfMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_fault_kind() {
        assert_eq!(QueryError::PlanInstantiation.code(), ErrorCode::Internal);
        assert_eq!(QueryError::OutOfMemory.code(), ErrorCode::OutOfMemory);
        assert_eq!(QueryError::internal("x").code(), ErrorCode::Internal);
        let syntax = SyntaxError {
            code: ErrorCode::QueryParse,
            line: 1,
            column: 4,
            message: "syntax error, unexpected end of query".into(),
        };
        let err: QueryError = syntax.into();
        assert_eq!(err.code(), ErrorCode::QueryParse);
        assert_eq!(err.to_string(), "syntax error, unexpected end of query");
    }

    #[test]
    fn application_message_uses_base_text() {
        let err = QueryError::application(ErrorCode::DivisionByZero, "");
        assert_eq!(err.to_string(), "division by zero");
        let err = QueryError::application(ErrorCode::ArrayExpected, "FOR loop over number");
        assert_eq!(err.to_string(), "array expected: FOR loop over number");
    }

    #[test]
    fn storage_errors_keep_their_code() {
        let err: QueryError = TesseraError::CollectionNotFound("c".into()).into();
        assert_eq!(err.code(), ErrorCode::CollectionNotFound);
    }
}
