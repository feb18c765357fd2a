#![forbid(unsafe_code)]

//! Identifier newtypes, stable error codes, and the crate-wide error type.

use std::fmt;

use serde::{Serialize, Serializer};

/// Identifier assigned to a transaction by the transaction manager.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct TransactionId(pub u64);

/// Sequence number of a committed write transaction.
///
/// Documents carry the commit id that made them visible; a reader whose
/// snapshot is at least that id observes them.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
pub struct CommitId(pub u64);

/// Identifier assigned to a collection when it is created.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct CollectionId(pub u32);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable numeric status codes surfaced through query results.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Operation succeeded.
    NoError,
    /// An allocation could not be satisfied.
    OutOfMemory,
    /// Unexpected internal failure.
    Internal,
    /// A caller-supplied argument was malformed.
    BadParameter,
    /// A referenced collection does not exist.
    CollectionNotFound,
    /// A collection with the same name already exists.
    DuplicateName,
    /// A document key is already taken in the target collection.
    UniqueConstraintViolated,
    /// A value that must be a document (object) was something else.
    DocumentTypeInvalid,
    /// The query text could not be parsed.
    QueryParse,
    /// The query text contained no statements.
    QueryEmpty,
    /// A numeric argument was outside its valid range.
    NumberOutOfRange,
    /// A variable was declared twice in the same scope.
    VariableRedeclared,
    /// A variable was referenced but never declared.
    VariableNameUnknown,
    /// A function call referenced an unknown function.
    FunctionNameUnknown,
    /// A function was called with the wrong number of arguments.
    FunctionArgumentNumberMismatch,
    /// A declared bind parameter had no value.
    BindParameterMissing,
    /// A bind parameter value was supplied but never declared.
    BindParameterUndeclared,
    /// A bind parameter value had the wrong type.
    BindParameterType,
    /// An arithmetic operator received a non-numeric operand.
    InvalidArithmeticValue,
    /// Division or modulo by zero.
    DivisionByZero,
    /// A list was required but something else was supplied.
    ArrayExpected,
    /// A transaction could not perform the requested operation.
    TransactionInternal,
}

impl ErrorCode {
    /// Returns the numeric value of the code.
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::NoError => 0,
            ErrorCode::OutOfMemory => 3,
            ErrorCode::Internal => 4,
            ErrorCode::BadParameter => 10,
            ErrorCode::CollectionNotFound => 1203,
            ErrorCode::DuplicateName => 1207,
            ErrorCode::UniqueConstraintViolated => 1210,
            ErrorCode::DocumentTypeInvalid => 1227,
            ErrorCode::QueryParse => 1501,
            ErrorCode::QueryEmpty => 1502,
            ErrorCode::NumberOutOfRange => 1504,
            ErrorCode::VariableRedeclared => 1511,
            ErrorCode::VariableNameUnknown => 1512,
            ErrorCode::FunctionNameUnknown => 1540,
            ErrorCode::FunctionArgumentNumberMismatch => 1541,
            ErrorCode::BindParameterMissing => 1551,
            ErrorCode::BindParameterUndeclared => 1552,
            ErrorCode::BindParameterType => 1553,
            ErrorCode::InvalidArithmeticValue => 1561,
            ErrorCode::DivisionByZero => 1562,
            ErrorCode::ArrayExpected => 1563,
            ErrorCode::TransactionInternal => 1650,
        }
    }

    /// Returns the fixed base text used when formatting messages for this code.
    pub fn base_text(self) -> &'static str {
        match self {
            ErrorCode::NoError => "no error",
            ErrorCode::OutOfMemory => "out of memory",
            ErrorCode::Internal => "internal error",
            ErrorCode::BadParameter => "bad parameter",
            ErrorCode::CollectionNotFound => "collection not found",
            ErrorCode::DuplicateName => "duplicate name",
            ErrorCode::UniqueConstraintViolated => "unique constraint violated",
            ErrorCode::DocumentTypeInvalid => "invalid document type",
            ErrorCode::QueryParse => "syntax error",
            ErrorCode::QueryEmpty => "query is empty",
            ErrorCode::NumberOutOfRange => "number out of range",
            ErrorCode::VariableRedeclared => "variable is assigned multiple times",
            ErrorCode::VariableNameUnknown => "unknown variable",
            ErrorCode::FunctionNameUnknown => "usage of unknown function",
            ErrorCode::FunctionArgumentNumberMismatch => {
                "invalid number of arguments for function"
            }
            ErrorCode::BindParameterMissing => "no value specified for declared bind parameter",
            ErrorCode::BindParameterUndeclared => "bind parameter was not declared in the query",
            ErrorCode::BindParameterType => "bind parameter has an invalid value or type",
            ErrorCode::InvalidArithmeticValue => "invalid arithmetic value",
            ErrorCode::DivisionByZero => "division by zero",
            ErrorCode::ArrayExpected => "array expected",
            ErrorCode::TransactionInternal => "internal transaction error",
        }
    }

    /// Returns `true` for [`ErrorCode::NoError`].
    pub fn is_success(self) -> bool {
        self == ErrorCode::NoError
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

/// Errors raised by the catalog and transaction layers.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TesseraError {
    /// Referenced collection does not exist.
    #[error("collection not found: {0}")]
    CollectionNotFound(String),
    /// Collection name already in use.
    #[error("duplicate name: {0}")]
    DuplicateName(String),
    /// Document key collides with an existing document.
    #[error("unique constraint violated: key '{key}' in collection '{collection}'")]
    UniqueConstraint {
        /// Collection receiving the write.
        collection: String,
        /// Conflicting document key.
        key: String,
    },
    /// Name or key was empty or otherwise unusable.
    #[error("bad parameter: {0}")]
    BadParameter(String),
    /// Written value was not an object.
    #[error("invalid document type: {0}")]
    DocumentType(&'static str),
    /// Invalid use of a transaction that is still recoverable.
    #[error("internal transaction error: {0}")]
    Transaction(String),
    /// Marker log contents failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
}

impl TesseraError {
    /// Maps the error to its stable status code.
    pub fn code(&self) -> ErrorCode {
        match self {
            TesseraError::CollectionNotFound(_) => ErrorCode::CollectionNotFound,
            TesseraError::DuplicateName(_) => ErrorCode::DuplicateName,
            TesseraError::UniqueConstraint { .. } => ErrorCode::UniqueConstraintViolated,
            TesseraError::BadParameter(_) => ErrorCode::BadParameter,
            TesseraError::DocumentType(_) => ErrorCode::DocumentTypeInvalid,
            TesseraError::Transaction(_) => ErrorCode::TransactionInternal,
            TesseraError::Corruption(_) => ErrorCode::Internal,
        }
    }
}

/// Result alias for catalog and transaction operations.
pub type Result<T> = std::result::Result<T, TesseraError>;
