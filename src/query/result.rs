use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::types::ErrorCode;

use super::executor::ExecutionStats;
use super::profile::ProfileReport;

/// Outcome of a query entry point.
///
/// `message` is only meaningful when `code` is not [`ErrorCode::NoError`].
/// Failed results never carry rows.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Status code, `0` on success.
    pub code: ErrorCode,
    /// Error message, empty on success.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Result rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<JsonValue>>,
    /// Execution counters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ExecutionStats>,
    /// Phase durations, when profiling was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileReport>,
}

impl QueryResult {
    /// Successful result without payload.
    pub fn success() -> Self {
        Self {
            code: ErrorCode::NoError,
            message: String::new(),
            rows: None,
            stats: None,
            profile: None,
        }
    }

    /// Failed result.
    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            ..Self::success()
        }
    }

    /// Whether `code` is [`ErrorCode::NoError`].
    pub fn is_success(&self) -> bool {
        self.code == ErrorCode::NoError
    }
}
