//! Fault taxonomy and wire errors for the pad runtime.
//!
//! Two kinds of faults exist:
//! - [`LoadFault`]: raised while the pad module is evaluated. Terminal for the process.
//! - [`RequestFault`]: raised while a single request is handled. Isolated to that request.
//!
//! Both render into a [`PadError`], the JSON shape returned to callers.

use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Typed error codes reported in the `extensions.code` field of fault responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // Load faults
    UnknownExport,
    InvalidExport,
    MissingSchema,
    InvalidSchema,
    EvaluationFailed,
    EvaluationPanicked,

    // Request faults
    MalformedSecrets,
    MalformedBody,
    PayloadTooLarge,
    SchemaResolution,
    ContextAssembly,
    RootAssembly,

    // HTTP surface
    MethodNotAllowed,

    // Reporting
    ReportFailed,

    // Internal errors
    InternalError,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownExport => "UNKNOWN_EXPORT",
            Self::InvalidExport => "INVALID_EXPORT",
            Self::MissingSchema => "MISSING_SCHEMA",
            Self::InvalidSchema => "INVALID_SCHEMA",
            Self::EvaluationFailed => "EVALUATION_FAILED",
            Self::EvaluationPanicked => "EVALUATION_PANICKED",
            Self::MalformedSecrets => "MALFORMED_SECRETS",
            Self::MalformedBody => "MALFORMED_BODY",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::SchemaResolution => "SCHEMA_RESOLUTION",
            Self::ContextAssembly => "CONTEXT_ASSEMBLY",
            Self::RootAssembly => "ROOT_ASSEMBLY",
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::ReportFailed => "REPORT_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Returns true if this is a client error (4xx equivalent).
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedBody | Self::PayloadTooLarge | Self::MethodNotAllowed
        )
    }

    /// HTTP status used when a fault with this code is returned.
    pub fn status(&self) -> StatusCode {
        if matches!(self, Self::MethodNotAllowed) {
            StatusCode::METHOD_NOT_ALLOWED
        } else if matches!(self, Self::PayloadTooLarge) {
            StatusCode::PAYLOAD_TOO_LARGE
        } else if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fault captured while evaluating the pad module.
///
/// Once captured, the process answers every request with the same fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadFault {
    #[error("Unknown export: {0}")]
    UnknownExport(String),

    #[error("Export `{0}` cannot be a plain value")]
    InvalidExport(String),

    #[error("You need to export object with a field `schema` or a function `schemaFunction` to run a Pad.")]
    MissingSchema,

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("{0}")]
    Evaluation(String),

    #[error("Pad panicked during evaluation: {0}")]
    Panicked(String),
}

impl LoadFault {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownExport(_) => ErrorCode::UnknownExport,
            Self::InvalidExport(_) => ErrorCode::InvalidExport,
            Self::MissingSchema => ErrorCode::MissingSchema,
            Self::InvalidSchema(_) => ErrorCode::InvalidSchema,
            Self::Evaluation(_) => ErrorCode::EvaluationFailed,
            Self::Panicked(_) => ErrorCode::EvaluationPanicked,
        }
    }

    /// Renders the fault as a wire error.
    pub fn to_error(&self) -> PadError {
        PadError::new(self.code(), self.to_string())
    }
}

/// A fault isolated to a single request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestFault {
    #[error("Malformed secrets payload: {0}")]
    MalformedSecrets(String),

    #[error("Malformed request: {0}")]
    MalformedBody(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Failed to resolve schema: {0}")]
    SchemaResolution(String),

    #[error("Failed to build context: {0}")]
    ContextAssembly(String),

    #[error("Failed to build root value: {0}")]
    RootAssembly(String),
}

impl RequestFault {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MalformedSecrets(_) => ErrorCode::MalformedSecrets,
            Self::MalformedBody(_) => ErrorCode::MalformedBody,
            Self::PayloadTooLarge(_) => ErrorCode::PayloadTooLarge,
            Self::SchemaResolution(_) => ErrorCode::SchemaResolution,
            Self::ContextAssembly(_) => ErrorCode::ContextAssembly,
            Self::RootAssembly(_) => ErrorCode::RootAssembly,
        }
    }

    /// Renders the fault as a wire error.
    pub fn to_error(&self) -> PadError {
        PadError::new(self.code(), self.to_string())
    }
}

/// Wire error returned to callers.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("[{code}] {message}")]
pub struct PadError {
    /// Typed error code.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Extra structured details.
    pub extensions: Option<HashMap<String, serde_json::Value>>,
}

impl PadError {
    /// Creates a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            extensions: None,
        }
    }

    /// Adds extension data.
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let extensions = self.extensions.get_or_insert_with(HashMap::new);
        if let Ok(v) = serde_json::to_value(value) {
            extensions.insert(key.into(), v);
        }
        self
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Creates a report shipping error.
    pub fn report(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ReportFailed, message)
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        self.code.status()
    }

    /// Response body for this error: a GraphQL-shaped envelope without `data`.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({ "errors": [self] })
    }
}

impl Serialize for PadError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut extensions = self.extensions.clone().unwrap_or_default();
        extensions.insert(
            "code".to_string(),
            serde_json::Value::String(self.code.as_str().to_string()),
        );

        let mut state = serializer.serialize_struct("PadError", 2)?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("extensions", &extensions)?;
        state.end()
    }
}

impl From<LoadFault> for PadError {
    fn from(fault: LoadFault) -> Self {
        fault.to_error()
    }
}

impl From<RequestFault> for PadError {
    fn from(fault: RequestFault) -> Self {
        fault.to_error()
    }
}

/// Type alias for runtime results.
pub type PadResult<T> = std::result::Result<T, PadError>;

/// Error type user callbacks may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
