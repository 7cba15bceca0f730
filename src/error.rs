//! Error types for the batch pipeline
//!
//! Record-level errors are caught at the dispatcher boundary and turned into
//! error-log entries; only configuration errors abort a batch run.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NominaError>;

/// The unified error type for the nomina pipeline
#[derive(Error, Debug)]
pub enum NominaError {
    /// Fatal: the run cannot proceed (bad credentials, unreadable schema,
    /// `ask` policy without an interactive terminal).
    #[error("configuration error: {0}")]
    Config(String),

    /// A record or a service response did not conform to its schema.
    #[error("schema validation failed against {schema}: {detail}")]
    SchemaValidation { schema: String, detail: String },

    /// A required field was absent under the `fail` policy, or a prompted
    /// field was left unanswered with no fallback.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// Network failure, timeout, or a service-reported error.
    #[error("service call failed: {0}")]
    Service(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl NominaError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self::Service(message.into())
    }

    pub fn schema(schema: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::SchemaValidation {
            schema: schema.into(),
            detail: detail.into(),
        }
    }

    /// Whether this error must abort the whole batch run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
