//! Error taxonomy for pipeline construction, compilation and execution.

use thiserror::Error;

use crate::db::StructuredError;
use crate::stream::Value;

#[derive(Debug, Error)]
pub enum StreamError {
    /// A dialect descriptor, registry or entity definition is malformed.
    #[error("configuration error in {context}: {reason}")]
    Configuration { context: String, reason: String },

    /// A pipeline names a field that the active entity or projection lacks.
    #[error("invalid reference: `{shape}` has no field `{field}`")]
    InvalidReference { shape: String, field: String },

    /// The pushdown scan and the compiler disagree. Always a bug.
    #[error("translation invariant violated: {0}")]
    TranslationInvariant(String),

    /// The engine rejected or failed to run a compiled statement.
    #[error("execution failed: {cause} (sql: {sql}, parameters: {parameters:?})")]
    Execution {
        sql: String,
        parameters: Vec<Value>,
        #[source]
        cause: StructuredError,
    },

    /// No engine is registered under the requested name.
    #[error("unknown dbms type: {0}")]
    UnknownDbms(String),

    /// A fetched row could not be turned into a record.
    #[error("row mapping failed for `{entity}`: {reason}")]
    Mapping { entity: String, reason: String },
}

impl StreamError {
    pub fn configuration(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_reference(shape: impl Into<String>, field: impl Into<String>) -> Self {
        Self::InvalidReference {
            shape: shape.into(),
            field: field.into(),
        }
    }

    /// True for failures reported by the engine rather than by this crate.
    pub fn is_execution(&self) -> bool {
        matches!(self, Self::Execution { .. })
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
