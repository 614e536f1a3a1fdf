//! Error types for bundle construction

use thiserror::Error;

/// Construction contract violations.
///
/// These are bugs in an assembler, never a property of the input data, so the
/// ETL treats them as fatal.
#[derive(Debug, Error)]
pub enum FhirError {
    #[error("bundle has no entries")]
    EmptyBundle,

    #[error("duplicate fullUrl in bundle: {0}")]
    DuplicateFullUrl(String),

    #[error("entry {from} references {target}, which is not in the bundle")]
    UnresolvedReference { from: String, target: String },

    #[error("reference carries neither a literal reference nor an identifier")]
    EmptyReference,

    #[error("failed to serialize resource: {0}")]
    Serialization(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FhirError>;
