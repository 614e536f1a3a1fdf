//! Error types for the ETL routines
//!
//! Skips are not errors: an expected gap in the data comes back as
//! `Ok(Outcome::Skipped(..))` from a routine. Everything here is either a
//! data-quality violation (see [`Error::is_data_quality`]) or something that
//! must stop the run.

use crate::vocab::VocabularyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A present but unrecognized value in a closed vocabulary.
    #[error(transparent)]
    Vocabulary(#[from] VocabularyError),

    /// A receiving document that does not match its source schema.
    #[error("Invalid {source_kind} document in record {record_id}: {message}")]
    InvalidDocument {
        source_kind: &'static str,
        record_id: i64,
        message: String,
    },

    #[error("Identifier {barcode} belongs to set {found}, expected one of {expected:?}")]
    IdentifierSetMismatch {
        barcode: String,
        found: String,
        expected: Vec<String>,
    },

    /// Structural violations: zero-row updates, malformed vendor payloads.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("FHIR construction error: {0}")]
    Fhir(#[from] intake_fhir::FhirError),

    #[error("LIMS request failed: {0}")]
    Lims(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors caused by the content of a single record rather than by the
    /// pipeline or its collaborators.
    pub fn is_data_quality(&self) -> bool {
        matches!(self, Error::Vocabulary(_) | Error::InvalidDocument { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_quality_classification() {
        let vocab = Error::from(VocabularyError::UnknownEthnicity("FOOBARBAZ".into()));
        assert!(vocab.is_data_quality());
        assert_eq!(vocab.to_string(), "Unknown ethnicity: \"FOOBARBAZ\"");

        let integrity = Error::Integrity("updated 0 rows".into());
        assert!(!integrity.is_data_quality());
    }
}
