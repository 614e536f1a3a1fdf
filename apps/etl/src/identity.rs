//! Salted one-way identifiers for people and encounters
//!
//! Every ingestion path derives an individual's identifier from the same
//! composite of canonicalized fields, so re-ingesting a person through any
//! source converges on one `warehouse.individual` row.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

const FIELD_SEPARATOR: char = '\u{1f}';

/// Identifying fields of one person as they arrive from a source document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersonalIdentity<'a> {
    pub name: Option<&'a str>,
    pub gender: Option<&'a str>,
    pub birth_date: Option<&'a str>,
    pub postal_code: Option<&'a str>,
}

impl PersonalIdentity<'_> {
    /// The canonical composite, or `None` without a name and birth date.
    pub fn composite(&self) -> Option<String> {
        let name = self.name.map(canonicalize).filter(|s| !s.is_empty())?;
        let birth_date = self.birth_date.map(canonicalize).filter(|s| !s.is_empty())?;
        let gender = self.gender.map(canonicalize).unwrap_or_default();
        let postal_code = self.postal_code.map(canonical_postal_code).unwrap_or_default();

        Some(
            [name, gender, birth_date, postal_code]
                .join(&FIELD_SEPARATOR.to_string()),
        )
    }

    pub fn hash(&self, secret: &str) -> Option<String> {
        self.composite().map(|composite| salted_hash(&composite, secret))
    }
}

/// NFKC, lower case, trimmed, internal whitespace collapsed to one space.
pub fn canonicalize(value: &str) -> String {
    value
        .nfkc()
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// First five digits of a US ZIP code; other values are canonicalized as-is.
fn canonical_postal_code(value: &str) -> String {
    let value = canonicalize(value);
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 5 {
        digits[..5].to_string()
    } else {
        value
    }
}

/// Hex SHA-256 of `value` followed by `secret`.
pub fn salted_hash(value: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Identifier for a composite of source keys, such as an encounter's
/// project, record and event.
pub fn hash_parts(parts: &[&str], secret: &str) -> String {
    let composite = parts
        .iter()
        .map(|p| canonicalize(p))
        .collect::<Vec<_>>()
        .join(&FIELD_SEPARATOR.to_string());
    salted_hash(&composite, secret)
}
