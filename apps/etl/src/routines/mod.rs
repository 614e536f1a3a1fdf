//! ETL routines over receiving tables
//!
//! A routine turns one receiving record into warehouse writes or a FHIR
//! bundle. Expected gaps in the data come back as [`Outcome::Skipped`];
//! anything returned as `Err` is a real failure and the engine decides
//! whether it stops the run.

pub mod clinical;
pub mod presence_absence;
pub mod redcap_det;

pub use clinical::ClinicalRoutine;
pub use presence_absence::PresenceAbsenceRoutine;
pub use redcap_det::RedcapDetRoutine;

use crate::db::{IdentifierRecord, ReceivingRecord, ReceivingTable, SampleRecord, Warehouse};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnknownBarcode(String),
    SampleNotFound(String),
    MissingDemographics,
    MissingEncounterData(&'static str),
    IncompleteInstruments(Vec<String>),
    NoResults,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnknownBarcode(barcode) => write!(f, "unknown barcode {barcode:?}"),
            SkipReason::SampleNotFound(barcode) => {
                write!(f, "no warehouse sample for barcode {barcode:?}")
            }
            SkipReason::MissingDemographics => f.write_str("missing demographics"),
            SkipReason::MissingEncounterData(field) => write!(f, "missing encounter {field}"),
            SkipReason::IncompleteInstruments(instruments) => {
                write!(f, "incomplete instruments: {}", instruments.join(", "))
            }
            SkipReason::NoResults => f.write_str("no results"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    Skipped(SkipReason),
}

#[async_trait]
pub trait Routine: Send + Sync {
    /// Name recorded in the processing log, e.g. `clinical-sch`.
    fn name(&self) -> String;

    /// Bumped whenever a logic change requires every record to be reprocessed.
    fn revision(&self) -> i32;

    fn table(&self) -> ReceivingTable;

    /// Top-level document fields, compared as text, restricting which
    /// documents this routine sees.
    fn selection(&self) -> Option<Value> {
        None
    }

    async fn process(
        &self,
        record: &ReceivingRecord,
        warehouse: &mut dyn Warehouse,
    ) -> Result<Outcome>;
}

/// Deserialize a receiving document into its source schema.
pub(crate) fn parse_document<T: DeserializeOwned>(
    record: &ReceivingRecord,
    source_kind: &'static str,
) -> Result<T> {
    T::deserialize(&record.document).map_err(|e| Error::InvalidDocument {
        source_kind,
        record_id: record.id,
        message: e.to_string(),
    })
}

/// Whether an identifier set name matches a pattern such as `collections-*`.
pub(crate) fn set_matches(pattern: &str, set_name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => set_name.starts_with(prefix),
        None => pattern == set_name,
    }
}

/// Look up a barcode and check it belongs to one of the expected sets.
///
/// An unknown barcode is a skip; a barcode from the wrong set is an error.
pub(crate) async fn find_identifier(
    warehouse: &mut dyn Warehouse,
    barcode: &str,
    expected_sets: &[&str],
) -> Result<std::result::Result<IdentifierRecord, SkipReason>> {
    let Some(identifier) = warehouse.find_identifier(barcode).await? else {
        return Ok(Err(SkipReason::UnknownBarcode(barcode.to_string())));
    };

    if !expected_sets
        .iter()
        .any(|pattern| set_matches(pattern, &identifier.set_name))
    {
        return Err(Error::IdentifierSetMismatch {
            barcode: barcode.to_string(),
            found: identifier.set_name,
            expected: expected_sets.iter().map(|s| s.to_string()).collect(),
        });
    }

    Ok(Ok(identifier))
}

/// [`find_identifier`] followed by the warehouse sample it names.
pub(crate) async fn find_sample(
    warehouse: &mut dyn Warehouse,
    barcode: &str,
    expected_sets: &[&str],
) -> Result<std::result::Result<(IdentifierRecord, SampleRecord), SkipReason>> {
    let identifier = match find_identifier(warehouse, barcode, expected_sets).await? {
        Ok(identifier) => identifier,
        Err(skip) => return Ok(Err(skip)),
    };

    match warehouse.find_sample(&identifier.uuid).await? {
        Some(sample) => Ok(Ok((identifier, sample))),
        None => Ok(Err(SkipReason::SampleNotFound(barcode.to_string()))),
    }
}

/// Accept either a single string or a list of strings; null is empty.
pub(crate) fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<Option<String>>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values.into_iter().flatten().collect(),
    })
}

/// Accept a string or a number, as REDCap and lab exports mix both.
pub(crate) fn string_or_number<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Trimmed, non-empty text.
pub(crate) fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, ReceivingStore};

    #[test]
    fn identifier_set_patterns() {
        assert!(set_matches("samples", "samples"));
        assert!(set_matches("collections-*", "collections-scan"));
        assert!(!set_matches("collections-*", "samples"));
        assert!(!set_matches("samples", "samples-haarvi"));
    }

    #[tokio::test]
    async fn wrong_identifier_set_is_an_error_not_a_skip() {
        let store = MemoryStore::new();
        store.register_identifier("AAAA0001", "kits");
        let mut run = store.begin_run(ReceivingTable::Clinical).await.unwrap();

        let err = find_identifier(run.warehouse(), "AAAA0001", &["samples", "collections-*"])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdentifierSetMismatch { .. }));

        let skip = find_identifier(run.warehouse(), "ZZZZ", &["samples"])
            .await
            .unwrap();
        assert_eq!(skip, Err(SkipReason::UnknownBarcode("ZZZZ".into())));
    }

    #[test]
    fn skip_reasons_read_well_in_logs() {
        let reason = SkipReason::IncompleteInstruments(vec!["enrollment".into(), "consent".into()]);
        assert_eq!(reason.to_string(), "incomplete instruments: enrollment, consent");
    }
}
