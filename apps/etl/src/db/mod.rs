//! Receiving tables and warehouse access
//!
//! A run is one [`RunSession`]: a single transaction that locks the pending
//! rows it selected until commit or rollback. Each record is processed inside
//! a savepoint of that transaction, and all warehouse writes for the record
//! go through [`RunSession::warehouse`] so they share the savepoint.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReceivingTable {
    Clinical,
    Longitudinal,
    PresenceAbsence,
    RedcapDet,
    Fhir,
}

impl ReceivingTable {
    pub fn name(&self) -> &'static str {
        match self {
            ReceivingTable::Clinical => "clinical",
            ReceivingTable::Longitudinal => "longitudinal",
            ReceivingTable::PresenceAbsence => "presence_absence",
            ReceivingTable::RedcapDet => "redcap_det",
            ReceivingTable::Fhir => "fhir",
        }
    }

    pub fn qualified_name(&self) -> &'static str {
        match self {
            ReceivingTable::Clinical => "receiving.clinical",
            ReceivingTable::Longitudinal => "receiving.longitudinal",
            ReceivingTable::PresenceAbsence => "receiving.presence_absence",
            ReceivingTable::RedcapDet => "receiving.redcap_det",
            ReceivingTable::Fhir => "receiving.fhir",
        }
    }
}

impl fmt::Display for ReceivingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.qualified_name())
    }
}

/// One row of a receiving table. The document is never modified after insert.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivingRecord {
    pub id: i64,
    pub document: Value,
    pub processing_log: Vec<Value>,
}

impl ReceivingRecord {
    /// Pending means no log entry carries this routine's name and revision.
    pub fn is_pending(&self, etl: &str, revision: i32) -> bool {
        let marker = ProcessingLogEntry::marker(etl, revision);
        !self
            .processing_log
            .iter()
            .any(|entry| json_contains(entry, &marker))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Processed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub etl: String,
    pub revision: i32,
    pub status: LogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProcessingLogEntry {
    pub fn new(etl: &str, revision: i32, status: LogStatus, reason: Option<String>) -> Self {
        Self {
            etl: etl.to_string(),
            revision,
            status,
            reason,
            timestamp: Utc::now(),
        }
    }

    /// Containment pattern matching any entry written for `(etl, revision)`.
    pub fn marker(etl: &str, revision: i32) -> Value {
        serde_json::json!({ "etl": etl, "revision": revision })
    }
}

/// A barcode registered in `warehouse.identifier`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierRecord {
    pub uuid: Uuid,
    pub barcode: String,
    pub set_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecord {
    pub id: i64,
    pub identifier: Option<String>,
    pub collection_identifier: Option<String>,
    pub encounter_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncounterUpsert {
    pub identifier: String,
    pub individual_id: i64,
    pub site_id: i64,
    pub encountered: DateTime<Utc>,
    /// Age in years, already capped.
    pub age: Option<f64>,
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceAbsenceUpsert {
    /// `<sample uuid>/<target>`
    pub identifier: String,
    pub sample_id: i64,
    pub target_id: i64,
    /// `None` for an inconclusive result
    pub present: Option<bool>,
    pub details: Value,
}

/// Entry point to the receiving tables.
#[async_trait]
pub trait ReceivingStore: Send + Sync {
    /// Open the transaction for one run over `table`.
    async fn begin_run(&self, table: ReceivingTable) -> Result<Box<dyn RunSession>>;

    async fn insert_document(&self, table: ReceivingTable, document: Value) -> Result<i64>;

    /// Number of rows matching the `filter` selection not yet tagged with `(etl, revision)`.
    async fn count_pending(
        &self,
        table: ReceivingTable,
        etl: &str,
        revision: i32,
        filter: Option<&Value>,
    ) -> Result<i64>;
}

/// One open run transaction.
#[async_trait]
pub trait RunSession: Send {
    /// Lock and return pending rows in ascending id order.
    ///
    /// `filter` is an object of top-level document fields, compared as text
    /// (see [`matches_selection`]).
    async fn select_pending(
        &mut self,
        etl: &str,
        revision: i32,
        filter: Option<&Value>,
    ) -> Result<Vec<ReceivingRecord>>;

    async fn savepoint(&mut self, name: &str) -> Result<()>;
    async fn release_savepoint(&mut self, name: &str) -> Result<()>;
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;

    async fn append_processing_log(&mut self, id: i64, entry: &ProcessingLogEntry) -> Result<()>;

    /// Warehouse writes inside this run's transaction.
    fn warehouse(&mut self) -> &mut dyn Warehouse;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Narrow upsert surface over the warehouse schema.
#[async_trait]
pub trait Warehouse: Send {
    async fn find_identifier(&mut self, barcode: &str) -> Result<Option<IdentifierRecord>>;

    /// Sample whose identifier or collection identifier is `uuid`.
    async fn find_sample(&mut self, uuid: &Uuid) -> Result<Option<SampleRecord>>;

    /// Find or create; an existing individual keeps its id and gets `sex` updated.
    async fn upsert_individual(&mut self, identifier: &str, sex: Option<&str>) -> Result<i64>;

    async fn upsert_site(&mut self, identifier: &str, details: &Value) -> Result<i64>;

    /// Insert, or overwrite the encounter with the same identifier.
    async fn upsert_encounter(&mut self, encounter: &EncounterUpsert) -> Result<i64>;

    /// Must touch exactly one row.
    async fn update_sample_encounter(&mut self, sample_id: i64, encounter_id: i64) -> Result<()>;

    async fn find_or_create_target(&mut self, identifier: &str) -> Result<i64>;

    async fn upsert_presence_absence(&mut self, result: &PresenceAbsenceUpsert) -> Result<i64>;

    /// Queue a bundle in `receiving.fhir` for downstream processing.
    async fn insert_fhir_bundle(&mut self, bundle: &Value) -> Result<i64>;
}

/// JSON containment with the semantics of Postgres `jsonb @>`.
///
/// A primitive pattern matches an array holding it only at the top level.
pub fn json_contains(value: &Value, pattern: &Value) -> bool {
    contains_at(value, pattern, true)
}

fn contains_at(value: &Value, pattern: &Value, top_level: bool) -> bool {
    match (value, pattern) {
        (Value::Object(value), Value::Object(pattern)) => pattern.iter().all(|(key, expected)| {
            value
                .get(key)
                .is_some_and(|actual| contains_at(actual, expected, false))
        }),
        (Value::Array(value), Value::Array(pattern)) => pattern.iter().all(|expected| {
            value
                .iter()
                .any(|actual| contains_at(actual, expected, false))
        }),
        (Value::Array(value), scalar) if top_level && !scalar.is_object() && !scalar.is_array() => {
            value.iter().any(|actual| actual == scalar)
        }
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (a, b) => a == b,
    }
}

/// Text form of a top-level document field, as Postgres `->>` renders it.
fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Whether every field of `selection` equals the document's field of the
/// same name, compared as text, so `"20759"` and `20759` select alike.
pub fn matches_selection(document: &Value, selection: &Value) -> bool {
    let Value::Object(wanted) = selection else {
        return false;
    };
    wanted
        .iter()
        .all(|(key, expected)| document.get(key).and_then(field_text) == field_text(expected))
}
