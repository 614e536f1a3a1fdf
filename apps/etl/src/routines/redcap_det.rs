//! REDCap data entry triggers
//!
//! A DET row is stored when REDCap notifies us that an instrument was saved.
//! The ingesting side embeds the full exported record under `redcap_record`,
//! so processing never calls back into REDCap.

use super::{find_identifier, parse_document, string_or_number, Outcome, Routine, SkipReason};
use crate::assemble::redcap::{assemble, DetInput, RedcapProject};
use crate::assemble::Assembled;
use crate::db::{ReceivingRecord, ReceivingTable, Warehouse};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
pub struct DetDocument {
    pub redcap_url: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub project_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub record: Option<String>,
    #[serde(default)]
    pub instrument: Option<String>,
    #[serde(default)]
    pub redcap_record: Option<BTreeMap<String, Value>>,
}

impl DetDocument {
    /// Trimmed, non-empty value of a record field.
    pub fn field(&self, name: &str) -> Option<String> {
        match self.redcap_record.as_ref()?.get(name)? {
            Value::String(s) => Some(s.trim()).filter(|s| !s.is_empty()).map(str::to_string),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Codes ticked in a checkbox group, from `<prefix>___<code>` fields.
    pub fn checked(&self, prefix: &str) -> Vec<String> {
        let Some(record) = &self.redcap_record else {
            return Vec::new();
        };
        let prefix = format!("{prefix}___");
        record
            .iter()
            .filter_map(|(key, value)| Some((key.strip_prefix(&prefix)?, value)))
            .filter(|(_, value)| match value {
                Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "1" | "checked"),
                Value::Number(n) => n.as_i64() == Some(1),
                Value::Bool(b) => *b,
                _ => false,
            })
            .map(|(code, _)| code.to_string())
            .collect()
    }

    /// Required instruments whose completion status is not `2` (complete).
    pub fn incomplete_instruments(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|instrument| {
                self.field(&format!("{instrument}_complete")).as_deref() != Some("2")
            })
            .map(|instrument| instrument.to_string())
            .collect()
    }
}

pub struct RedcapDetRoutine {
    project: &'static RedcapProject,
    hash_secret: String,
}

impl RedcapDetRoutine {
    pub fn new(project: &'static RedcapProject, hash_secret: impl Into<String>) -> Self {
        Self {
            project,
            hash_secret: hash_secret.into(),
        }
    }
}

#[async_trait]
impl Routine for RedcapDetRoutine {
    fn name(&self) -> String {
        self.project.etl_name()
    }

    fn revision(&self) -> i32 {
        self.project.revision
    }

    fn table(&self) -> ReceivingTable {
        ReceivingTable::RedcapDet
    }

    fn selection(&self) -> Option<Value> {
        Some(json!({
            "redcap_url": self.project.redcap_url,
            "project_id": self.project.project_id,
        }))
    }

    async fn process(
        &self,
        record: &ReceivingRecord,
        warehouse: &mut dyn Warehouse,
    ) -> Result<Outcome> {
        let det: DetDocument = parse_document(record, "REDCap DET")?;

        if det.redcap_record.is_none() {
            return Ok(Outcome::Skipped(SkipReason::MissingEncounterData("REDCap record")));
        }

        let incomplete = det.incomplete_instruments(self.project.required_instruments);
        if !incomplete.is_empty() {
            return Ok(Outcome::Skipped(SkipReason::IncompleteInstruments(incomplete)));
        }

        let Some(barcode) = det.field(self.project.barcode_field) else {
            return Ok(Outcome::Skipped(SkipReason::MissingEncounterData("barcode")));
        };
        if let Err(skip) = find_identifier(warehouse, &barcode, self.project.identifier_sets).await? {
            return Ok(Outcome::Skipped(skip));
        }

        let input = DetInput {
            record_id: record.id,
            det: &det,
            barcode: &barcode,
            hash_secret: &self.hash_secret,
        };
        match assemble(self.project, input, Utc::now())? {
            Assembled::Skipped(reason) => Ok(Outcome::Skipped(reason)),
            Assembled::Bundle(bundle) => {
                let bundle_id = warehouse.insert_fhir_bundle(&bundle.to_json()?).await?;
                tracing::debug!(
                    record_id = record.id,
                    bundle_id,
                    redcap_record = ?det.record,
                    "Stored REDCap bundle"
                );
                Ok(Outcome::Processed)
            }
        }
    }
}
