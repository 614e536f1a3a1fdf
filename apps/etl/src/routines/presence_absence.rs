//! Presence/absence assay results
//!
//! One receiving document per sample run on a chip. Each target result is
//! upserted under `<sample uuid>/<target>`, so a re-run of the same sample
//! overwrites rather than duplicates.

use super::{find_sample, parse_document, present, Outcome, Routine, SkipReason};
use crate::db::{PresenceAbsenceUpsert, ReceivingRecord, ReceivingTable, Warehouse};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

pub const ETL_NAME: &str = "presence-absence";
pub const REVISION: i32 = 3;

const EXPECTED_SETS: &[&str] = &["samples"];

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceAbsenceDocument {
    pub barcode: Option<String>,
    pub chip: Option<String>,
    pub assay: Option<String>,
    #[serde(default)]
    pub results: Vec<TargetResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetResult {
    pub target: String,
    pub status: String,
}

/// `Some(Some(true))` detected, `Some(Some(false))` not detected,
/// `Some(None)` inconclusive, `None` unrecognized.
pub fn result_presence(status: &str) -> Option<Option<bool>> {
    match status.trim().to_lowercase().as_str() {
        "positive" | "detected" | "present" | "pos" => Some(Some(true)),
        "negative" | "not detected" | "absent" | "neg" => Some(Some(false)),
        "inconclusive" | "indeterminate" | "ind" | "invalid" => Some(None),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct PresenceAbsenceRoutine;

#[async_trait]
impl Routine for PresenceAbsenceRoutine {
    fn name(&self) -> String {
        ETL_NAME.to_string()
    }

    fn revision(&self) -> i32 {
        REVISION
    }

    fn table(&self) -> ReceivingTable {
        ReceivingTable::PresenceAbsence
    }

    async fn process(
        &self,
        record: &ReceivingRecord,
        warehouse: &mut dyn Warehouse,
    ) -> Result<Outcome> {
        let document: PresenceAbsenceDocument = parse_document(record, "presence/absence")?;

        let Some(barcode) = present(document.barcode.as_deref()) else {
            return Ok(Outcome::Skipped(SkipReason::MissingEncounterData("barcode")));
        };
        if document.results.is_empty() {
            return Ok(Outcome::Skipped(SkipReason::NoResults));
        }

        // Vendor payload shape is checked before anything is written.
        let mut results = Vec::with_capacity(document.results.len());
        for result in &document.results {
            let target = result.target.trim();
            if target.is_empty() {
                return Err(Error::Integrity(format!(
                    "presence/absence record {} has a result without a target",
                    record.id
                )));
            }
            let present = result_presence(&result.status).ok_or_else(|| {
                Error::Integrity(format!(
                    "presence/absence record {} has unknown result status {:?} for {}",
                    record.id, result.status, target
                ))
            })?;
            results.push((target, present, result.status.as_str()));
        }

        let (identifier, sample) = match find_sample(warehouse, barcode, EXPECTED_SETS).await? {
            Ok(found) => found,
            Err(skip) => return Ok(Outcome::Skipped(skip)),
        };

        for (target, present, status) in results {
            let target_id = warehouse.find_or_create_target(target).await?;
            warehouse
                .upsert_presence_absence(&PresenceAbsenceUpsert {
                    identifier: format!("{}/{}", identifier.uuid, target),
                    sample_id: sample.id,
                    target_id,
                    present,
                    details: json!({
                        "assay": document.assay,
                        "chip": document.chip,
                        "status": status,
                    }),
                })
                .await?;
        }

        tracing::debug!(record_id = record.id, sample_id = sample.id, "Presence/absence results upserted");
        Ok(Outcome::Processed)
    }
}
