//! Clinical lab exports
//!
//! Rows arrive already matched to a LIMS barcode (see `matching`). Projects
//! with warehouse output upsert individual, site and encounter rows and link
//! the sample; bundle projects hand the row to the clinical assembler.

use super::{find_identifier, find_sample, one_or_many, parse_document, present, string_or_number};
use super::{Outcome, Routine, SkipReason};
use crate::assemble::clinical::{assemble, individual_identifier, ClinicalInput, ClinicalOutput, ClinicalProject};
use crate::assemble::{parse_age, Assembled, Demographics};
use crate::db::{EncounterUpsert, ReceivingRecord, ReceivingTable, Warehouse};
use crate::vocab::{self, age_ceiling, merge_coded, VocabResult};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct ClinicalDocument {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub barcode: Option<String>,
    /// Pre-hashed individual identifier, when the source supplies one.
    #[serde(default)]
    pub individual: Option<String>,
    /// Pre-hashed encounter identifier.
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub encountered: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub age: Option<String>,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub race: Vec<String>,
    #[serde(default)]
    pub ethnicity: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub insurance: Vec<String>,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub vaccine_status: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub icd10: Vec<String>,
    #[serde(default)]
    pub discharge_disposition: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub birth_date: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub results: Vec<ClinicalResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClinicalResult {
    pub target: String,
    pub result: String,
}

impl ClinicalDocument {
    pub fn demographics(&self) -> VocabResult<Demographics> {
        Ok(Demographics {
            age: self.age.as_deref().and_then(parse_age),
            races: merge_coded(self.race.iter().map(String::as_str), vocab::race)?,
            hispanic_latino: self
                .ethnicity
                .as_deref()
                .map(vocab::hispanic_latino)
                .transpose()?
                .flatten(),
            insurance: merge_coded(self.insurance.iter().map(String::as_str), vocab::insurance)?,
        })
    }

    /// Canonical ICD-10 codes, pipe-delimited inputs split, duplicates removed.
    pub fn icd10_codes(&self) -> VocabResult<Vec<String>> {
        let mut codes: Vec<String> = Vec::new();
        for part in self.icd10.iter().flat_map(|value| value.split('|')) {
            if let Some(code) = vocab::icd10(part)? {
                if !codes.contains(&code) {
                    codes.push(code);
                }
            }
        }
        Ok(codes)
    }
}

/// RFC 3339 timestamp or a bare date taken as midnight UTC.
pub fn parse_encountered(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Some(timestamp.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| datetime.and_utc())
}

pub struct ClinicalRoutine {
    project: &'static ClinicalProject,
    hash_secret: String,
}

impl ClinicalRoutine {
    pub fn new(project: &'static ClinicalProject, hash_secret: impl Into<String>) -> Self {
        Self {
            project,
            hash_secret: hash_secret.into(),
        }
    }

    async fn upsert_warehouse(
        &self,
        record: &ReceivingRecord,
        document: &ClinicalDocument,
        barcode: &str,
        warehouse: &mut dyn Warehouse,
    ) -> Result<Outcome> {
        let (_, sample) = match find_sample(warehouse, barcode, self.project.identifier_sets).await? {
            Ok(found) => found,
            Err(skip) => return Ok(Outcome::Skipped(skip)),
        };

        let sex = document.sex.as_deref().map(vocab::sex).transpose()?.flatten();
        let Some(individual) = individual_identifier(document, sex, &self.hash_secret) else {
            return Ok(Outcome::Skipped(SkipReason::MissingDemographics));
        };

        let Some(site) = self.project.resolve_site(document.site.as_deref())? else {
            return Ok(Outcome::Skipped(SkipReason::MissingEncounterData("site")));
        };

        let Some(raw_encountered) = present(document.encountered.as_deref()) else {
            return Ok(Outcome::Skipped(SkipReason::MissingEncounterData("date")));
        };
        let encountered = parse_encountered(raw_encountered).ok_or_else(|| Error::InvalidDocument {
            source_kind: "clinical",
            record_id: record.id,
            message: format!("unparsable encounter date {raw_encountered:?}"),
        })?;

        let Some(identifier) = present(document.identifier.as_deref()) else {
            return Ok(Outcome::Skipped(SkipReason::MissingEncounterData("identifier")));
        };

        let demographics = document.demographics()?;
        let vaccine = document
            .vaccine_status
            .as_deref()
            .map(vocab::vaccine_status)
            .transpose()?
            .flatten();
        let disposition = document
            .discharge_disposition
            .as_deref()
            .map(vocab::discharge_disposition)
            .transpose()?
            .flatten();
        let details = json!({
            "race": demographics.races,
            "ethnicity": demographics.hispanic_latino,
            "insurance": demographics.insurance,
            "vaccine": vaccine,
            "icd10": document.icd10_codes()?,
            "discharge_disposition": disposition,
        });

        let individual_id = warehouse.upsert_individual(&individual, sex).await?;
        let site_id = warehouse
            .upsert_site(site, &json!({ "type": self.project.location_kind }))
            .await?;
        let encounter_id = warehouse
            .upsert_encounter(&EncounterUpsert {
                identifier: identifier.to_string(),
                individual_id,
                site_id,
                encountered,
                age: demographics.age.map(age_ceiling),
                details,
            })
            .await?;
        warehouse.update_sample_encounter(sample.id, encounter_id).await?;

        tracing::debug!(
            record_id = record.id,
            encounter_id,
            sample_id = sample.id,
            "Clinical encounter upserted"
        );
        Ok(Outcome::Processed)
    }

    async fn store_bundle(
        &self,
        record: &ReceivingRecord,
        document: &ClinicalDocument,
        barcode: &str,
        warehouse: &mut dyn Warehouse,
    ) -> Result<Outcome> {
        if let Err(skip) = find_identifier(warehouse, barcode, self.project.identifier_sets).await? {
            return Ok(Outcome::Skipped(skip));
        }

        let input = ClinicalInput {
            record_id: record.id,
            document,
            barcode,
            hash_secret: &self.hash_secret,
        };
        match assemble(self.project, input, Utc::now())? {
            Assembled::Skipped(reason) => Ok(Outcome::Skipped(reason)),
            Assembled::Bundle(bundle) => {
                let bundle_id = warehouse.insert_fhir_bundle(&bundle.to_json()?).await?;
                tracing::debug!(record_id = record.id, bundle_id, "Stored clinical bundle");
                Ok(Outcome::Processed)
            }
        }
    }
}

#[async_trait]
impl Routine for ClinicalRoutine {
    fn name(&self) -> String {
        self.project.etl_name()
    }

    fn revision(&self) -> i32 {
        self.project.revision
    }

    fn table(&self) -> ReceivingTable {
        ReceivingTable::Clinical
    }

    fn selection(&self) -> Option<Value> {
        Some(json!({ "project": self.project.name }))
    }

    async fn process(
        &self,
        record: &ReceivingRecord,
        warehouse: &mut dyn Warehouse,
    ) -> Result<Outcome> {
        let document: ClinicalDocument = parse_document(record, "clinical")?;

        let Some(barcode) = present(document.barcode.as_deref()) else {
            return Ok(Outcome::Skipped(SkipReason::MissingEncounterData("barcode")));
        };

        match self.project.output {
            ClinicalOutput::Warehouse => {
                self.upsert_warehouse(record, &document, barcode, warehouse).await
            }
            ClinicalOutput::FhirBundle => {
                self.store_bundle(record, &document, barcode, warehouse).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn encounter_dates() {
        assert_eq!(
            parse_encountered("2023-03-01"),
            Some(Utc.with_ymd_and_hms(2023, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            parse_encountered("2023-03-01T10:00:00-08:00"),
            Some(Utc.with_ymd_and_hms(2023, 3, 1, 18, 0, 0).unwrap())
        );
        assert_eq!(parse_encountered("March 1st"), None);
    }

    #[test]
    fn icd10_codes_are_merged() {
        let document: ClinicalDocument = serde_json::from_value(json!({
            "icd10": ["j101|R05", "J10.1", ""]
        }))
        .unwrap();
        assert_eq!(document.icd10_codes().unwrap(), vec!["J10.1", "R05"]);
    }

    #[test]
    fn single_race_string_is_accepted() {
        let document: ClinicalDocument =
            serde_json::from_value(json!({ "race": "black|white", "age": "42" })).unwrap();
        let demographics = document.demographics().unwrap();
        assert_eq!(demographics.races, vec!["blackOrAfricanAmerican", "white"]);
        assert_eq!(demographics.age, Some(42.0));
    }
}
