//! Shared fixtures for ETL integration tests

use chrono::{TimeZone, Utc};
use intake_etl::config::{AbortPolicy, EtlConfig};
use intake_etl::db::{LogStatus, MemoryStore, ProcessingLogEntry, ReceivingStore, ReceivingTable};
use intake_etl::engine::Reconciler;
use intake_etl::manifest::ManifestRow;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub const HASH_SECRET: &str = "integration-secret";

pub struct TestStore {
    pub store: MemoryStore,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(),
        }
    }

    /// Register `barcode` in the `samples` set and add a sample for it.
    pub fn sample(&self, barcode: &str) -> (Uuid, i64) {
        let uuid = self.store.register_identifier(barcode, "samples");
        let sample_id = self.store.add_sample(Some(uuid), None);
        (uuid, sample_id)
    }

    pub async fn insert(&self, table: ReceivingTable, document: Value) -> anyhow::Result<i64> {
        Ok(self.store.insert_document(table, document).await?)
    }

    pub fn reconciler(&self, policy: AbortPolicy) -> Reconciler {
        let config = EtlConfig {
            abort_policy: policy,
            ..EtlConfig::default()
        };
        Reconciler::new(Arc::new(self.store.clone()), &config)
    }

    pub fn dry_run_reconciler(&self) -> Reconciler {
        let config = EtlConfig {
            dry_run: true,
            ..EtlConfig::default()
        };
        Reconciler::new(Arc::new(self.store.clone()), &config)
    }

    /// Log entries of one receiving record.
    pub fn log_of(&self, table: ReceivingTable, id: i64) -> Vec<ProcessingLogEntry> {
        self.store
            .records(table)
            .into_iter()
            .find(|r| r.id == id)
            .map(|r| {
                r.processing_log
                    .into_iter()
                    .map(|entry| serde_json::from_value(entry).expect("log entry"))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn status_of(&self, table: ReceivingTable, id: i64) -> Vec<LogStatus> {
        self.log_of(table, id).into_iter().map(|e| e.status).collect()
    }

    /// Bundles queued in `receiving.fhir`.
    pub fn bundles(&self) -> Vec<Value> {
        self.store
            .records(ReceivingTable::Fhir)
            .into_iter()
            .map(|r| r.document)
            .collect()
    }
}

/// A complete SCH clinical row for `barcode`.
pub fn clinical_document(barcode: &str, identifier: &str) -> Value {
    json!({
        "project": "sch",
        "barcode": barcode,
        "individual": format!("individual-{identifier}"),
        "identifier": identifier,
        "encountered": "2023-01-15",
        "age": 34,
        "sex": "female",
        "race": "black|white",
        "ethnicity": "not hispanic or latino",
        "insurance": ["Medicaid"],
        "icd10": ["J10.1"],
        "discharge_disposition": "home"
    })
}

/// A SCAN data entry trigger with every required instrument complete.
pub fn scan_det(record: &str, barcode: &str) -> Value {
    json!({
        "redcap_url": "https://redcap.iths.org/",
        "project_id": "20759",
        "record": record,
        "instrument": "back_end_mail_scans",
        "redcap_record": {
            "record_id": record,
            "consent_form_complete": "2",
            "enrollment_questionnaire_complete": "2",
            "back_end_mail_scans_complete": "2",
            "participant_first_name": "Ada",
            "participant_last_name": "Lovelace",
            "birthday": "1990-04-01",
            "sex_new": "Female",
            "home_zipcode_2": "98109",
            "age": "33",
            "enrollment_date_time": "2023-02-01",
            "collection_date": "2023-02-03",
            "race___white": "1",
            "hispanic": "No",
            "symptoms___cough": "1",
            "vaccine": "Don't know",
            "return_utm_barcode": barcode
        }
    })
}

pub fn manifest_row(file: &str, day: u32, fields: &[(&str, &str)]) -> ManifestRow {
    let parsed_at = Utc
        .with_ymd_and_hms(2023, 6, day, 0, 0, 0)
        .single()
        .expect("valid date");
    fields
        .iter()
        .fold(ManifestRow::new(file, parsed_at), |row, (name, value)| {
            row.with_field(name, *value)
        })
}
