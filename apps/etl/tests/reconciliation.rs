#![allow(unused)]
mod support;

use async_trait::async_trait;
use intake_etl::assemble::{clinical, redcap};
use intake_etl::config::AbortPolicy;
use intake_etl::db::{LogStatus, ReceivingRecord, ReceivingStore, ReceivingTable, Warehouse};
use intake_etl::engine::RunSummary;
use intake_etl::routines::{
    ClinicalRoutine, Outcome, PresenceAbsenceRoutine, RedcapDetRoutine, Routine,
};
use intake_etl::vocab::VocabularyError;
use intake_etl::{Error, Result};
use serde_json::{json, Value};
use std::sync::Mutex;
use support::*;

fn sch() -> ClinicalRoutine {
    ClinicalRoutine::new(&clinical::SCH, HASH_SECRET)
}

#[tokio::test]
async fn unknown_barcode_is_skipped_without_writes() -> anyhow::Result<()> {
    let t = TestStore::new();
    let id = t
        .insert(ReceivingTable::Clinical, clinical_document("ABC123", "enc-1"))
        .await?;

    let summary = t.reconciler(AbortPolicy::Abort).run(&sch()).await?;

    assert_eq!(summary, RunSummary { processed: 0, skipped: 1, failed: 0 });
    let log = t.log_of(ReceivingTable::Clinical, id);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, LogStatus::Skipped);
    assert_eq!(log[0].etl, "clinical-sch");
    assert_eq!(log[0].reason.as_deref(), Some("unknown barcode \"ABC123\""));
    assert!(t.store.individuals().is_empty());
    assert!(t.store.encounters().is_empty());
    assert!(t.store.samples().is_empty());
    Ok(())
}

#[tokio::test]
async fn repeated_encounter_identifier_is_a_correction() -> anyhow::Result<()> {
    let t = TestStore::new();
    let (_, first_sample) = t.sample("AAAA0001");
    let (_, second_sample) = t.sample("AAAA0002");

    t.insert(ReceivingTable::Clinical, clinical_document("AAAA0001", "enc-1"))
        .await?;
    let mut corrected = clinical_document("AAAA0002", "enc-1");
    corrected["age"] = json!(35);
    t.insert(ReceivingTable::Clinical, corrected).await?;

    let summary = t.reconciler(AbortPolicy::Abort).run(&sch()).await?;
    assert_eq!(summary.processed, 2);

    let encounters = t.store.encounters();
    assert_eq!(encounters.len(), 1);
    assert_eq!(encounters[0].encounter.identifier, "enc-1");
    assert_eq!(encounters[0].encounter.age, Some(35.0));
    assert_eq!(
        encounters[0].encounter.details["race"],
        json!(["blackOrAfricanAmerican", "white"])
    );

    let encounter_id = encounters[0].id;
    for sample in t.store.samples() {
        assert_eq!(sample.encounter_id, Some(encounter_id));
    }
    Ok(())
}

#[tokio::test]
async fn ages_are_capped_in_encounters() -> anyhow::Result<()> {
    let t = TestStore::new();
    t.sample("AAAA0001");
    let mut document = clinical_document("AAAA0001", "enc-1");
    document["age"] = json!("97");
    t.insert(ReceivingTable::Clinical, document).await?;

    t.reconciler(AbortPolicy::Abort).run(&sch()).await?;

    assert_eq!(t.store.encounters()[0].encounter.age, Some(85.0));
    Ok(())
}

#[tokio::test]
async fn unknown_ethnicity_aborts_the_run() -> anyhow::Result<()> {
    let t = TestStore::new();
    t.sample("AAAA0001");
    t.sample("AAAA0002");
    let good = t
        .insert(ReceivingTable::Clinical, clinical_document("AAAA0001", "enc-1"))
        .await?;
    let mut document = clinical_document("AAAA0002", "enc-2");
    document["ethnicity"] = json!("FOOBARBAZ");
    let bad = t.insert(ReceivingTable::Clinical, document).await?;

    let err = t.reconciler(AbortPolicy::Abort).run(&sch()).await.unwrap_err();

    assert!(matches!(
        err,
        Error::Vocabulary(VocabularyError::UnknownEthnicity(ref value)) if value == "FOOBARBAZ"
    ));
    assert!(t.log_of(ReceivingTable::Clinical, good).is_empty());
    assert!(t.log_of(ReceivingTable::Clinical, bad).is_empty());
    assert!(t.store.individuals().is_empty());
    assert!(t.store.encounters().is_empty());
    assert!(t.store.samples().iter().all(|s| s.encounter_id.is_none()));
    Ok(())
}

#[tokio::test]
async fn isolate_policy_leaves_only_the_bad_record_pending() -> anyhow::Result<()> {
    let t = TestStore::new();
    t.sample("AAAA0001");
    t.sample("AAAA0002");
    t.insert(ReceivingTable::Clinical, clinical_document("AAAA0001", "enc-1"))
        .await?;
    let mut document = clinical_document("AAAA0002", "enc-2");
    document["race"] = json!("martian");
    let bad = t.insert(ReceivingTable::Clinical, document).await?;

    let reconciler = t.reconciler(AbortPolicy::Isolate);
    let summary = reconciler.run(&sch()).await?;
    assert_eq!(summary, RunSummary { processed: 1, skipped: 0, failed: 1 });
    assert!(t.log_of(ReceivingTable::Clinical, bad).is_empty());
    assert_eq!(t.store.encounters().len(), 1);
    assert_eq!(reconciler.pending(&sch()).await?, 1);

    // Still bad, still pending.
    let summary = reconciler.run(&sch()).await?;
    assert_eq!(summary, RunSummary { processed: 0, skipped: 0, failed: 1 });
    Ok(())
}

#[tokio::test]
async fn isolate_policy_still_aborts_on_integrity_errors() -> anyhow::Result<()> {
    let t = TestStore::new();
    t.store.register_identifier("KIT0001", "kits");
    t.insert(ReceivingTable::Clinical, clinical_document("KIT0001", "enc-1"))
        .await?;

    let err = t
        .reconciler(AbortPolicy::Isolate)
        .run(&sch())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IdentifierSetMismatch { .. }));
    Ok(())
}

/// Writes an individual, then fails on records whose document says so.
struct HalfWriter {
    revision: i32,
    seen: Mutex<Vec<i64>>,
}

impl HalfWriter {
    fn new(revision: i32) -> Self {
        Self {
            revision,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<i64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Routine for HalfWriter {
    fn name(&self) -> String {
        "half-writer".to_string()
    }

    fn revision(&self) -> i32 {
        self.revision
    }

    fn table(&self) -> ReceivingTable {
        ReceivingTable::Longitudinal
    }

    async fn process(
        &self,
        record: &ReceivingRecord,
        warehouse: &mut dyn Warehouse,
    ) -> Result<Outcome> {
        self.seen.lock().unwrap().push(record.id);
        warehouse
            .upsert_individual(&format!("individual-{}", record.id), None)
            .await?;
        if record.document["fail"] == json!(true) {
            return Err(Error::InvalidDocument {
                source_kind: "longitudinal",
                record_id: record.id,
                message: "failed after writing".into(),
            });
        }
        Ok(Outcome::Processed)
    }
}

#[tokio::test]
async fn failed_record_leaves_no_partial_writes() -> anyhow::Result<()> {
    let t = TestStore::new();
    let first = t.insert(ReceivingTable::Longitudinal, json!({"fail": false})).await?;
    let second = t.insert(ReceivingTable::Longitudinal, json!({"fail": true})).await?;
    let third = t.insert(ReceivingTable::Longitudinal, json!({"fail": false})).await?;

    let routine = HalfWriter::new(1);
    let summary = t.reconciler(AbortPolicy::Isolate).run(&routine).await?;
    assert_eq!(summary, RunSummary { processed: 2, skipped: 0, failed: 1 });
    assert_eq!(routine.seen(), vec![first, second, third]);

    let individuals: Vec<String> = t
        .store
        .individuals()
        .into_iter()
        .map(|i| i.identifier)
        .collect();
    assert_eq!(
        individuals,
        vec![format!("individual-{first}"), format!("individual-{third}")]
    );
    Ok(())
}

#[tokio::test]
async fn aborted_run_rolls_back_earlier_records_too() -> anyhow::Result<()> {
    let t = TestStore::new();
    t.insert(ReceivingTable::Longitudinal, json!({"fail": false})).await?;
    t.insert(ReceivingTable::Longitudinal, json!({"fail": true})).await?;

    let result = t.reconciler(AbortPolicy::Abort).run(&HalfWriter::new(1)).await;
    assert!(matches!(result, Err(Error::InvalidDocument { .. })));
    assert!(t.store.individuals().is_empty());
    Ok(())
}

#[tokio::test]
async fn second_run_changes_nothing() -> anyhow::Result<()> {
    let t = TestStore::new();
    t.sample("AAAA0001");
    t.insert(ReceivingTable::Clinical, clinical_document("AAAA0001", "enc-1"))
        .await?;
    t.insert(ReceivingTable::Clinical, clinical_document("ZZZZ9999", "enc-2"))
        .await?;

    let reconciler = t.reconciler(AbortPolicy::Abort);
    reconciler.run(&sch()).await?;
    let encounters = t.store.encounters();
    let records = t.store.records(ReceivingTable::Clinical);

    let summary = reconciler.run(&sch()).await?;
    assert_eq!(summary, RunSummary::default());
    assert_eq!(t.store.encounters(), encounters);
    assert_eq!(t.store.records(ReceivingTable::Clinical), records);
    Ok(())
}

#[tokio::test]
async fn records_are_reprocessed_only_under_a_new_revision() -> anyhow::Result<()> {
    let t = TestStore::new();
    let first = t.insert(ReceivingTable::Longitudinal, json!({})).await?;
    let reconciler = t.reconciler(AbortPolicy::Abort);

    let revision_one = HalfWriter::new(1);
    reconciler.run(&revision_one).await?;

    let second = t.insert(ReceivingTable::Longitudinal, json!({})).await?;
    reconciler.run(&revision_one).await?;
    assert_eq!(revision_one.seen(), vec![first, second]);

    let revision_two = HalfWriter::new(2);
    reconciler.run(&revision_two).await?;
    assert_eq!(revision_two.seen(), vec![first, second]);

    let revisions: Vec<i32> = t
        .log_of(ReceivingTable::Longitudinal, first)
        .into_iter()
        .map(|e| e.revision)
        .collect();
    assert_eq!(revisions, vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn dry_run_leaves_everything_pending() -> anyhow::Result<()> {
    let t = TestStore::new();
    t.sample("AAAA0001");
    let id = t
        .insert(ReceivingTable::Clinical, clinical_document("AAAA0001", "enc-1"))
        .await?;

    let summary = t.dry_run_reconciler().run(&sch()).await?;
    assert_eq!(summary.processed, 1);
    assert!(t.log_of(ReceivingTable::Clinical, id).is_empty());
    assert!(t.store.encounters().is_empty());
    Ok(())
}

#[tokio::test]
async fn concurrent_runs_never_share_records() -> anyhow::Result<()> {
    let t = TestStore::new();
    t.insert(ReceivingTable::Longitudinal, json!({})).await?;
    t.insert(ReceivingTable::Longitudinal, json!({})).await?;

    let mut other = t.store.begin_run(ReceivingTable::Longitudinal).await?;
    let held = other.select_pending("half-writer", 1, None).await?;
    assert_eq!(held.len(), 2);

    let routine = HalfWriter::new(1);
    let summary = t.reconciler(AbortPolicy::Abort).run(&routine).await?;
    assert_eq!(summary, RunSummary::default());

    other.rollback().await?;
    let summary = t.reconciler(AbortPolicy::Abort).run(&routine).await?;
    assert_eq!(summary.processed, 2);
    Ok(())
}

#[tokio::test]
async fn clinical_projects_only_see_their_own_rows() -> anyhow::Result<()> {
    let t = TestStore::new();
    t.sample("AAAA0001");
    let mut kp = clinical_document("AAAA0001", "enc-1");
    kp["project"] = json!("kp");
    let kp_id = t.insert(ReceivingTable::Clinical, kp).await?;

    let summary = t.reconciler(AbortPolicy::Abort).run(&sch()).await?;
    assert_eq!(summary, RunSummary::default());
    assert!(t.log_of(ReceivingTable::Clinical, kp_id).is_empty());
    Ok(())
}

#[tokio::test]
async fn uw_rows_with_unknown_sites_are_rejected() -> anyhow::Result<()> {
    let t = TestStore::new();
    t.sample("AAAA0001");
    let mut document = clinical_document("AAAA0001", "enc-1");
    document["project"] = json!("uw-retrospective");
    document["site"] = json!("Mars General");
    t.insert(ReceivingTable::Clinical, document).await?;

    let routine = ClinicalRoutine::new(&clinical::UW_RETROSPECTIVE, HASH_SECRET);
    let err = t.reconciler(AbortPolicy::Abort).run(&routine).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Vocabulary(VocabularyError::UnknownSite(_))
    ));
    Ok(())
}

#[tokio::test]
async fn kp2023_rows_become_bundles() -> anyhow::Result<()> {
    let t = TestStore::new();
    t.store.register_identifier("BC99", "collections-kaiser");
    let mut document = clinical_document("BC99", "enc-1");
    document["project"] = json!("kp2023");
    document["results"] = json!([{"target": "Flu A", "result": "detected"}]);
    t.insert(ReceivingTable::Clinical, document).await?;

    let routine = ClinicalRoutine::new(&clinical::KP2023, HASH_SECRET);
    let summary = t.reconciler(AbortPolicy::Abort).run(&routine).await?;
    assert_eq!(summary.processed, 1);

    let bundles = t.bundles();
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0]["resourceType"], "Bundle");
    assert_eq!(bundles[0]["type"], "collection");
    // Bundle output leaves the warehouse alone.
    assert!(t.store.encounters().is_empty());
    Ok(())
}

#[tokio::test]
async fn presence_absence_results_are_upserted_per_target() -> anyhow::Result<()> {
    let t = TestStore::new();
    let (uuid, sample_id) = t.sample("AAAA0001");
    let document = |flu: &str| {
        json!({
            "barcode": "AAAA0001",
            "chip": "chip-1",
            "assay": "OpenArray",
            "results": [
                {"target": "Flu_A_pan", "status": flu},
                {"target": "RSVA", "status": "Not Detected"}
            ]
        })
    };
    t.insert(ReceivingTable::PresenceAbsence, document("Inconclusive")).await?;

    let reconciler = t.reconciler(AbortPolicy::Abort);
    reconciler.run(&PresenceAbsenceRoutine).await?;

    // A rerun of the chip corrects the earlier result.
    t.insert(ReceivingTable::PresenceAbsence, document("Detected")).await?;
    reconciler.run(&PresenceAbsenceRoutine).await?;

    let mut results = t.store.presence_absence();
    results.sort_by(|a, b| a.result.identifier.cmp(&b.result.identifier));
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].result.identifier, format!("{uuid}/Flu_A_pan"));
    assert_eq!(results[0].result.present, Some(true));
    assert_eq!(results[0].result.sample_id, sample_id);
    assert_eq!(results[1].result.present, Some(false));
    Ok(())
}

#[tokio::test]
async fn unrecognized_assay_status_is_fatal() -> anyhow::Result<()> {
    let t = TestStore::new();
    t.sample("AAAA0001");
    t.insert(
        ReceivingTable::PresenceAbsence,
        json!({"barcode": "AAAA0001", "results": [{"target": "RSVA", "status": "purple"}]}),
    )
    .await?;

    let err = t
        .reconciler(AbortPolicy::Isolate)
        .run(&PresenceAbsenceRoutine)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Integrity(_)));
    assert!(t.store.presence_absence().is_empty());
    Ok(())
}

#[tokio::test]
async fn redcap_det_bundles_are_queued() -> anyhow::Result<()> {
    let t = TestStore::new();
    t.store.register_identifier("SCAN0001", "collections-scan");
    let complete = t.insert(ReceivingTable::RedcapDet, scan_det("1", "SCAN0001")).await?;

    let mut incomplete = scan_det("2", "SCAN0002");
    incomplete["redcap_record"]["consent_form_complete"] = json!("0");
    let incomplete = t.insert(ReceivingTable::RedcapDet, incomplete).await?;

    let mut other_project = scan_det("3", "SCAN0003");
    other_project["project_id"] = json!("99999");
    let other_project = t.insert(ReceivingTable::RedcapDet, other_project).await?;

    let routine = RedcapDetRoutine::new(&redcap::SCAN, HASH_SECRET);
    let summary = t.reconciler(AbortPolicy::Abort).run(&routine).await?;
    assert_eq!(summary, RunSummary { processed: 1, skipped: 1, failed: 0 });

    assert_eq!(t.status_of(ReceivingTable::RedcapDet, complete), vec![LogStatus::Processed]);
    let log = t.log_of(ReceivingTable::RedcapDet, incomplete);
    assert_eq!(log[0].etl, "redcap-det-scan");
    assert_eq!(log[0].reason.as_deref(), Some("incomplete instruments: consent_form"));
    assert!(t.log_of(ReceivingTable::RedcapDet, other_project).is_empty());

    let bundles = t.bundles();
    assert_eq!(bundles.len(), 1);
    let types: Vec<&str> = bundles[0]["entry"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["resource"]["resourceType"].as_str())
        .collect();
    assert!(types.contains(&"Patient"));
    assert!(types.contains(&"Encounter"));
    assert!(types.contains(&"Specimen"));
    // "Don't know" vaccination produces no Immunization.
    assert!(!types.contains(&"Immunization"));
    Ok(())
}

#[tokio::test]
async fn redcap_det_for_sample_in_wrong_set_is_fatal() -> anyhow::Result<()> {
    let t = TestStore::new();
    t.store.register_identifier("SCAN0001", "collections-kiosks");
    t.insert(ReceivingTable::RedcapDet, scan_det("1", "SCAN0001")).await?;

    let routine = RedcapDetRoutine::new(&redcap::SCAN, HASH_SECRET);
    let err = t.reconciler(AbortPolicy::Abort).run(&routine).await.unwrap_err();
    assert!(matches!(err, Error::IdentifierSetMismatch { .. }));
    assert!(t.bundles().is_empty());
    Ok(())
}

#[tokio::test]
async fn redcap_det_with_numeric_project_id_is_selected() -> anyhow::Result<()> {
    let t = TestStore::new();
    t.store.register_identifier("SCAN0001", "collections-scan");
    let mut det = scan_det("1", "SCAN0001");
    det["project_id"] = json!(20759);
    let id = t.insert(ReceivingTable::RedcapDet, det).await?;

    let routine = RedcapDetRoutine::new(&redcap::SCAN, HASH_SECRET);
    let reconciler = t.reconciler(AbortPolicy::Abort);
    assert_eq!(reconciler.pending(&routine).await?, 1);

    let summary = reconciler.run(&routine).await?;
    assert_eq!(summary, RunSummary { processed: 1, skipped: 0, failed: 0 });
    assert_eq!(t.status_of(ReceivingTable::RedcapDet, id), vec![LogStatus::Processed]);
    assert_eq!(t.bundles().len(), 1);
    assert_eq!(reconciler.pending(&routine).await?, 0);
    Ok(())
}
