//! Clinical lab export projects
//!
//! Older clinical projects write straight into the warehouse; newer ones
//! emit a FHIR bundle per row instead. Both kinds are described by a
//! [`ClinicalProject`] and share the vocabulary mapping on
//! [`ClinicalDocument`].

use super::{icd10_conditions, Assembled};
use crate::identity::PersonalIdentity;
use crate::routines::clinical::ClinicalDocument;
use crate::routines::presence_absence::result_presence;
use crate::routines::SkipReason;
use crate::vocab::{self, VocabResult, VocabularyError};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use intake_fhir::builders::*;
use intake_fhir::{systems, BundleBuilder, BundleEntry, CodeableConcept, Coding, Identifier};

const INFLUENZA_VACCINE: &str = "88";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClinicalOutput {
    /// Individual, site, encounter and sample rows upserted directly.
    Warehouse,
    /// One bundle per row queued in `receiving.fhir`.
    FhirBundle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClinicalProject {
    pub name: &'static str,
    pub revision: i32,
    pub output: ClinicalOutput,
    pub identifier_sets: &'static [&'static str],
    /// Raw site value to warehouse site identifier. Empty means every row
    /// belongs to `default_site`.
    pub site_map: &'static [(&'static str, &'static str)],
    pub default_site: Option<&'static str>,
    pub location_kind: &'static str,
    pub encounter_class: &'static str,
    /// LOINC code of the diagnostic report grouping lab results.
    pub report_code: &'static str,
}

impl ClinicalProject {
    pub fn etl_name(&self) -> String {
        format!("clinical-{}", self.name)
    }

    /// Warehouse site identifier for a row.
    pub fn resolve_site(&self, raw: Option<&str>) -> VocabResult<Option<&'static str>> {
        let raw = raw.map(str::trim).filter(|s| !s.is_empty());
        match raw {
            Some(site) if !self.site_map.is_empty() => self
                .site_map
                .iter()
                .find(|(code, _)| code.eq_ignore_ascii_case(site))
                .map(|(_, identifier)| Some(*identifier))
                .ok_or_else(|| VocabularyError::UnknownSite(site.to_string())),
            _ => Ok(self.default_site),
        }
    }
}

pub const UW_RETROSPECTIVE: ClinicalProject = ClinicalProject {
    name: "uw-retrospective",
    revision: 5,
    output: ClinicalOutput::Warehouse,
    identifier_sets: &["samples"],
    site_map: &[
        ("uwmc", "UWMC"),
        ("uw", "UWMC"),
        ("hmc", "HMC"),
        ("harborview", "HMC"),
        ("nwh", "NWH"),
        ("northwest", "NWH"),
    ],
    default_site: None,
    location_kind: "HOSP",
    encounter_class: "AMB",
    report_code: "85476-0",
};

pub const SCH: ClinicalProject = ClinicalProject {
    name: "sch",
    revision: 3,
    output: ClinicalOutput::Warehouse,
    identifier_sets: &["samples"],
    site_map: &[],
    default_site: Some("SCH"),
    location_kind: "HOSP",
    encounter_class: "AMB",
    report_code: "85476-0",
};

pub const KP: ClinicalProject = ClinicalProject {
    name: "kp",
    revision: 2,
    output: ClinicalOutput::Warehouse,
    identifier_sets: &["samples"],
    site_map: &[],
    default_site: Some("KaiserPermanente"),
    location_kind: "HOSP",
    encounter_class: "AMB",
    report_code: "85476-0",
};

pub const KP2023: ClinicalProject = ClinicalProject {
    name: "kp2023",
    revision: 1,
    output: ClinicalOutput::FhirBundle,
    identifier_sets: &["samples", "collections-kaiser"],
    site_map: &[],
    default_site: Some("KaiserPermanente"),
    location_kind: "HOSP",
    encounter_class: "AMB",
    report_code: "85476-0",
};

pub const PHSKC: ClinicalProject = ClinicalProject {
    name: "phskc",
    revision: 2,
    output: ClinicalOutput::FhirBundle,
    identifier_sets: &["samples", "collections-clinical-phskc*"],
    site_map: &[],
    default_site: Some("PHSKC"),
    location_kind: "COMM",
    encounter_class: "FLD",
    report_code: "85476-0",
};

pub const PROJECTS: &[ClinicalProject] = &[UW_RETROSPECTIVE, SCH, KP, KP2023, PHSKC];

pub fn by_name(name: &str) -> Option<&'static ClinicalProject> {
    PROJECTS.iter().find(|project| project.name == name)
}

/// A clinical row whose barcode has already been resolved.
#[derive(Debug, Clone, Copy)]
pub struct ClinicalInput<'a> {
    pub record_id: i64,
    pub document: &'a ClinicalDocument,
    pub barcode: &'a str,
    pub hash_secret: &'a str,
}

/// Individual identifier: supplied by the source, or hashed from PII.
pub fn individual_identifier(
    document: &ClinicalDocument,
    gender: Option<&str>,
    hash_secret: &str,
) -> Option<String> {
    if let Some(individual) = document.individual.as_deref().map(str::trim) {
        if !individual.is_empty() {
            return Some(individual.to_string());
        }
    }
    PersonalIdentity {
        name: document.name.as_deref(),
        gender,
        birth_date: document.birth_date.as_deref(),
        postal_code: document.postal_code.as_deref(),
    }
    .hash(hash_secret)
}

pub fn assemble(
    project: &ClinicalProject,
    input: ClinicalInput<'_>,
    timestamp: DateTime<Utc>,
) -> Result<Assembled> {
    let document = input.document;

    let gender = document.sex.as_deref().map(vocab::sex).transpose()?.flatten();
    let Some(patient) = create_patient(
        individual_identifier(document, gender, input.hash_secret)
            .map(|id| Identifier::new(systems::INDIVIDUAL, id)),
        gender,
        None,
    ) else {
        return Ok(Assembled::Skipped(SkipReason::MissingDemographics));
    };
    let subject = patient.reference();

    let site = project.resolve_site(document.site.as_deref())?;
    let location = create_location(site, project.location_kind, None);
    let location_ref = location.as_ref().map(BundleEntry::reference);

    let encountered = document.encountered.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let icd10 = document.icd10_codes()?;
    let conditions = icd10_conditions(&icd10, &subject, encountered);
    let diagnoses: Vec<_> = conditions.iter().map(BundleEntry::reference).collect();

    let Some(encounter_identifier) = document.identifier.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(Assembled::Skipped(SkipReason::MissingEncounterData("identifier")));
    };
    let disposition = document
        .discharge_disposition
        .as_deref()
        .map(vocab::discharge_disposition)
        .transpose()?
        .flatten();
    let Some(encounter) = create_encounter(EncounterInput {
        identifier: Some(Identifier::new(systems::ENCOUNTER, encounter_identifier)),
        class: project.encounter_class,
        start: encountered,
        subject: &subject,
        location: location_ref.as_ref(),
        diagnoses: &diagnoses,
        reason_codes: Vec::new(),
        discharge_disposition: disposition,
    }) else {
        return Ok(Assembled::Skipped(SkipReason::MissingEncounterData("date")));
    };
    let encounter_ref = encounter.reference();

    let Some(specimen) = create_specimen(Some(input.barcode), None, encountered, None) else {
        return Ok(Assembled::Skipped(SkipReason::MissingEncounterData("barcode")));
    };
    let specimen_ref = specimen.reference();
    let specimen_observation = create_specimen_observation(&specimen_ref, &subject, &encounter_ref);

    let mut results = Vec::with_capacity(document.results.len());
    for result in &document.results {
        let present = result_presence(&result.result).ok_or_else(|| {
            Error::Integrity(format!(
                "clinical record {} has unknown result {:?} for {}",
                input.record_id, result.result, result.target
            ))
        })?;
        results.push(create_result_observation(
            result.target.trim(),
            present,
            Some(&subject),
            &specimen_ref,
        ));
    }
    let report = create_diagnostic_report(
        CodeableConcept::from_coding(Coding::new(systems::LOINC, project.report_code)),
        Some(&subject),
        &specimen_ref,
        results.iter().map(BundleEntry::reference).collect(),
    );

    let questionnaire = create_questionnaire_response(
        document.demographics()?.questionnaire_items(),
        &subject,
        &encounter_ref,
    );

    let vaccine_status = document
        .vaccine_status
        .as_deref()
        .map(vocab::vaccine_status)
        .transpose()?
        .flatten();
    let immunization = create_immunization(
        vaccine_status,
        INFLUENZA_VACCINE,
        &subject,
        &encounter_ref,
        None,
    );

    let mut bundle = BundleBuilder::new();
    bundle.push(patient).push_optional(location);
    for condition in conditions {
        bundle.push(condition);
    }
    bundle.push(encounter).push(specimen).push(specimen_observation);
    for result in results {
        bundle.push(result);
    }
    bundle
        .push_optional(report)
        .push_optional(questionnaire)
        .push_optional(immunization);

    Ok(Assembled::Bundle(Box::new(bundle.build(timestamp)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn document() -> ClinicalDocument {
        serde_json::from_value(json!({
            "project": "kp2023",
            "barcode": "BC99",
            "identifier": "enc-1",
            "encountered": "2023-03-01",
            "age": 91,
            "sex": "F",
            "name": "Grace Hopper",
            "birth_date": "1931-12-09",
            "race": "black|white",
            "ethnicity": "not hispanic",
            "icd10": ["j101", "J10.1", "R05"],
            "discharge_disposition": "home",
            "vaccine_status": "yes",
            "results": [
                {"target": "Flu A", "result": "positive"},
                {"target": "RSV", "result": "negative"}
            ]
        }))
        .unwrap()
    }

    fn input(document: &ClinicalDocument) -> ClinicalInput<'_> {
        ClinicalInput {
            record_id: 10,
            document,
            barcode: "BC99",
            hash_secret: "s3cret",
        }
    }

    fn timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 3, 2, 0, 0, 0).unwrap()
    }

    #[test]
    fn kp2023_row_becomes_a_bundle_with_results() {
        let document = document();
        let Assembled::Bundle(bundle) = assemble(&KP2023, input(&document), timestamp()).unwrap() else {
            panic!("expected a bundle");
        };

        let count = |t: &str| bundle.entries_of(t).count();
        assert_eq!(count("Condition"), 2);
        // Specimen observation plus one per result.
        assert_eq!(count("Observation"), 3);
        assert_eq!(count("DiagnosticReport"), 1);
        assert_eq!(count("Immunization"), 1);

        let text = bundle.to_json().unwrap().to_string();
        assert!(text.contains("\"valueInteger\":85"));
        assert!(text.contains("J10.1"));
        assert!(text.contains("\"code\":\"home\""));
    }

    #[test]
    fn supplied_individual_wins_over_hashing() {
        let mut document = document();
        document.individual = Some("ind-7".into());
        assert_eq!(
            individual_identifier(&document, Some("female"), "s3cret").as_deref(),
            Some("ind-7")
        );
        document.individual = None;
        let hashed = individual_identifier(&document, Some("female"), "s3cret").unwrap();
        assert_eq!(hashed.len(), 64);
    }

    #[test]
    fn missing_encounter_identifier_skips() {
        let mut document = document();
        document.identifier = None;
        assert_eq!(
            assemble(&KP2023, input(&document), timestamp()).unwrap(),
            Assembled::Skipped(SkipReason::MissingEncounterData("identifier"))
        );
    }

    #[test]
    fn unknown_lab_result_is_an_integrity_error() {
        let mut document = document();
        document.results[0].result = "spicy".into();
        let err = assemble(&KP2023, input(&document), timestamp()).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn site_maps() {
        assert_eq!(UW_RETROSPECTIVE.resolve_site(Some("HMC")).unwrap(), Some("HMC"));
        assert_eq!(UW_RETROSPECTIVE.resolve_site(None).unwrap(), None);
        assert_eq!(
            UW_RETROSPECTIVE.resolve_site(Some("mars")).unwrap_err(),
            VocabularyError::UnknownSite("mars".into())
        );
        assert_eq!(SCH.resolve_site(Some("anything")).unwrap(), Some("SCH"));
        assert_eq!(by_name("phskc").map(|p| p.output), Some(ClinicalOutput::FhirBundle));
    }
}
