//! Resource builders
//!
//! Every builder is a pure function returning `Option<BundleEntry>`; callers
//! take the entry's [`BundleEntry::reference`] to link later resources.
//! `None` means the inputs were insufficient. Whether that skips the whole
//! record (Patient, Encounter, Specimen) or only drops the resource
//! (everything else) is the assembler's call.

use crate::bundle::BundleEntry;
use crate::common::*;
use crate::resources::*;
use crate::systems;

pub fn create_patient(
    identifier: Option<Identifier>,
    gender: Option<&str>,
    postal_code: Option<&str>,
) -> Option<BundleEntry> {
    let identifier = identifier?;

    let address = postal_code
        .map(|zip| Address {
            use_: Some("home".to_string()),
            postal_code: Some(zip.to_string()),
            country: Some("US".to_string()),
        })
        .into_iter()
        .collect();

    Some(BundleEntry::new(Patient {
        identifier: vec![identifier],
        gender: gender.map(str::to_string),
        address,
    }))
}

/// Inputs for [`create_encounter`]
#[derive(Debug, Clone)]
pub struct EncounterInput<'a> {
    pub identifier: Option<Identifier>,
    pub class: &'a str,
    /// FHIR date or dateTime
    pub start: Option<&'a str>,
    pub subject: &'a Reference,
    pub location: Option<&'a Reference>,
    pub diagnoses: &'a [Reference],
    pub reason_codes: Vec<CodeableConcept>,
    pub discharge_disposition: Option<&'a str>,
}

pub fn create_encounter(input: EncounterInput<'_>) -> Option<BundleEntry> {
    let identifier = input.identifier?;
    let start = input.start?;

    let hospitalization = input.discharge_disposition.map(|code| EncounterHospitalization {
        discharge_disposition: CodeableConcept::from_coding(Coding::new(
            systems::DISCHARGE_DISPOSITION,
            code,
        )),
    });

    Some(BundleEntry::new(Encounter {
        identifier: vec![identifier],
        status: "finished".to_string(),
        class: Coding::new(systems::ACT_CODE, input.class),
        subject: input.subject.clone(),
        period: Some(Period {
            start: Some(start.to_string()),
            end: None,
        }),
        reason_code: input.reason_codes,
        diagnosis: input
            .diagnoses
            .iter()
            .cloned()
            .map(|condition| EncounterDiagnosis { condition })
            .collect(),
        location: input
            .location
            .cloned()
            .map(|location| EncounterLocation { location })
            .into_iter()
            .collect(),
        hospitalization,
    }))
}

pub fn create_specimen(
    barcode: Option<&str>,
    specimen_type: Option<CodeableConcept>,
    collected: Option<&str>,
    received: Option<&str>,
) -> Option<BundleEntry> {
    let barcode = barcode.map(str::trim).filter(|b| !b.is_empty())?;

    Some(BundleEntry::new(Specimen {
        identifier: vec![Identifier::new(systems::SAMPLE, barcode.to_lowercase())],
        type_: specimen_type,
        subject: None,
        received_time: received.map(str::to_string),
        collection: collected.map(|date| SpecimenCollection {
            collected_date_time: date.to_string(),
        }),
    }))
}

/// Site of an encounter, identified by the study's site code.
pub fn create_location(site: Option<&str>, kind: &str, part_of: Option<&Reference>) -> Option<BundleEntry> {
    let site = site.map(str::trim).filter(|s| !s.is_empty())?;

    Some(BundleEntry::new(Location {
        identifier: vec![Identifier::new(systems::SITE, site)],
        mode: Some("instance".to_string()),
        type_: vec![CodeableConcept::from_coding(Coding::new(
            systems::LOCATION_TYPE,
            kind,
        ))],
        part_of: part_of.cloned(),
    }))
}

pub fn create_condition(
    code: Option<CodeableConcept>,
    subject: &Reference,
    encounter: Option<&Reference>,
    onset: Option<&str>,
) -> Option<BundleEntry> {
    Some(BundleEntry::new(Condition {
        subject: subject.clone(),
        code: code?,
        encounter: encounter.cloned(),
        onset_date_time: onset.map(str::to_string),
    }))
}

/// Observation tying a specimen to the encounter it was collected at.
pub fn create_specimen_observation(
    specimen: &Reference,
    subject: &Reference,
    encounter: &Reference,
) -> BundleEntry {
    BundleEntry::new(Observation {
        identifier: Vec::new(),
        status: "final".to_string(),
        code: CodeableConcept::from_coding(
            Coding::new(systems::LOINC, "89873-7").with_display("Specimen collection"),
        ),
        subject: Some(subject.clone()),
        encounter: Some(encounter.clone()),
        specimen: Some(specimen.clone()),
        value_boolean: None,
        value_codeable_concept: None,
    })
}

/// Lab result for a single target; `present == None` is an inconclusive result.
pub fn create_result_observation(
    target: &str,
    present: Option<bool>,
    subject: Option<&Reference>,
    specimen: &Reference,
) -> BundleEntry {
    let interpretation = match present {
        Some(true) => "POS",
        Some(false) => "NEG",
        None => "IND",
    };

    BundleEntry::new(Observation {
        identifier: Vec::new(),
        status: "final".to_string(),
        code: CodeableConcept::from_coding(Coding::new(systems::TARGET, target)),
        subject: subject.cloned(),
        encounter: None,
        specimen: Some(specimen.clone()),
        value_boolean: present,
        value_codeable_concept: Some(CodeableConcept::from_coding(Coding::new(
            systems::INTERPRETATION,
            interpretation,
        ))),
    })
}

pub fn create_diagnostic_report(
    code: CodeableConcept,
    subject: Option<&Reference>,
    specimen: &Reference,
    results: Vec<Reference>,
) -> Option<BundleEntry> {
    if results.is_empty() {
        return None;
    }

    Some(BundleEntry::new(DiagnosticReport {
        status: "final".to_string(),
        code,
        subject: subject.cloned(),
        specimen: vec![specimen.clone()],
        result: results,
    }))
}

/// A questionnaire item; items without answers are dropped.
pub fn questionnaire_item(link_id: &str, answers: Vec<Answer>) -> Option<QuestionnaireResponseItem> {
    if answers.is_empty() {
        return None;
    }
    Some(QuestionnaireResponseItem {
        link_id: link_id.to_string(),
        answer: answers,
    })
}

pub fn create_questionnaire_response(
    items: Vec<QuestionnaireResponseItem>,
    subject: &Reference,
    encounter: &Reference,
) -> Option<BundleEntry> {
    if items.is_empty() {
        return None;
    }

    Some(BundleEntry::new(QuestionnaireResponse {
        status: "completed".to_string(),
        subject: subject.clone(),
        encounter: Some(encounter.clone()),
        item: items,
    }))
}

/// Immunization record from a normalized vaccine status (`yes`/`no`/`unknown`).
///
/// `unknown` produces nothing.
pub fn create_immunization(
    vaccine_status: Option<&str>,
    vaccine_code: &str,
    patient: &Reference,
    encounter: &Reference,
    occurred: Option<&str>,
) -> Option<BundleEntry> {
    let status = match vaccine_status? {
        "yes" => "completed",
        "no" => "not-done",
        _ => return None,
    };

    let (occurrence_date_time, occurrence_string) = match occurred {
        Some(date) => (Some(date.to_string()), None),
        None => (None, Some("unknown".to_string())),
    };

    Some(BundleEntry::new(Immunization {
        status: status.to_string(),
        vaccine_code: CodeableConcept::from_coding(Coding::new(systems::CVX, vaccine_code)),
        patient: patient.clone(),
        encounter: Some(encounter.clone()),
        occurrence_date_time,
        occurrence_string,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleBuilder;
    use chrono::Utc;

    fn patient() -> BundleEntry {
        create_patient(
            Some(Identifier::new(systems::INDIVIDUAL, "abc")),
            Some("male"),
            None,
        )
        .unwrap()
    }

    #[test]
    fn primary_builders_need_their_keys() {
        assert!(create_patient(None, Some("male"), None).is_none());
        assert!(create_specimen(Some("  "), None, None, None).is_none());

        let subject = patient().reference();
        let missing_start = EncounterInput {
            identifier: Some(Identifier::new(systems::ENCOUNTER, "e1")),
            class: "AMB",
            start: None,
            subject: &subject,
            location: None,
            diagnoses: &[],
            reason_codes: vec![],
            discharge_disposition: None,
        };
        assert!(create_encounter(missing_start).is_none());
    }

    #[test]
    fn specimen_barcode_is_lowercased() {
        let entry = create_specimen(Some("AbC123"), None, Some("2020-01-01"), None).unwrap();
        match entry.resource {
            Resource::Specimen(s) => {
                assert_eq!(s.identifier[0].value, "abc123");
                assert_eq!(s.identifier[0].system, systems::SAMPLE);
            }
            other => panic!("unexpected resource {other:?}"),
        }
    }

    #[test]
    fn encounter_links_location_and_diagnoses() {
        let patient = patient();
        let subject = patient.reference();
        let site = create_location(Some("RetrospectiveUW"), "HOSP", None).unwrap();
        let cond = create_condition(Some(CodeableConcept::text("J10")), &subject, None, None).unwrap();
        let diagnoses = [cond.reference()];
        let site_ref = site.reference();

        let encounter = create_encounter(EncounterInput {
            identifier: Some(Identifier::new(systems::ENCOUNTER, "e1")),
            class: "EMER",
            start: Some("2020-01-01"),
            subject: &subject,
            location: Some(&site_ref),
            diagnoses: &diagnoses,
            reason_codes: vec![],
            discharge_disposition: Some("home"),
        })
        .unwrap();

        let mut builder = BundleBuilder::new();
        builder.push(patient).push(site).push(cond).push(encounter);
        let bundle = builder.build(Utc::now()).unwrap();
        let json = bundle.to_json().unwrap();
        let enc = &json["entry"][3]["resource"];
        assert_eq!(enc["class"]["code"], "EMER");
        assert_eq!(
            enc["hospitalization"]["dischargeDisposition"]["coding"][0]["code"],
            "home"
        );
        assert_eq!(enc["location"][0]["location"]["type"], "Location");
    }

    #[test]
    fn immunization_from_vaccine_status() {
        let patient = patient().reference();
        let encounter = Reference::literal("Encounter", "urn:uuid:e");
        assert!(create_immunization(Some("unknown"), "88", &patient, &encounter, None).is_none());
        assert!(create_immunization(None, "88", &patient, &encounter, None).is_none());

        let entry = create_immunization(Some("no"), "88", &patient, &encounter, None).unwrap();
        match entry.resource {
            Resource::Immunization(i) => {
                assert_eq!(i.status, "not-done");
                assert_eq!(i.occurrence_string.as_deref(), Some("unknown"));
            }
            other => panic!("unexpected resource {other:?}"),
        }
    }

    #[test]
    fn empty_questionnaire_is_omitted() {
        let subject = patient().reference();
        let encounter = Reference::literal("Encounter", "urn:uuid:e");
        assert!(questionnaire_item("race", vec![]).is_none());
        assert!(create_questionnaire_response(vec![], &subject, &encounter).is_none());
    }
}
