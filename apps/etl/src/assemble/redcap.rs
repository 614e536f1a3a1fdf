//! REDCap data-entry-trigger bundles
//!
//! Every REDCap project goes through [`assemble`]; what differs between
//! projects is captured by a [`RedcapProject`] table: which instruments
//! must be complete, which fields hold the barcode and demographics, and
//! which checkbox groups carry coded answers.

use super::{symptom_conditions, Assembled, Demographics};
use crate::identity::{hash_parts, PersonalIdentity};
use crate::routines::redcap_det::DetDocument;
use crate::routines::SkipReason;
use crate::vocab::{self, is_prefer_not_to_say, merge_coded};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use intake_fhir::builders::*;
use intake_fhir::{systems, Answer, BundleBuilder, BundleEntry, CodeableConcept, Coding, Identifier};

/// CVX code for an unspecified influenza vaccine.
const INFLUENZA_VACCINE: &str = "88";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerKind {
    Text,
    YesNo,
    Integer,
    Date,
}

/// A free-standing questionnaire item copied from one REDCap field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Question {
    pub link_id: &'static str,
    pub field: &'static str,
    pub kind: AnswerKind,
}

const fn question(link_id: &'static str, field: &'static str, kind: AnswerKind) -> Question {
    Question { link_id, field, kind }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedcapProject {
    pub name: &'static str,
    pub revision: i32,
    pub redcap_url: &'static str,
    pub project_id: &'static str,
    /// Instruments whose `<instrument>_complete` must be `2`.
    pub required_instruments: &'static [&'static str],
    pub identifier_sets: &'static [&'static str],
    pub barcode_field: &'static str,
    pub encounter_date_field: &'static str,
    pub collection_date_field: Option<&'static str>,
    pub site: &'static str,
    /// `v3-RoleCode` location type of the site.
    pub location_kind: &'static str,
    /// `v3-ActCode` encounter class.
    pub encounter_class: &'static str,
    pub specimen_type: &'static str,
    /// Joined with a space to form the name used in the identity hash.
    pub name_fields: &'static [&'static str],
    pub birth_date_field: &'static str,
    pub sex_field: &'static str,
    pub postal_code_field: Option<&'static str>,
    pub age_field: Option<&'static str>,
    pub race_checkbox: Option<&'static str>,
    pub ethnicity_field: Option<&'static str>,
    pub insurance_checkbox: Option<&'static str>,
    pub symptom_checkbox: Option<&'static str>,
    pub symptom_onset_field: Option<&'static str>,
    pub vaccine_field: Option<&'static str>,
    pub vaccine_date_field: Option<&'static str>,
    pub questions: &'static [Question],
}

impl RedcapProject {
    pub fn etl_name(&self) -> String {
        format!("redcap-det-{}", self.name)
    }
}

pub const SWAB_N_SEND: RedcapProject = RedcapProject {
    name: "swab-n-send",
    revision: 4,
    redcap_url: "https://redcap.iths.org/",
    project_id: "16691",
    required_instruments: &["enrollment_questionnaire", "back_end_mail_scans"],
    identifier_sets: &["samples", "collections-*"],
    barcode_field: "return_utm_barcode",
    encounter_date_field: "enrollment_date",
    collection_date_field: Some("samp_date"),
    site: "swabNSend",
    location_kind: "PTRES",
    encounter_class: "HH",
    specimen_type: "nasal swab",
    name_fields: &["participant_first_name", "participant_last_name"],
    birth_date_field: "birthday",
    sex_field: "sex",
    postal_code_field: Some("home_zipcode"),
    age_field: Some("age"),
    race_checkbox: Some("race"),
    ethnicity_field: Some("hispanic"),
    insurance_checkbox: Some("insurance"),
    symptom_checkbox: Some("symptoms"),
    symptom_onset_field: None,
    vaccine_field: Some("vaccine"),
    vaccine_date_field: None,
    questions: &[
        question("household_smoke", "smoke", AnswerKind::YesNo),
        question("travel_outside_us", "travel_countries", AnswerKind::YesNo),
        question("household_size", "house_members", AnswerKind::Integer),
    ],
};

pub const SCAN: RedcapProject = RedcapProject {
    name: "scan",
    revision: 7,
    redcap_url: "https://redcap.iths.org/",
    project_id: "20759",
    required_instruments: &["consent_form", "enrollment_questionnaire", "back_end_mail_scans"],
    identifier_sets: &["samples", "collections-scan*"],
    barcode_field: "return_utm_barcode",
    encounter_date_field: "enrollment_date_time",
    collection_date_field: Some("collection_date"),
    site: "SCAN",
    location_kind: "PTRES",
    encounter_class: "HH",
    specimen_type: "nasal swab",
    name_fields: &["participant_first_name", "participant_last_name"],
    birth_date_field: "birthday",
    sex_field: "sex_new",
    postal_code_field: Some("home_zipcode_2"),
    age_field: Some("age"),
    race_checkbox: Some("race"),
    ethnicity_field: Some("hispanic"),
    insurance_checkbox: Some("insurance"),
    symptom_checkbox: Some("symptoms"),
    symptom_onset_field: Some("symptom_onset"),
    vaccine_field: Some("vaccine"),
    vaccine_date_field: Some("vaccine_date"),
    questions: &[
        question("priority_code", "priority_code", AnswerKind::Text),
        question("doctor_visit", "doctor_3e8fae", AnswerKind::YesNo),
        question("education", "education", AnswerKind::Text),
    ],
};

pub const CHILDCARE: RedcapProject = RedcapProject {
    name: "childcare",
    revision: 2,
    redcap_url: "https://redcap.iths.org/",
    project_id: "21512",
    required_instruments: &["enrollment_questionnaire", "symptom_check"],
    identifier_sets: &["samples", "collections-childcare"],
    barcode_field: "barcode_swab",
    encounter_date_field: "date_symptom_check",
    collection_date_field: Some("date_symptom_check"),
    site: "childcare",
    location_kind: "SCHOOL",
    encounter_class: "FLD",
    specimen_type: "nasal swab",
    name_fields: &["child_first", "child_last"],
    birth_date_field: "child_dob",
    sex_field: "child_sex",
    postal_code_field: Some("home_zip"),
    age_field: None,
    race_checkbox: Some("child_race"),
    ethnicity_field: Some("child_hispanic"),
    insurance_checkbox: None,
    symptom_checkbox: Some("sx_today"),
    symptom_onset_field: None,
    vaccine_field: Some("flu_vx"),
    vaccine_date_field: None,
    questions: &[question("attends_school", "attend_where", AnswerKind::Text)],
};

pub const KIOSK: RedcapProject = RedcapProject {
    name: "kiosk",
    revision: 3,
    redcap_url: "https://redcap.iths.org/",
    project_id: "17542",
    required_instruments: &["screening", "enrollment", "nasal_swab_collection"],
    identifier_sets: &["samples", "collections-kiosks*"],
    barcode_field: "nasal_swab_barcode",
    encounter_date_field: "enrollment_date",
    collection_date_field: Some("nasal_swab_timestamp"),
    site: "kiosk",
    location_kind: "COMM",
    encounter_class: "FLD",
    specimen_type: "nasal swab",
    name_fields: &["first_name", "last_name"],
    birth_date_field: "dob",
    sex_field: "sex",
    postal_code_field: Some("home_zipcode"),
    age_field: Some("age"),
    race_checkbox: Some("race"),
    ethnicity_field: Some("hispanic"),
    insurance_checkbox: Some("insurance"),
    symptom_checkbox: Some("symptoms"),
    symptom_onset_field: None,
    vaccine_field: Some("vaccine"),
    vaccine_date_field: None,
    questions: &[question("shelter_member", "shelter_member", AnswerKind::YesNo)],
};

pub const PROJECTS: &[RedcapProject] = &[SWAB_N_SEND, SCAN, CHILDCARE, KIOSK];

pub fn by_name(name: &str) -> Option<&'static RedcapProject> {
    PROJECTS.iter().find(|project| project.name == name)
}

/// A DET record whose barcode has already been resolved.
#[derive(Debug, Clone, Copy)]
pub struct DetInput<'a> {
    pub record_id: i64,
    pub det: &'a DetDocument,
    pub barcode: &'a str,
    pub hash_secret: &'a str,
}

pub fn assemble(
    project: &RedcapProject,
    input: DetInput<'_>,
    timestamp: DateTime<Utc>,
) -> Result<Assembled> {
    let det = input.det;
    let invalid = |message: String| Error::InvalidDocument {
        source_kind: "REDCap DET",
        record_id: input.record_id,
        message,
    };

    let gender = det
        .field(project.sex_field)
        .map(|raw| vocab::sex(&raw))
        .transpose()?
        .flatten();

    let name = project
        .name_fields
        .iter()
        .filter_map(|field| det.field(field))
        .collect::<Vec<_>>()
        .join(" ");
    let birth_date = det.field(project.birth_date_field);
    let postal_code = project.postal_code_field.and_then(|f| det.field(f));
    let identity = PersonalIdentity {
        name: Some(name.as_str()),
        gender,
        birth_date: birth_date.as_deref(),
        postal_code: postal_code.as_deref(),
    };
    let Some(patient) = create_patient(
        identity
            .hash(input.hash_secret)
            .map(|hash| Identifier::new(systems::INDIVIDUAL, hash)),
        gender,
        None,
    ) else {
        return Ok(Assembled::Skipped(SkipReason::MissingDemographics));
    };
    let subject = patient.reference();

    let location = create_location(Some(project.site), project.location_kind, None);
    let location_ref = location.as_ref().map(BundleEntry::reference);

    let symptom_codes = project
        .symptom_checkbox
        .map(|prefix| det.checked(prefix))
        .unwrap_or_default();
    let symptoms = merge_coded(symptom_codes.iter().map(String::as_str), vocab::symptom)?;
    let onset = project.symptom_onset_field.and_then(|f| det.field(f));
    let conditions = symptom_conditions(&symptoms, &subject, onset.as_deref());
    let diagnoses: Vec<_> = conditions.iter().map(|c| c.reference()).collect();

    let project_id = det.project_id.as_deref().unwrap_or(project.project_id);
    let record = det.record.as_deref().unwrap_or_default();
    let encounter_date = det.field(project.encounter_date_field);
    let Some(encounter) = create_encounter(EncounterInput {
        identifier: Some(Identifier::new(
            systems::ENCOUNTER,
            hash_parts(&[det.redcap_url.as_str(), project_id, record], input.hash_secret),
        )),
        class: project.encounter_class,
        start: encounter_date.as_deref(),
        subject: &subject,
        location: location_ref.as_ref(),
        diagnoses: &diagnoses,
        reason_codes: Vec::new(),
        discharge_disposition: None,
    }) else {
        return Ok(Assembled::Skipped(SkipReason::MissingEncounterData("date")));
    };
    let encounter_ref = encounter.reference();

    let collected = project.collection_date_field.and_then(|f| det.field(f));
    let Some(specimen) = create_specimen(
        Some(input.barcode),
        Some(CodeableConcept::text(project.specimen_type)),
        collected.as_deref(),
        None,
    ) else {
        return Ok(Assembled::Skipped(SkipReason::MissingEncounterData("barcode")));
    };
    let specimen_observation =
        create_specimen_observation(&specimen.reference(), &subject, &encounter_ref);

    let coded = |prefix: Option<&str>| -> Vec<String> {
        prefix.map(|p| det.checked(p)).unwrap_or_default()
    };
    let demographics = Demographics {
        age: project
            .age_field
            .and_then(|f| det.field(f))
            .and_then(|raw| super::parse_age(&raw)),
        races: merge_coded(coded(project.race_checkbox).iter().map(String::as_str), vocab::race)?,
        hispanic_latino: project
            .ethnicity_field
            .and_then(|f| det.field(f))
            .map(|raw| vocab::hispanic_latino(&raw))
            .transpose()?
            .flatten(),
        insurance: merge_coded(
            coded(project.insurance_checkbox).iter().map(String::as_str),
            vocab::insurance,
        )?,
    };

    let mut items = demographics.questionnaire_items();
    items.extend(questionnaire_item(
        "symptoms",
        symptoms
            .iter()
            .map(|term| Answer::Coding(Coding::new(systems::SYMPTOM, *term)))
            .collect(),
    ));
    for question in project.questions {
        let Some(raw) = det.field(question.field) else {
            continue;
        };
        let answer = match question.kind {
            AnswerKind::Text if is_prefer_not_to_say(&raw) => None,
            AnswerKind::Text => Some(Answer::String(raw)),
            AnswerKind::YesNo => vocab::yes_no(&raw)?.map(Answer::Boolean),
            AnswerKind::Integer => Some(Answer::Integer(raw.parse().map_err(|_| {
                invalid(format!("{} is not an integer: {raw:?}", question.field))
            })?)),
            AnswerKind::Date => Some(Answer::Date(raw)),
        };
        items.extend(questionnaire_item(question.link_id, answer.into_iter().collect()));
    }
    let questionnaire = create_questionnaire_response(items, &subject, &encounter_ref);

    let vaccine_status = project
        .vaccine_field
        .and_then(|f| det.field(f))
        .map(|raw| vocab::vaccine_status(&raw))
        .transpose()?
        .flatten();
    let vaccine_date = project.vaccine_date_field.and_then(|f| det.field(f));
    let immunization = create_immunization(
        vaccine_status,
        INFLUENZA_VACCINE,
        &subject,
        &encounter_ref,
        vaccine_date.as_deref(),
    );

    let mut bundle = BundleBuilder::new();
    bundle.push(patient).push_optional(location);
    for condition in conditions {
        bundle.push(condition);
    }
    bundle
        .push(encounter)
        .push(specimen)
        .push(specimen_observation)
        .push_optional(questionnaire)
        .push_optional(immunization);

    Ok(Assembled::Bundle(Box::new(bundle.build(timestamp)?)))
}
