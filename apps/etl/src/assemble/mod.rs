//! Bundle assemblers
//!
//! One assembler per source family, driven by a per-project configuration
//! table. Assemblers are pure: the routine resolves barcodes against the
//! warehouse first and stores whatever bundle comes back.

pub mod clinical;
pub mod redcap;

use crate::routines::SkipReason;
use crate::vocab::age_ceiling;
use intake_fhir::builders::{create_condition, questionnaire_item};
use intake_fhir::{systems, Answer, Bundle, BundleEntry, CodeableConcept, Coding, QuestionnaireResponseItem, Reference};

#[derive(Debug, Clone, PartialEq)]
pub enum Assembled {
    Bundle(Box<Bundle>),
    Skipped(SkipReason),
}

/// Normalized demographic answers shared by every questionnaire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Demographics {
    pub age: Option<f64>,
    pub races: Vec<&'static str>,
    pub hispanic_latino: Option<bool>,
    pub insurance: Vec<&'static str>,
}

impl Demographics {
    pub fn questionnaire_items(&self) -> Vec<QuestionnaireResponseItem> {
        let strings = |terms: &[&str]| -> Vec<Answer> {
            terms.iter().map(|t| Answer::String(t.to_string())).collect()
        };

        [
            questionnaire_item(
                "age",
                self.age
                    .map(|age| Answer::Integer(age_ceiling(age).floor() as i64))
                    .into_iter()
                    .collect(),
            ),
            questionnaire_item("race", strings(&self.races)),
            questionnaire_item(
                "ethnicity",
                self.hispanic_latino.map(Answer::Boolean).into_iter().collect(),
            ),
            questionnaire_item("insurance", strings(&self.insurance)),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Age in years from a number or numeric string; negative ages are absent.
pub fn parse_age(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|age| *age >= 0.0 && age.is_finite())
}

pub(crate) fn symptom_conditions(
    symptoms: &[&str],
    subject: &Reference,
    onset: Option<&str>,
) -> Vec<BundleEntry> {
    symptoms
        .iter()
        .filter_map(|symptom| {
            create_condition(
                Some(CodeableConcept::from_coding(Coding::new(systems::SYMPTOM, *symptom))),
                subject,
                None,
                onset,
            )
        })
        .collect()
}

pub(crate) fn icd10_conditions(
    codes: &[String],
    subject: &Reference,
    onset: Option<&str>,
) -> Vec<BundleEntry> {
    codes
        .iter()
        .filter_map(|code| {
            create_condition(
                Some(CodeableConcept::from_coding(Coding::new(systems::ICD10, code.as_str()))),
                subject,
                None,
                onset,
            )
        })
        .collect()
}
