//! FHIR R4 resources emitted by the intake pipeline
//!
//! Each struct is a strict subset of the public R4 JSON shape. Serialization
//! goes through [`Resource`], which carries the `resourceType` tag.

use crate::common::*;
use serde::{Deserialize, Serialize};

/// Any resource that may appear as a bundle entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resourceType")]
pub enum Resource {
    Patient(Patient),
    Encounter(Encounter),
    Specimen(Specimen),
    Observation(Observation),
    Condition(Condition),
    Location(Location),
    QuestionnaireResponse(QuestionnaireResponse),
    Immunization(Immunization),
    DiagnosticReport(DiagnosticReport),
}

impl Resource {
    pub fn resource_type(&self) -> &'static str {
        match self {
            Resource::Patient(_) => "Patient",
            Resource::Encounter(_) => "Encounter",
            Resource::Specimen(_) => "Specimen",
            Resource::Observation(_) => "Observation",
            Resource::Condition(_) => "Condition",
            Resource::Location(_) => "Location",
            Resource::QuestionnaireResponse(_) => "QuestionnaireResponse",
            Resource::Immunization(_) => "Immunization",
            Resource::DiagnosticReport(_) => "DiagnosticReport",
        }
    }
}

macro_rules! impl_into_resource {
    ($($ty:ident),* $(,)?) => {
        $(
            impl From<$ty> for Resource {
                fn from(value: $ty) -> Self {
                    Resource::$ty(value)
                }
            }
        )*
    };
}

impl_into_resource!(
    Patient,
    Encounter,
    Specimen,
    Observation,
    Condition,
    Location,
    QuestionnaireResponse,
    Immunization,
    DiagnosticReport,
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifier: Vec<Identifier>,

    /// male | female | other | unknown
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub address: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Encounter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifier: Vec<Identifier>,

    /// planned | arrived | in-progress | finished | ...
    pub status: String,

    /// v3-ActCode, e.g. AMB, EMER, IMP, HH
    pub class: Coding,

    pub subject: Reference,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<Period>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reason_code: Vec<CodeableConcept>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnosis: Vec<EncounterDiagnosis>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub location: Vec<EncounterLocation>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hospitalization: Option<EncounterHospitalization>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncounterDiagnosis {
    pub condition: Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncounterLocation {
    pub location: Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncounterHospitalization {
    pub discharge_disposition: CodeableConcept,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Specimen {
    pub identifier: Vec<Identifier>,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<CodeableConcept>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Reference>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<SpecimenCollection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecimenCollection {
    pub collected_date_time: String,
}

/// Observation; used both to tie a specimen to its encounter and for lab results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifier: Vec<Identifier>,

    pub status: String,

    pub code: CodeableConcept,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Reference>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter: Option<Reference>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub specimen: Option<Reference>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_boolean: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_codeable_concept: Option<CodeableConcept>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub subject: Reference,

    pub code: CodeableConcept,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter: Option<Reference>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub onset_date_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub identifier: Vec<Identifier>,

    /// instance | kind
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Vec::is_empty")]
    pub type_: Vec<CodeableConcept>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_of: Option<Reference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionnaireResponse {
    pub status: String,

    pub subject: Reference,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter: Option<Reference>,

    pub item: Vec<QuestionnaireResponseItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionnaireResponseItem {
    pub link_id: String,

    pub answer: Vec<Answer>,
}

/// `QuestionnaireResponse.item.answer.value[x]`
///
/// Externally tagged, so each variant serializes as `{"valueString": ...}` etc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Answer {
    #[serde(rename = "valueString")]
    String(String),
    #[serde(rename = "valueBoolean")]
    Boolean(bool),
    #[serde(rename = "valueInteger")]
    Integer(i64),
    #[serde(rename = "valueDecimal")]
    Decimal(f64),
    #[serde(rename = "valueDate")]
    Date(String),
    #[serde(rename = "valueCoding")]
    Coding(Coding),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Immunization {
    /// completed | entered-in-error | not-done
    pub status: String,

    pub vaccine_code: CodeableConcept,

    pub patient: Reference,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter: Option<Reference>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurrence_date_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurrence_string: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    pub status: String,

    pub code: CodeableConcept,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Reference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specimen: Vec<Reference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub result: Vec<Reference>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resource_carries_resource_type_tag() {
        let resource = Resource::from(Patient {
            identifier: vec![Identifier::new("https://seattleflu.org/individual", "h1")],
            gender: Some("female".into()),
            address: vec![],
        });

        let value = serde_json::to_value(&resource).unwrap();
        assert_eq!(value["resourceType"], "Patient");
        assert_eq!(value["gender"], "female");
        assert!(value.get("address").is_none());

        let back: Resource = serde_json::from_value(value).unwrap();
        assert_eq!(back, resource);
    }

    #[test]
    fn answer_uses_fhir_value_names() {
        let item = QuestionnaireResponseItem {
            link_id: "race".into(),
            answer: vec![Answer::String("white".into()), Answer::Boolean(false)],
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(
            value,
            json!({
                "linkId": "race",
                "answer": [{"valueString": "white"}, {"valueBoolean": false}]
            })
        );
    }
}
