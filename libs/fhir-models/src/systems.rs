//! Identifier and code system URIs

pub const INDIVIDUAL: &str = "https://seattleflu.org/individual";
pub const ENCOUNTER: &str = "https://seattleflu.org/encounter";
pub const SAMPLE: &str = "https://seattleflu.org/sample";
pub const SITE: &str = "https://seattleflu.org/site";
pub const TARGET: &str = "https://seattleflu.org/target";
pub const ICD10: &str = "http://hl7.org/fhir/sid/icd-10";
pub const LOINC: &str = "http://loinc.org";
pub const CVX: &str = "http://hl7.org/fhir/sid/cvx";
pub const ACT_CODE: &str = "http://terminology.hl7.org/CodeSystem/v3-ActCode";
pub const LOCATION_TYPE: &str = "http://terminology.hl7.org/CodeSystem/v3-RoleCode";
pub const DISCHARGE_DISPOSITION: &str =
    "http://terminology.hl7.org/CodeSystem/discharge-disposition";
pub const INTERPRETATION: &str =
    "http://terminology.hl7.org/CodeSystem/v3-ObservationInterpretation";
pub const SYMPTOM: &str = "https://seattleflu.org/symptom";
pub const SPECIMEN_TYPE: &str = "http://terminology.hl7.org/CodeSystem/v2-0487";
