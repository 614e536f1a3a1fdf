//! FHIR resource graph for study intake
//!
//! A small, strongly typed subset of FHIR R4 (Patient, Encounter, Specimen,
//! Observation, Condition, Location, QuestionnaireResponse, Immunization,
//! DiagnosticReport) plus collection bundles with internal reference checks.

pub mod builders;
pub mod bundle;
pub mod common;
pub mod error;
pub mod resources;
pub mod systems;

pub use bundle::{Bundle, BundleBuilder, BundleEntry, BundleType};
pub use common::*;
pub use error::{FhirError, Result};
pub use resources::*;
