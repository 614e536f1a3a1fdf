//! Collection bundles
//!
//! A bundle is assembled entry by entry through [`BundleBuilder`] and checked
//! once in [`BundleBuilder::build`]: every `urn:uuid:` reference inside the
//! bundle must name an entry of the same bundle. References by logical
//! identifier are left for the warehouse loader to resolve.

use crate::common::Reference;
use crate::error::{FhirError, Result};
use crate::resources::Resource;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use uuid::Uuid;

/// `Bundle.type`; intake only produces collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BundleType {
    #[default]
    Collection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub resource_type: String,
    pub id: String,
    #[serde(rename = "type")]
    pub bundle_type: BundleType,
    pub timestamp: String,
    pub entry: Vec<BundleEntry>,
}

impl Bundle {
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.entry.iter().map(|e| &e.resource)
    }

    /// Entries whose resource has the given `resourceType`.
    pub fn entries_of<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = &'a BundleEntry> {
        self.entry
            .iter()
            .filter(move |e| e.resource.resource_type() == resource_type)
    }

    pub fn to_json(&self) -> Result<JsonValue> {
        serde_json::to_value(self).map_err(FhirError::Serialization)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    pub full_url: String,
    pub resource: Resource,
}

impl BundleEntry {
    /// Wrap a resource under a fresh `urn:uuid:` full URL.
    pub fn new(resource: impl Into<Resource>) -> Self {
        Self {
            full_url: format!("urn:uuid:{}", Uuid::new_v4()),
            resource: resource.into(),
        }
    }

    /// Literal reference to this entry, for use by other entries of the same bundle.
    pub fn reference(&self) -> Reference {
        Reference::literal(self.resource.resource_type(), self.full_url.clone())
    }
}

#[derive(Debug, Default)]
pub struct BundleBuilder {
    entries: Vec<BundleEntry>,
}

impl BundleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: BundleEntry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    /// Push an optional secondary entry; `None` is simply omitted.
    pub fn push_optional(&mut self, entry: Option<BundleEntry>) -> &mut Self {
        if let Some(entry) = entry {
            self.entries.push(entry);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn build(self, timestamp: DateTime<Utc>) -> Result<Bundle> {
        if self.entries.is_empty() {
            return Err(FhirError::EmptyBundle);
        }

        let bundle = Bundle {
            resource_type: "Bundle".to_string(),
            id: Uuid::new_v4().to_string(),
            bundle_type: BundleType::Collection,
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            entry: self.entries,
        };

        validate_references(&bundle)?;
        Ok(bundle)
    }
}

/// Check that every internal reference of `bundle` resolves to one of its entries.
pub fn validate_references(bundle: &Bundle) -> Result<()> {
    let mut full_urls = HashSet::with_capacity(bundle.entry.len());
    for entry in &bundle.entry {
        if !full_urls.insert(entry.full_url.as_str()) {
            return Err(FhirError::DuplicateFullUrl(entry.full_url.clone()));
        }
    }

    for entry in &bundle.entry {
        let value = serde_json::to_value(&entry.resource).map_err(FhirError::Serialization)?;
        let mut refs = Vec::new();
        collect_references(&value, &mut refs)?;

        for target in refs {
            if !full_urls.contains(target.as_str()) {
                return Err(FhirError::UnresolvedReference {
                    from: entry.full_url.clone(),
                    target,
                });
            }
        }
    }

    Ok(())
}

/// Walk the JSON tree and collect `urn:` references.
///
/// A reference object carrying neither `reference` nor `identifier` is a
/// construction bug and is reported as such.
fn collect_references(value: &JsonValue, out: &mut Vec<String>) -> Result<()> {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                collect_references(item, out)?;
            }
        }
        JsonValue::Object(obj) => {
            let is_reference_shape = obj.contains_key("reference")
                || (obj.contains_key("type") && obj.contains_key("identifier"));
            if is_reference_shape {
                match obj.get("reference").and_then(|v| v.as_str()) {
                    Some(r) if r.starts_with("urn:") => out.push(r.to_string()),
                    Some(r) if r.trim().is_empty() => return Err(FhirError::EmptyReference),
                    Some(_) => {}
                    None if obj.get("identifier").is_none() => {
                        return Err(FhirError::EmptyReference)
                    }
                    None => {}
                }
            }
            for child in obj.values() {
                collect_references(child, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}
