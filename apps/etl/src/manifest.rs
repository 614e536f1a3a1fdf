//! Parsed clinical manifest rows and their NDJSON pools

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_file: String,
    pub parsed_at: DateTime<Utc>,
}

/// One parsed row. `barcode` is set once the LIMS assigns one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRow {
    #[serde(rename = "_provenance")]
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl ManifestRow {
    pub fn new(source_file: &str, parsed_at: DateTime<Utc>) -> Self {
        Self {
            provenance: Provenance {
                source_file: source_file.to_string(),
                parsed_at,
            },
            barcode: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// String form of a column; `barcode` reads the assigned barcode.
    /// Null and blank values are absent.
    pub fn value_of(&self, column: &str) -> Option<String> {
        let value = if column == "barcode" {
            self.barcode.clone()
        } else {
            match self.fields.get(column)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            }
        };
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Row content with provenance left out, for exact-duplicate detection.
    pub fn content_key(&self) -> Result<String> {
        Ok(serde_json::to_string(&(&self.barcode, &self.fields))?)
    }
}

pub fn read_ndjson(path: &Path) -> Result<Vec<ManifestRow>> {
    let reader = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        rows.push(serde_json::from_str(&line)?);
    }
    Ok(rows)
}

/// Like [`read_ndjson`], but a pool that was never written is empty.
pub fn read_pool(path: &Path) -> Result<Vec<ManifestRow>> {
    if path.exists() {
        read_ndjson(path)
    } else {
        Ok(Vec::new())
    }
}

/// Write rows to a sibling temporary file, then rename over `path`.
pub fn write_ndjson(path: &Path, rows: &[ManifestRow]) -> Result<()> {
    let partial = path.with_extension("ndjson.partial");
    {
        let mut writer = BufWriter::new(File::create(&partial)?);
        for row in rows {
            serde_json::to_writer(&mut writer, row)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    std::fs::rename(&partial, path)?;
    Ok(())
}
