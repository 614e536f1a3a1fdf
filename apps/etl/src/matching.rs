//! Matching parsed clinical rows to LIMS-assigned barcodes
//!
//! The manifest keeps two persistent pools, matched and unmatched. A pass
//! takes newly parsed rows, purges stale unmatched rows from the same source
//! files, looks every unmatched row up field by field, and moves the rows
//! that got a barcode into the matched pool. Lookup failures abort the pass
//! before anything is returned, so callers never persist partial state.

use crate::lims::IdentifierLookup;
use crate::manifest::ManifestRow;
use crate::Result;
use std::collections::{BTreeSet, HashSet};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchManifest {
    pub matched: Vec<ManifestRow>,
    pub unmatched: Vec<ManifestRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchReport {
    /// Unmatched rows dropped because their source file was parsed again.
    pub purged: usize,
    pub newly_matched: usize,
    /// Older matched rows replaced by a newly matched row with the same barcode.
    pub superseded: usize,
    pub unmatched: usize,
}

/// Run one matching pass. `fields` are tried in priority order; the first
/// field that yields a barcode for a row wins.
pub async fn match_records(
    manifest: MatchManifest,
    parsed: Vec<ManifestRow>,
    fields: &[String],
    lookup: &dyn IdentifierLookup,
) -> Result<(MatchManifest, MatchReport)> {
    let mut report = MatchReport::default();

    let reparsed: HashSet<&str> = parsed
        .iter()
        .map(|row| row.provenance.source_file.as_str())
        .collect();

    let mut candidates: Vec<ManifestRow> = Vec::new();
    for row in manifest.unmatched {
        if reparsed.contains(row.provenance.source_file.as_str()) {
            report.purged += 1;
        } else {
            candidates.push(row);
        }
    }
    candidates.extend(parsed.iter().cloned());

    for field in fields {
        let values: BTreeSet<String> = candidates
            .iter()
            .filter(|row| row.barcode.is_none())
            .filter_map(|row| row.value_of(field))
            .collect();
        if values.is_empty() {
            continue;
        }

        let values: Vec<String> = values.into_iter().collect();
        let barcodes = lookup.lookup(field, &values).await?;

        for row in candidates.iter_mut().filter(|row| row.barcode.is_none()) {
            if let Some(barcode) = row.value_of(field).and_then(|v| barcodes.get(&v)) {
                row.barcode = Some(barcode.clone());
            }
        }
    }

    let (newly_matched, unmatched): (Vec<_>, Vec<_>) =
        candidates.into_iter().partition(|row| row.barcode.is_some());

    let refreshed: HashSet<&str> = newly_matched
        .iter()
        .filter_map(|row| row.barcode.as_deref())
        .collect();

    let mut matched = Vec::with_capacity(manifest.matched.len() + newly_matched.len());
    for row in manifest.matched {
        if row
            .barcode
            .as_deref()
            .is_some_and(|barcode| refreshed.contains(barcode))
        {
            report.superseded += 1;
        } else {
            matched.push(row);
        }
    }

    report.newly_matched = newly_matched.len();
    report.unmatched = unmatched.len();
    matched.extend(newly_matched);

    tracing::info!(
        purged = report.purged,
        newly_matched = report.newly_matched,
        superseded = report.superseded,
        unmatched = report.unmatched,
        "Matching pass complete"
    );

    Ok((MatchManifest { matched, unmatched }, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeLims {
        known: HashMap<(String, String), String>,
        calls: Mutex<Vec<(String, Vec<String>)>>,
        fail: bool,
    }

    impl FakeLims {
        fn new(known: &[(&str, &str, &str)]) -> Self {
            Self {
                known: known
                    .iter()
                    .map(|(f, v, b)| ((f.to_string(), v.to_string()), b.to_string()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl IdentifierLookup for FakeLims {
        async fn lookup(&self, field: &str, values: &[String]) -> Result<HashMap<String, String>> {
            self.calls
                .lock()
                .unwrap()
                .push((field.to_string(), values.to_vec()));
            if self.fail {
                return Err(Error::Lims("503 Service Unavailable after 4 attempts".into()));
            }
            Ok(values
                .iter()
                .filter_map(|v| {
                    self.known
                        .get(&(field.to_string(), v.clone()))
                        .map(|b| (v.clone(), b.clone()))
                })
                .collect())
        }
    }

    fn row(file: &str, field: &str, value: &str) -> ManifestRow {
        ManifestRow::new(file, Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap())
            .with_field(field, value)
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn one_request_per_field_and_first_match_wins() {
        let lims = FakeLims::new(&[
            ("collection_id", "X1", "BC1"),
            ("mrn", "M2", "BC2"),
            ("mrn", "M1", "BC-SHOULD-NOT-WIN"),
        ]);
        let parsed = vec![
            row("a.xlsx", "collection_id", "X1").with_field("mrn", "M1"),
            row("a.xlsx", "collection_id", "X2").with_field("mrn", "M2"),
            row("a.xlsx", "collection_id", "X3"),
        ];

        let (manifest, report) = match_records(
            MatchManifest::default(),
            parsed,
            &fields(&["collection_id", "mrn"]),
            &lims,
        )
        .await
        .unwrap();

        let calls = lims.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, vec!["X1", "X2", "X3"]);
        // Only rows still unmatched after the first field are looked up again.
        assert_eq!(calls[1].1, vec!["M2"]);

        let barcodes: Vec<_> = manifest.matched.iter().map(|r| r.barcode.clone().unwrap()).collect();
        assert_eq!(barcodes, vec!["BC1", "BC2"]);
        assert_eq!(report.unmatched, 1);
        assert_eq!(manifest.matched.len() + manifest.unmatched.len(), 3);
    }

    #[tokio::test]
    async fn refreshed_barcode_replaces_older_matched_copy() {
        let lims = FakeLims::new(&[("collection_id", "X1", "BC99")]);
        let mut old = row("may.xlsx", "collection_id", "X1").with_field("result", "old");
        old.barcode = Some("BC99".into());
        let mut untouched = row("may.xlsx", "collection_id", "X7");
        untouched.barcode = Some("BC7".into());

        let manifest = MatchManifest {
            matched: vec![old, untouched.clone()],
            unmatched: vec![],
        };
        let parsed = vec![row("june.xlsx", "collection_id", "X1").with_field("result", "new")];

        let (manifest, report) =
            match_records(manifest, parsed, &fields(&["collection_id"]), &lims)
                .await
                .unwrap();

        assert_eq!(report.superseded, 1);
        assert_eq!(manifest.matched.len(), 2);
        assert_eq!(manifest.matched[0], untouched);
        assert_eq!(manifest.matched[1].fields["result"], "new");
    }

    #[tokio::test]
    async fn reparsed_file_purges_its_stale_unmatched_rows() {
        let lims = FakeLims::new(&[]);
        let manifest = MatchManifest {
            matched: vec![],
            unmatched: vec![
                row("a.xlsx", "collection_id", "X1"),
                row("b.xlsx", "collection_id", "X2"),
            ],
        };
        let parsed = vec![row("a.xlsx", "collection_id", "X1")];

        let (manifest, report) =
            match_records(manifest, parsed, &fields(&["collection_id"]), &lims)
                .await
                .unwrap();

        assert_eq!(report.purged, 1);
        assert_eq!(manifest.unmatched.len(), 2);
    }

    #[tokio::test]
    async fn lookup_failure_aborts_the_pass() {
        let mut lims = FakeLims::new(&[]);
        lims.fail = true;
        let result = match_records(
            MatchManifest::default(),
            vec![row("a.xlsx", "collection_id", "X1")],
            &fields(&["collection_id"]),
            &lims,
        )
        .await;
        assert!(matches!(result, Err(Error::Lims(_))));
    }
}
