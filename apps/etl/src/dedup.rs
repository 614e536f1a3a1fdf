//! Duplicate removal over accumulated manifest rows
//!
//! Exact duplicates go first so that re-parsing an unchanged file never looks
//! like an identifier collision. Rows that still share an identifier value
//! afterwards are either all set aside for review or collapsed to the most
//! recently parsed one.

use crate::manifest::ManifestRow;
use crate::Result;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Keep none of the rows sharing an identifier.
    #[default]
    DropConflicts,
    /// Keep the row with the latest provenance timestamp.
    KeepLatest,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupReport {
    pub rows: Vec<ManifestRow>,
    /// Earlier copies of rows that appear again later.
    pub exact_duplicates: Vec<ManifestRow>,
    /// Rows removed for sharing an identifier with another row.
    pub conflicts: Vec<ManifestRow>,
    /// Source files that contributed a removed conflicting row.
    pub conflict_sources: BTreeSet<String>,
}

pub fn deduplicate(
    rows: Vec<ManifestRow>,
    id_columns: &[String],
    policy: DuplicatePolicy,
) -> Result<DedupReport> {
    let mut report = DedupReport::default();

    let mut last_copy: HashMap<String, usize> = HashMap::new();
    let keys = rows
        .iter()
        .map(ManifestRow::content_key)
        .collect::<Result<Vec<_>>>()?;
    for (index, key) in keys.iter().enumerate() {
        last_copy.insert(key.clone(), index);
    }

    let mut remaining = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        if last_copy.get(&keys[index]) == Some(&index) {
            remaining.push(row);
        } else {
            report.exact_duplicates.push(row);
        }
    }

    let groups = identifier_groups(&remaining, id_columns);
    let mut discard = vec![false; remaining.len()];
    for group in groups.into_iter().filter(|g| g.len() > 1) {
        match policy {
            DuplicatePolicy::DropConflicts => {
                for index in group {
                    discard[index] = true;
                }
            }
            DuplicatePolicy::KeepLatest => {
                // Later rows win ties; they were appended more recently.
                let keep = group
                    .iter()
                    .copied()
                    .max_by_key(|&i| (remaining[i].provenance.parsed_at, i));
                for index in group {
                    if Some(index) != keep {
                        discard[index] = true;
                    }
                }
            }
        }
    }

    for (row, discarded) in remaining.into_iter().zip(discard) {
        if discarded {
            report
                .conflict_sources
                .insert(row.provenance.source_file.clone());
            report.conflicts.push(row);
        } else {
            report.rows.push(row);
        }
    }

    if !report.conflicts.is_empty() {
        tracing::warn!(
            conflicts = report.conflicts.len(),
            sources = ?report.conflict_sources,
            policy = ?policy,
            "Removed rows sharing an identifier"
        );
    }
    tracing::info!(
        kept = report.rows.len(),
        exact_duplicates = report.exact_duplicates.len(),
        conflicts = report.conflicts.len(),
        "Deduplication complete"
    );

    Ok(report)
}

/// Connected groups of rows linked by sharing a value in any identifier column.
fn identifier_groups(rows: &[ManifestRow], id_columns: &[String]) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..rows.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for column in id_columns {
        let mut first_seen: HashMap<String, usize> = HashMap::new();
        for (index, row) in rows.iter().enumerate() {
            let Some(value) = row.value_of(column) else {
                continue;
            };
            match first_seen.get(&value) {
                Some(&other) => {
                    let (a, b) = (find(&mut parent, index), find(&mut parent, other));
                    if a != b {
                        parent[a] = b;
                    }
                }
                None => {
                    first_seen.insert(value, index);
                }
            }
        }
    }

    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for index in 0..rows.len() {
        let root = find(&mut parent, index);
        groups.entry(root).or_default().push(index);
    }
    groups.into_values().collect()
}
