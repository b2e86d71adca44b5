//! Table merging.
//!
//! [`merge_tables`] is the pure part: existing rows first, new rows second,
//! then full-row deduplication keeping the **last** copy of each duplicate.
//! A row present in both tables therefore survives at the new table's
//! position. Cells are compared exactly; no field-level reconciliation.
//!
//! [`MergeEngine::merge`] wraps it with storage: it reads the existing table,
//! writes `merged_<existing>` to the derived directory, re-classifies the
//! result and registers it in the store. The store is only touched after the
//! write succeeded and the merged table was classified.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use thiserror::Error;
use tracing::info;

use crate::classifier::{classify_table, ClassificationError, SignatureClassifier};
use crate::models::{Signature, Table};
use crate::store::{SignatureStore, StoreIoError};
use crate::table::{self, StorageLayout, TableError};

pub const MERGED_PREFIX: &str = "merged_";

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("table '{0}' not found in data or output directory")]
    NotFound(String),
    #[error("could not read table '{identifier}': {source}")]
    Read {
        identifier: String,
        #[source]
        source: TableError,
    },
    #[error("could not write merged table '{identifier}': {source}")]
    Write {
        identifier: String,
        #[source]
        source: TableError,
    },
    #[error("merged table '{identifier}' could not be classified: {source}")]
    Classify {
        identifier: String,
        #[source]
        source: ClassificationError,
    },
    #[error("merged table '{identifier}' could not be registered: {source}")]
    Store {
        identifier: String,
        #[source]
        source: StoreIoError,
    },
}

/// A written merged table together with its registered signature.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub table: Table,
    pub path: PathBuf,
    pub signature: Signature,
}

/// Identifier of the merged artifact for an existing table.
///
/// Deterministic, so repeated merges against the same table overwrite one file.
pub fn merged_identifier(existing_identifier: &str) -> String {
    format!("{}{}", MERGED_PREFIX, existing_identifier)
}

/// Concatenates `existing` then `new` and drops duplicate rows, keeping the last.
///
/// The output header is `existing`'s columns followed by any of `new`'s
/// columns not already present; cells missing from either side are empty.
/// Repeated column names are matched by occurrence.
pub fn merge_tables(identifier: impl Into<String>, existing: &Table, new: &Table) -> Table {
    let mut headers = existing.headers.clone();
    // The k-th `h` in `new` pairs with the k-th `h` in `headers`, so repeated
    // (or blank) column names keep their own slots.
    let mut occurrences: HashMap<&str, usize> = HashMap::new();
    let mut new_positions = Vec::with_capacity(new.headers.len());
    for h in &new.headers {
        let seen = occurrences.entry(h.as_str()).or_insert(0);
        let nth = *seen;
        *seen += 1;
        let pos = headers
            .iter()
            .enumerate()
            .filter(|(_, e)| *e == h)
            .nth(nth)
            .map(|(i, _)| i);
        new_positions.push(match pos {
            Some(pos) => pos,
            None => {
                headers.push(h.clone());
                headers.len() - 1
            }
        });
    }
    let width = headers.len();

    let existing_rows = existing.rows.iter().map(|row| {
        let mut out = row.clone();
        out.resize(width, String::new());
        out
    });
    let new_rows = new.rows.iter().map(|row| {
        let mut out = vec![String::new(); width];
        for (cell, &pos) in row.iter().zip(&new_positions) {
            out[pos] = cell.clone();
        }
        out
    });
    let combined: Vec<Vec<String>> = existing_rows.chain(new_rows).collect();

    Table::new(identifier, headers, dedup_keep_last(combined))
}

fn dedup_keep_last(rows: Vec<Vec<String>>) -> Vec<Vec<String>> {
    let mut seen = HashSet::new();
    let mut kept: Vec<Vec<String>> = rows
        .into_iter()
        .rev()
        .filter(|row| seen.insert(row.clone()))
        .collect();
    kept.reverse();
    kept
}

/// Storage-aware merge step used by the ingestion engine.
pub struct MergeEngine<'a> {
    layout: &'a StorageLayout,
    classifier: &'a dyn SignatureClassifier,
    sample_rows: usize,
}

impl<'a> MergeEngine<'a> {
    pub fn new(
        layout: &'a StorageLayout,
        classifier: &'a dyn SignatureClassifier,
        sample_rows: usize,
    ) -> Self {
        Self {
            layout,
            classifier,
            sample_rows,
        }
    }

    /// Merges `new_table` into the stored table `existing_identifier`.
    pub async fn merge(
        &self,
        store: &mut SignatureStore,
        new_table: &Table,
        existing_identifier: &str,
    ) -> Result<MergeResult, MergeError> {
        let existing_path = self
            .layout
            .locate(existing_identifier)
            .ok_or_else(|| MergeError::NotFound(existing_identifier.to_string()))?;
        let existing = table::read_table(&existing_path).map_err(|source| MergeError::Read {
            identifier: existing_identifier.to_string(),
            source,
        })?;

        let merged_id = merged_identifier(existing_identifier);
        let merged = merge_tables(merged_id.clone(), &existing, new_table);
        let path = self.layout.derived_path(&merged_id);
        table::write_table(&path, &merged).map_err(|source| MergeError::Write {
            identifier: merged_id.clone(),
            source,
        })?;
        info!(
            "New file created: {} ({} rows from {} + {})",
            path.display(),
            merged.len(),
            existing.len(),
            new_table.len()
        );

        let signature = classify_table(self.classifier, &merged, self.sample_rows)
            .await
            .map_err(|source| MergeError::Classify {
                identifier: merged_id.clone(),
                source,
            })?;
        store
            .put(&merged_id, signature.clone())
            .map_err(|source| MergeError::Store {
                identifier: merged_id.clone(),
                source,
            })?;

        Ok(MergeResult {
            table: merged,
            path,
            signature,
        })
    }
}
