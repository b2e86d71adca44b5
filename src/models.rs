//! Core data models used throughout tablemerge.
//!
//! These types represent the tables, signatures, and ingestion outcomes that
//! flow through the classify → match → merge pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A table read from CSV: a header row plus string cells.
///
/// Tables are never mutated in place once ingested. A merge always produces
/// a brand-new `Table` with its own identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// Stable identifier, derived from the source file name (e.g. `sales.csv`).
    pub identifier: String,
    /// Column names, in file order.
    pub headers: Vec<String>,
    /// Data rows. Every row has exactly `headers.len()` cells.
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(identifier: impl Into<String>, headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            identifier: identifier.into(),
            headers,
            rows,
        }
    }

    /// Number of data rows (the header row is not counted).
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// A copy of this table holding at most the first `n` rows.
    pub fn head(&self, n: usize) -> Table {
        Table {
            identifier: self.identifier.clone(),
            headers: self.headers.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }
}

/// The dominant `(column, value)` pair of a table, as reported by the classifier.
///
/// Both parts are trimmed and the column is never empty; use [`Signature::new`]
/// to construct one from untrusted input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub column: String,
    pub value: String,
}

impl Signature {
    /// Builds a trimmed signature. Returns `None` if the column is blank.
    pub fn new(column: &str, value: &str) -> Option<Self> {
        let column = column.trim();
        if column.is_empty() {
            return None;
        }
        Some(Self {
            column: column.to_string(),
            value: value.trim().to_string(),
        })
    }

    /// Case-insensitive, whitespace-trimmed column comparison.
    pub fn same_column(&self, column: &str) -> bool {
        self.column.trim().to_lowercase() == column.trim().to_lowercase()
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} = {}", self.column, self.value)
    }
}

/// A merged table written to the derived-data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedArtifact {
    pub identifier: String,
    pub path: PathBuf,
}

/// What a single ingestion produced.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub identifier: String,
    pub signature: Signature,
    /// `true` when no prior table matched and the input was stored as-is.
    pub stored_as_new: bool,
    /// One entry per successful merge, in candidate order.
    pub merged_artifacts: Vec<MergedArtifact>,
}

/// Per-file result of a standalone data-directory scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanEntry {
    pub identifier: String,
    pub column: String,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_trims_and_rejects_blank_column() {
        let sig = Signature::new("  Region ", " North  ").unwrap();
        assert_eq!(sig.column, "Region");
        assert_eq!(sig.value, "North");
        assert!(Signature::new("   ", "x").is_none());
    }

    #[test]
    fn test_same_column_ignores_case_and_whitespace() {
        let sig = Signature::new("Region", "North").unwrap();
        assert!(sig.same_column(" REGION "));
        assert!(!sig.same_column("Regions"));
    }

    #[test]
    fn test_head_limits_rows() {
        let rows = (0..30).map(|i| vec![i.to_string()]).collect();
        let table = Table::new("t.csv", vec!["n".into()], rows);
        let head = table.head(20);
        assert_eq!(head.len(), 20);
        assert_eq!(head.rows[19], vec!["19".to_string()]);
        assert_eq!(table.head(100).len(), 30);
    }
}
