//! CSV table storage.
//!
//! Reads and writes [`Table`]s as CSV and resolves table identifiers against
//! the on-disk layout:
//!
//! ```text
//! <data_dir>/            canonical source tables (uploads, scans)
//! <output_dir>/          derived tables (merged_*.csv)
//! <output_dir>/matches.json  signature snapshot
//! ```
//!
//! Every write goes through [`write_atomic`]: the bytes land in a temporary
//! file in the destination directory and are renamed over the final path, so
//! a crash mid-write never leaves a truncated file behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::StorageConfig;
use crate::models::Table;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("table not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed CSV in '{identifier}': {reason}")]
    Malformed { identifier: String, reason: String },
}

/// Directory layout shared by the store, the merge engine and the orchestrator.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub snapshot_file: String,
}

impl StorageLayout {
    pub fn new(data_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            output_dir: output_dir.into(),
            snapshot_file: crate::config::DEFAULT_SNAPSHOT_FILE.to_string(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            output_dir: config.output_dir.clone(),
            snapshot_file: config.snapshot_file.clone(),
        }
    }

    /// Creates both directories if they don't exist.
    pub fn ensure_dirs(&self) -> Result<(), TableError> {
        for dir in [&self.data_dir, &self.output_dir] {
            std::fs::create_dir_all(dir).map_err(|source| TableError::Write {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn canonical_path(&self, identifier: &str) -> PathBuf {
        self.data_dir.join(identifier)
    }

    pub fn derived_path(&self, identifier: &str) -> PathBuf {
        self.output_dir.join(identifier)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.output_dir.join(&self.snapshot_file)
    }

    /// Finds the stored CSV for an identifier: canonical tables first, then
    /// derived ones (merged tables are registered in the store too).
    pub fn locate(&self, identifier: &str) -> Option<PathBuf> {
        [self.canonical_path(identifier), self.derived_path(identifier)]
            .into_iter()
            .find(|p| p.is_file())
    }
}

/// File name component of a path, used as the table identifier.
pub fn identifier_for(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().to_string())
}

/// Reads a CSV file into a [`Table`] whose identifier is the file name.
pub fn read_table(path: &Path) -> Result<Table, TableError> {
    if !path.is_file() {
        return Err(TableError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read(path).map_err(|source| TableError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let identifier = identifier_for(path).unwrap_or_else(|| path.display().to_string());
    parse_table(&identifier, &String::from_utf8_lossy(&content))
}

/// Parses CSV text (header row first). Short rows are padded with empty
/// cells; rows wider than the header are rejected.
pub fn parse_table(identifier: &str, content: &str) -> Result<Table, TableError> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let malformed = |reason: String| TableError::Malformed {
        identifier: identifier.to_string(),
        reason,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| malformed(e.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Ok(Table::new(identifier, Vec::new(), Vec::new()));
    }

    let width = headers.len();
    let mut rows = Vec::new();
    for (line, result) in reader.records().enumerate() {
        let record = result.map_err(|e| malformed(e.to_string()))?;
        if record.len() > width {
            return Err(malformed(format!(
                "row {} has {} fields, header has {}",
                line + 1,
                record.len(),
                width
            )));
        }
        let mut row: Vec<String> = record.iter().map(|f| f.to_string()).collect();
        row.resize(width, String::new());
        rows.push(row);
    }

    Ok(Table::new(identifier, headers, rows))
}

/// Renders a table as CSV text with a header row.
pub fn to_csv_string(table: &Table) -> Result<String, TableError> {
    let bytes = to_csv_bytes(table)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn to_csv_bytes(table: &Table) -> Result<Vec<u8>, TableError> {
    let malformed = |e: csv::Error| TableError::Malformed {
        identifier: table.identifier.clone(),
        reason: e.to_string(),
    };
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    writer.write_record(&table.headers).map_err(malformed)?;
    for row in &table.rows {
        writer.write_record(row).map_err(malformed)?;
    }
    writer.into_inner().map_err(|e| TableError::Malformed {
        identifier: table.identifier.clone(),
        reason: e.to_string(),
    })
}

/// Writes a table as CSV to `path`, atomically.
pub fn write_table(path: &Path, table: &Table) -> Result<(), TableError> {
    let bytes = to_csv_bytes(table)?;
    write_atomic(path, &bytes)
}

/// Writes `bytes` to a temp file next to `path`, then renames it into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TableError> {
    let write_err = |source: std::io::Error| TableError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}
