//! Ingestion orchestration.
//!
//! Coordinates the full flow for one incoming table:
//!
//! ```text
//! RECEIVED → CLASSIFYING ─┬─ failed ──────────────▶ Err(Classification)
//!                         └─ MATCHING ─┬─ none ───▶ STORE_AS_NEW
//!                                      └─ some ───▶ MERGING (each candidate)
//! ```
//!
//! Classification failures and failures reading the primary input abort the
//! call with the store untouched. A failed merge against one candidate is
//! logged and skipped so the remaining candidates still get merged; if every
//! merge fails the ingestion still succeeds with no artifacts.

use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::classifier::{self, classify_table, ClassificationError, SignatureClassifier};
use crate::config::Config;
use crate::matcher;
use crate::merge::MergeEngine;
use crate::models::{IngestOutcome, MergedArtifact, ScanEntry, Table};
use crate::store::{SignatureStore, StoreIoError};
use crate::table::{self, StorageLayout, TableError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Classification(#[from] ClassificationError),
    #[error(transparent)]
    StoreIo(#[from] StoreIoError),
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("invalid input '{identifier}': {reason}")]
    Input { identifier: String, reason: String },
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Owns the signature store and drives classification, matching and merging.
pub struct Engine {
    layout: StorageLayout,
    store: SignatureStore,
    classifier: Box<dyn SignatureClassifier>,
    sample_rows: usize,
}

impl Engine {
    pub fn new(
        layout: StorageLayout,
        store: SignatureStore,
        classifier: Box<dyn SignatureClassifier>,
        sample_rows: usize,
    ) -> Self {
        Self {
            layout,
            store,
            classifier,
            sample_rows,
        }
    }

    /// Creates the directories, loads the snapshot and builds the configured classifier.
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        let classifier = classifier::create_classifier(&config.classifier)?;
        Self::open_with(config, classifier)
    }

    /// Like [`Engine::open`] with an explicit classifier.
    pub fn open_with(
        config: &Config,
        classifier: Box<dyn SignatureClassifier>,
    ) -> anyhow::Result<Self> {
        let layout = StorageLayout::from_config(&config.storage);
        layout.ensure_dirs()?;
        let store = SignatureStore::open(layout.snapshot_path())?;
        Ok(Self::new(
            layout,
            store,
            classifier,
            config.classifier.sample_rows,
        ))
    }

    pub fn store(&self) -> &SignatureStore {
        &self.store
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Ingests an in-memory table. On no match it is written to the data directory.
    pub async fn ingest(&mut self, table: &Table) -> Result<IngestOutcome, IngestError> {
        self.run(table, None).await
    }

    /// Ingests a CSV file; its file name becomes the identifier.
    ///
    /// On no match the file is copied byte-for-byte into the data directory.
    pub async fn ingest_path(&mut self, path: &Path) -> Result<IngestOutcome, IngestError> {
        let path = normalize(path);
        if !path.is_file() {
            return Err(IngestError::NotFound(path));
        }
        let table = table::read_table(&path)?;
        if table.headers.is_empty() || table.is_empty() {
            return Err(IngestError::Input {
                identifier: table.identifier,
                reason: "File is empty".to_string(),
            });
        }
        self.run(&table, Some(&path)).await
    }

    async fn run(
        &mut self,
        table: &Table,
        source: Option<&Path>,
    ) -> Result<IngestOutcome, IngestError> {
        let identifier = table.identifier.as_str();
        if !is_plain_file_name(identifier) {
            return Err(IngestError::Input {
                identifier: identifier.to_string(),
                reason: "identifier must be a plain file name".to_string(),
            });
        }
        info!("Ingesting {} ({} rows)", identifier, table.len());

        let signature = classify_table(self.classifier.as_ref(), table, self.sample_rows).await?;

        if self.store.remove(identifier)?.is_some() {
            info!("{} already exists! Overwriting.", identifier);
        }
        self.store.put(identifier, signature.clone())?;

        let candidates = matcher::find_candidates(&self.store, identifier, &signature);
        if candidates.is_empty() {
            self.store_as_new(table, source)?;
            info!("New entry added: {}", identifier);
            return Ok(IngestOutcome {
                identifier: identifier.to_string(),
                signature,
                stored_as_new: true,
                merged_artifacts: Vec::new(),
            });
        }

        info!("Found {} matches for {}", candidates.len(), identifier);
        let engine = MergeEngine::new(&self.layout, self.classifier.as_ref(), self.sample_rows);
        let mut merged_artifacts = Vec::new();
        for candidate in &candidates {
            info!("Merge with {}", candidate);
            match engine.merge(&mut self.store, table, candidate).await {
                Ok(result) => merged_artifacts.push(MergedArtifact {
                    identifier: result.table.identifier,
                    path: result.path,
                }),
                Err(e) => error!("Merge failed: {}", e),
            }
        }
        if merged_artifacts.is_empty() {
            warn!(
                "All {} merges for {} failed; no artifacts produced",
                candidates.len(),
                identifier
            );
        }

        Ok(IngestOutcome {
            identifier: identifier.to_string(),
            signature,
            stored_as_new: false,
            merged_artifacts,
        })
    }

    fn store_as_new(&self, table: &Table, source: Option<&Path>) -> Result<(), TableError> {
        let dest = self.layout.canonical_path(&table.identifier);
        match source {
            Some(src) if same_file(src, &dest) => Ok(()),
            Some(src) => {
                let bytes = std::fs::read(src).map_err(|e| TableError::Read {
                    path: src.to_path_buf(),
                    source: e,
                })?;
                table::write_atomic(&dest, &bytes)
            }
            None => table::write_table(&dest, table),
        }
    }

    /// Classifies every table in the data directory matching `include_globs`.
    ///
    /// Empty or unreadable files and failed classifications are logged and
    /// skipped. Results are in file-name order.
    pub async fn scan(&mut self, include_globs: &[String]) -> anyhow::Result<Vec<ScanEntry>> {
        let include = build_globset(include_globs)?;
        let mut files: Vec<PathBuf> = WalkDir::new(&self.layout.data_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| include.is_match(e.file_name()))
            .map(|e| e.into_path())
            .collect();
        files.sort();

        if files.is_empty() {
            warn!("No CSV file found in {}", self.layout.data_dir.display());
            return Ok(Vec::new());
        }
        info!("Found {} CSV files", files.len());

        let mut results = Vec::new();
        for path in files {
            let table = match table::read_table(&path) {
                Ok(t) if !t.headers.is_empty() && !t.is_empty() => t,
                Ok(t) => {
                    warn!("{} - Empty/Invalid file", t.identifier);
                    continue;
                }
                Err(e) => {
                    error!("{} could not be analyzed: {}", path.display(), e);
                    continue;
                }
            };
            let signature =
                match classify_table(self.classifier.as_ref(), &table, self.sample_rows).await {
                    Ok(sig) => sig,
                    Err(_) => continue,
                };
            self.store.put(&table.identifier, signature.clone())?;
            results.push(ScanEntry {
                identifier: table.identifier,
                column: signature.column,
                value: signature.value,
            });
        }
        Ok(results)
    }
}

/// A name that resolves to a file directly inside a directory.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

// ============ CLI commands ============

pub async fn run_ingest(config: &Config, path: &Path) -> anyhow::Result<()> {
    let mut engine = Engine::open(config)?;
    let outcome = engine.ingest_path(path).await?;

    println!("ingest {}", outcome.identifier);
    println!("  signature: {}", outcome.signature);
    if outcome.stored_as_new {
        println!("  no matches; stored as new");
    } else {
        println!("  merged artifacts: {}", outcome.merged_artifacts.len());
        for artifact in &outcome.merged_artifacts {
            println!("    {}", artifact.path.display());
        }
    }
    println!("ok");
    Ok(())
}

pub async fn run_scan(config: &Config) -> anyhow::Result<()> {
    let mut engine = Engine::open(config)?;
    let results = engine.scan(&config.storage.include_globs).await?;

    println!("scan {}", engine.layout().data_dir.display());
    for entry in &results {
        println!("  {}: {} = {}", entry.identifier, entry.column, entry.value);
    }
    println!("  analyzed: {}", results.len());
    println!("ok");
    Ok(())
}

pub fn run_matches(config: &Config) -> anyhow::Result<()> {
    let layout = StorageLayout::from_config(&config.storage);
    let store = SignatureStore::open(layout.snapshot_path())?;
    println!("{}", store.to_json()?);
    Ok(())
}
