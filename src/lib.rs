//! # Tablemerge
//!
//! An incremental table-matching and merge engine.
//!
//! Every incoming CSV table is classified by a language model into a
//! `(column, value)` signature describing its most important attribute.
//! Signatures are kept in a durable JSON snapshot. When a new table's
//! signature column matches (case-insensitively) that of tables already
//! seen, the tables are merged with full-row deduplication and the merged
//! result is written to the output directory and registered in turn.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌───────────┐   ┌──────────┐
//! │ CSV / image  │──▶│ Classifier │──▶│  Matcher  │──▶│  Merge   │
//! │ / PDF input  │   │  (Gemini)  │   │ (column)  │   │ (dedup)  │
//! └──────────────┘   └────────────┘   └─────┬─────┘   └────┬─────┘
//!                                           ▼              ▼
//!                                    ┌──────────────────────────┐
//!                                    │ Signature store (JSON)   │
//!                                    └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! tmerge scan                         # classify everything in data_dir
//! tmerge ingest ./incoming/sales.csv  # classify, match and merge one table
//! tmerge matches                      # print the signature store
//! tmerge serve                        # start the HTTP endpoint
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`table`] | CSV reading/writing and storage layout |
//! | [`store`] | Durable signature store |
//! | [`gemini`] | Gemini `generateContent` client |
//! | [`response`] | Lenient parsing of model replies |
//! | [`classifier`] | Signature classification |
//! | [`matcher`] | Candidate selection |
//! | [`merge`] | Merge with last-wins deduplication |
//! | [`ingest`] | Ingestion orchestration |
//! | [`extract`] | Image and PDF table extraction |
//! | [`server`] | HTTP endpoint |

pub mod classifier;
pub mod config;
pub mod extract;
pub mod gemini;
pub mod ingest;
pub mod matcher;
pub mod merge;
pub mod models;
pub mod response;
pub mod server;
pub mod store;
pub mod table;
