//! # Tablemerge CLI (`tmerge`)
//!
//! ## Usage
//!
//! ```bash
//! tmerge --config ./config/tmerge.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tmerge ingest <path>` | Classify a CSV, merge it with matching tables |
//! | `tmerge scan` | Classify every CSV in the data directory |
//! | `tmerge matches` | Print the signature store as JSON |
//! | `tmerge extract image <path>` | Convert an image of a table to CSV |
//! | `tmerge extract pdf <path>` | Extract tables from a PDF into CSV files |
//! | `tmerge serve` | Start the HTTP endpoint |
//!
//! Logs go to stderr; set `RUST_LOG` to change the level (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tablemerge::{config, extract, ingest, server};

/// Tablemerge CLI — classify CSV tables by a (column, value) signature and
/// merge the ones that describe the same attribute.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/tmerge.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "tmerge",
    about = "Tablemerge — incremental CSV table matching and merging",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "./config/tmerge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify one CSV file and merge it with every matching table.
    Ingest {
        /// Path to the CSV file. Its file name becomes the table identifier.
        path: PathBuf,
    },

    /// Classify every CSV in the data directory and record the signatures.
    Scan,

    /// Print the signature store as JSON.
    ///
    /// Works without a config file; the default storage layout is used.
    Matches,

    /// Convert images or PDFs into CSV tables.
    Extract {
        #[command(subcommand)]
        source: ExtractSource,
    },

    /// Start the HTTP endpoint on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum ExtractSource {
    /// Send an image of a table to the model and save the CSV reply.
    Image {
        path: PathBuf,

        /// Output file name inside the output directory
        /// (default: `img_output_<random>.csv`).
        #[arg(long)]
        output_file: Option<String>,
    },

    /// Detect tables in a PDF's text and write `table_<n>.csv` files.
    Pdf { path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // `matches` is read-only and works before a config file exists
    let cfg = match cli.command {
        Commands::Matches if !cli.config.exists() => config::Config::minimal(),
        _ => config::load_config(&cli.config)?,
    };

    match cli.command {
        Commands::Ingest { path } => {
            ingest::run_ingest(&cfg, &path).await?;
        }
        Commands::Scan => {
            ingest::run_scan(&cfg).await?;
        }
        Commands::Matches => {
            ingest::run_matches(&cfg)?;
        }
        Commands::Extract { source } => match source {
            ExtractSource::Image { path, output_file } => {
                extract::run_extract_image(&cfg, &path, output_file).await?;
            }
            ExtractSource::Pdf { path } => {
                extract::run_extract_pdf(&cfg, &path)?;
            }
        },
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
