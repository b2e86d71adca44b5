//! Table extraction from images and PDFs.
//!
//! Both extractors produce CSV text that the ingestion engine can consume:
//! - **[`GeminiImageExtractor`]** — sends the image to a Gemini model and
//!   strips markdown fences from the reply.
//! - **[`TextLayoutPdfExtractor`]** — pulls page text with `pdf-extract` and
//!   treats runs of consistently-columned lines as tables.
//!
//! Extraction is best-effort. A PDF with no detectable tables is not an
//! error; it simply yields an empty list.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use thiserror::Error;
use tracing::info;

use crate::config::Config;
use crate::gemini::{GeminiClient, GeminiError, Part};
use crate::models::Table;
use crate::table::{self, TableError};

pub const IMAGE_PROMPT: &str = "Convert this image table to CSV format. Only output the raw CSV data without any markdown formatting or additional text.";

/// Cells are separated by a tab or by two or more spaces.
static CELL_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\t+| {2,}").expect("valid cell separator regex"));

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extractor returned no data")]
    Empty,
    #[error("image extraction failed: {0}")]
    Service(#[from] GeminiError),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("image extraction unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Image bytes → CSV text.
#[async_trait]
pub trait ImageExtractor: Send + Sync {
    async fn extract(&self, image: &[u8]) -> Result<String, ExtractError>;
}

/// PDF bytes → one CSV text per detected table.
pub trait PdfExtractor: Send + Sync {
    fn extract(&self, pdf: &[u8]) -> Result<Vec<String>, ExtractError>;
}

// ============ Image ============

pub struct GeminiImageExtractor {
    client: GeminiClient,
}

impl GeminiImageExtractor {
    pub fn new(config: &Config) -> Result<Self, GeminiError> {
        let client = GeminiClient::from_env(
            &config.classifier.endpoint,
            &config.extract.image_model,
            &config.classifier.api_key_env,
            config.classifier.timeout_secs,
        )?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageExtractor for GeminiImageExtractor {
    async fn extract(&self, image: &[u8]) -> Result<String, ExtractError> {
        let parts = [
            Part::Text(IMAGE_PROMPT.to_string()),
            Part::InlineData {
                mime_type: sniff_image_mime(image).to_string(),
                data: image.to_vec(),
            },
        ];
        let raw = self.client.generate(&parts).await?;
        clean_csv_response(&raw)
    }
}

/// Stands in when no image model is configured; every call fails with the
/// reason given at construction.
pub struct UnavailableImageExtractor {
    reason: String,
}

impl UnavailableImageExtractor {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ImageExtractor for UnavailableImageExtractor {
    async fn extract(&self, _image: &[u8]) -> Result<String, ExtractError> {
        Err(ExtractError::Unavailable(self.reason.clone()))
    }
}

/// Removes ```` ```csv ```` / ```` ``` ```` fences and surrounding whitespace.
pub fn clean_csv_response(raw: &str) -> Result<String, ExtractError> {
    let cleaned = raw.replace("```csv", "").replace("```", "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err(ExtractError::Empty);
    }
    info!("Successfully processed response ({} chars)", cleaned.len());
    Ok(cleaned.to_string())
}

fn sniff_image_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(b"GIF8") {
        "image/gif"
    } else if bytes.len() > 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

// ============ PDF ============

pub struct TextLayoutPdfExtractor {
    min_rows: usize,
}

impl TextLayoutPdfExtractor {
    pub fn new(min_rows: usize) -> Self {
        Self {
            min_rows: min_rows.max(1),
        }
    }
}

impl PdfExtractor for TextLayoutPdfExtractor {
    fn extract(&self, pdf: &[u8]) -> Result<Vec<String>, ExtractError> {
        let text =
            pdf_extract::extract_text_from_mem(pdf).map_err(|e| ExtractError::Pdf(e.to_string()))?;
        detect_tables(&text, self.min_rows)
            .iter()
            .map(table::to_csv_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ExtractError::from)
    }
}

/// Finds tables in extracted page text.
///
/// A table is a header line followed by at least `min_rows` lines, all
/// splitting into the same number (≥ 2) of cells. Tables are named
/// `table_<i>.csv` in page order, matching the files [`pdf_to_csv`] writes.
pub fn detect_tables(text: &str, min_rows: usize) -> Vec<Table> {
    let mut tables = Vec::new();
    let mut run: Vec<Vec<String>> = Vec::new();

    let mut flush = |run: &mut Vec<Vec<String>>| {
        if run.len() >= min_rows.max(1) + 1 {
            let mut rows = std::mem::take(run);
            let headers = rows.remove(0);
            let identifier = format!("table_{}.csv", tables.len());
            tables.push(Table::new(identifier, headers, rows));
        }
        run.clear();
    };

    for line in text.lines() {
        let cells: Vec<String> = CELL_SPLIT
            .split(line.trim())
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let continues = cells.len() >= 2 && run.first().map_or(true, |h| h.len() == cells.len());
        if !continues {
            flush(&mut run);
        }
        if cells.len() >= 2 {
            run.push(cells);
        }
    }
    flush(&mut run);
    tables
}

// ============ Pipelines ============

/// Runs image extraction and writes the CSV to `output_path`.
pub async fn image_to_csv(
    extractor: &dyn ImageExtractor,
    image: &[u8],
    output_path: &Path,
) -> Result<PathBuf, ExtractError> {
    info!("Starting image to CSV conversion -> {}", output_path.display());
    let csv = extractor.extract(image).await?;
    table::write_atomic(output_path, csv.as_bytes())?;
    info!("Saved output to {}", output_path.display());
    Ok(output_path.to_path_buf())
}

/// Runs PDF extraction and writes `table_<i>.csv` files into `output_dir`.
pub fn pdf_to_csv(
    extractor: &dyn PdfExtractor,
    pdf: &[u8],
    output_dir: &Path,
) -> Result<Vec<PathBuf>, ExtractError> {
    let tables = extractor.extract(pdf)?;
    let mut paths = Vec::with_capacity(tables.len());
    for (i, csv) in tables.iter().enumerate() {
        let path = output_dir.join(format!("table_{}.csv", i));
        table::write_atomic(&path, csv.as_bytes())?;
        info!("CSV File Generated: {}", path.display());
        paths.push(path);
    }
    Ok(paths)
}

/// Eight random lowercase hex digits.
pub fn random_hex() -> String {
    let n: u32 = rand::rng().random();
    format!("{:08x}", n)
}

/// Default name for an image extraction result: `img_output_<8 hex>.csv`.
pub fn random_output_name() -> String {
    format!("img_output_{}.csv", random_hex())
}

// ============ CLI commands ============

pub async fn run_extract_image(
    config: &Config,
    path: &Path,
    output_file: Option<String>,
) -> anyhow::Result<()> {
    let image = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("Image file not found at {}: {}", path.display(), e))?;
    let extractor = GeminiImageExtractor::new(config)?;
    let name = output_file.unwrap_or_else(random_output_name);
    let out = image_to_csv(&extractor, &image, &config.storage.output_dir.join(name)).await?;
    println!("extract image {}", path.display());
    println!("  csv: {}", out.display());
    println!("ok");
    Ok(())
}

pub fn run_extract_pdf(config: &Config, path: &Path) -> anyhow::Result<()> {
    let pdf = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("PDF file not found at {}: {}", path.display(), e))?;
    let extractor = TextLayoutPdfExtractor::new(config.extract.pdf_min_rows);
    let paths = pdf_to_csv(&extractor, &pdf, &config.storage.output_dir)?;
    println!("extract pdf {}", path.display());
    println!("  tables found: {}", paths.len());
    for p in &paths {
        println!("    {}", p.display());
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_clean_strips_fences() {
        let raw = "```csv\nname,qty\nbolt,4\n```\n";
        assert_eq!(clean_csv_response(raw).unwrap(), "name,qty\nbolt,4");
    }

    #[test]
    fn test_clean_rejects_empty() {
        assert!(matches!(
            clean_csv_response("```csv\n```"),
            Err(ExtractError::Empty)
        ));
    }

    #[test]
    fn test_detect_tables_splits_on_wide_gaps() {
        let text = "Quarterly report\n\
                    Region    Units   Revenue\n\
                    North     10      1,000\n\
                    South\t12\t1,200\n\
                    \n\
                    Prepared by finance.\n";
        let tables = detect_tables(text, 2);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].headers, vec!["Region", "Units", "Revenue"]);
        assert_eq!(tables[0].rows[1], vec!["South", "12", "1,200"]);
    }

    #[test]
    fn test_detect_tables_separates_different_widths() {
        let text = "a  b\n1  2\n3  4\nx  y  z\n5  6  7\n8  9  10\n";
        let tables = detect_tables(text, 2);
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[1].headers, vec!["x", "y", "z"]);
        assert_eq!(tables[0].identifier, "table_0.csv");
        assert_eq!(tables[1].identifier, "table_1.csv");
    }

    #[test]
    fn test_detect_tables_respects_min_rows() {
        let text = "a  b\n1  2\n";
        assert_eq!(detect_tables(text, 1).len(), 1);
        assert!(detect_tables(text, 2).is_empty());
    }

    #[test]
    fn test_invalid_pdf_is_an_error() {
        let extractor = TextLayoutPdfExtractor::new(2);
        assert!(matches!(
            extractor.extract(b"not a valid pdf"),
            Err(ExtractError::Pdf(_))
        ));
    }

    struct FixedPdf(Vec<String>);

    impl PdfExtractor for FixedPdf {
        fn extract(&self, _pdf: &[u8]) -> Result<Vec<String>, ExtractError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_pdf_to_csv_writes_numbered_files() {
        let tmp = TempDir::new().unwrap();
        let extractor = FixedPdf(vec!["a,b\n1,2\n".into(), "c\n3\n".into()]);
        let paths = pdf_to_csv(&extractor, b"", tmp.path()).unwrap();
        assert_eq!(
            paths,
            vec![tmp.path().join("table_0.csv"), tmp.path().join("table_1.csv")]
        );
        assert_eq!(std::fs::read_to_string(&paths[1]).unwrap(), "c\n3\n");
    }

    #[test]
    fn test_pdf_without_tables_yields_nothing() {
        let tmp = TempDir::new().unwrap();
        let paths = pdf_to_csv(&FixedPdf(Vec::new()), b"", tmp.path()).unwrap();
        assert!(paths.is_empty());
    }

    #[test]
    fn test_sniff_image_mime() {
        assert_eq!(sniff_image_mime(&[0x89, b'P', b'N', b'G', 0]), "image/png");
        assert_eq!(sniff_image_mime(&[0xff, 0xd8, 0xff]), "image/jpeg");
    }

    #[test]
    fn test_random_output_name_shape() {
        let name = random_output_name();
        assert!(name.starts_with("img_output_") && name.ends_with(".csv"));
        assert_eq!(name.len(), "img_output_".len() + 8 + ".csv".len());
    }
}
