use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_SNAPSHOT_FILE: &str = "matches.json";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            output_dir: default_output_dir(),
            snapshot_file: default_snapshot_file(),
            include_globs: default_include_globs(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}
fn default_snapshot_file() -> String {
    DEFAULT_SNAPSHOT_FILE.to_string()
}
fn default_include_globs() -> Vec<String> {
    vec!["*.csv".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            sample_rows: default_sample_rows(),
            timeout_secs: default_timeout_secs(),
            api_key_env: default_api_key_env(),
            endpoint: default_endpoint(),
        }
    }
}

impl ClassifierConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "gemini".to_string()
}
fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_sample_rows() -> usize {
    20
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}
fn default_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractConfig {
    #[serde(default = "default_model")]
    pub image_model: String,
    #[serde(default = "default_pdf_min_rows")]
    pub pdf_min_rows: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            image_model: default_model(),
            pdf_min_rows: default_pdf_min_rows(),
        }
    }
}

fn default_pdf_min_rows() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7071".to_string()
}

impl Config {
    /// All defaults; used by commands that can run without a config file.
    pub fn minimal() -> Self {
        Self {
            storage: StorageConfig::default(),
            classifier: ClassifierConfig::default(),
            extract: ExtractConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.storage.snapshot_file.trim().is_empty() {
        anyhow::bail!("storage.snapshot_file must not be empty");
    }

    if config.classifier.sample_rows == 0 {
        anyhow::bail!("classifier.sample_rows must be > 0");
    }

    if config.classifier.timeout_secs == 0 {
        anyhow::bail!("classifier.timeout_secs must be > 0");
    }

    match config.classifier.provider.as_str() {
        "disabled" | "gemini" => {}
        other => anyhow::bail!(
            "Unknown classifier provider: '{}'. Must be disabled or gemini.",
            other
        ),
    }

    if config.extract.pdf_min_rows == 0 {
        anyhow::bail!("extract.pdf_min_rows must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(body: &str) -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tmerge.toml");
        std::fs::write(&path, body).unwrap();
        (tmp, path)
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let (_tmp, path) = write_config("");
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.classifier.sample_rows, 20);
        assert_eq!(cfg.classifier.model, "gemini-2.0-flash");
        assert_eq!(cfg.storage.snapshot_file, "matches.json");
        assert_eq!(cfg.storage.include_globs, vec!["*.csv"]);
    }

    #[test]
    fn test_overrides_are_read() {
        let (_tmp, path) = write_config(
            r#"
[storage]
data_dir = "/srv/tables"

[classifier]
provider = "disabled"
sample_rows = 5
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.storage.data_dir, PathBuf::from("/srv/tables"));
        assert!(!cfg.classifier.is_enabled());
        assert_eq!(cfg.classifier.sample_rows, 5);
    }

    #[test]
    fn test_rejects_zero_sample_rows() {
        let (_tmp, path) = write_config("[classifier]\nsample_rows = 0\n");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("sample_rows"));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let (_tmp, path) = write_config("[classifier]\nprovider = \"openai\"\n");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("Unknown classifier provider"));
    }
}
