//! Signature classification.
//!
//! Defines the [`SignatureClassifier`] capability and its implementations:
//! - **[`DisabledClassifier`]** — always fails; used when no provider is configured.
//! - **[`GeminiClassifier`]** — asks a Gemini model for the table's dominant
//!   column/value pair and parses the reply with [`crate::response`].
//!
//! Callers go through [`classify_table`], which applies the sampling policy:
//! only the first `sample_rows` rows of a table are ever sent.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ClassifierConfig;
use crate::gemini::{GeminiClient, GeminiError, Part};
use crate::models::{Signature, Table};
use crate::response::{parse_signature, ResponseParseError};
use crate::table::{to_csv_string, TableError};

/// Instruction sent after the sampled rows.
pub const SIGNATURE_PROMPT: &str = "Analyze the CSV data and return only JSON:\n\
{\"column\": \"most_common_column\", \"value\": \"most_common_value\"}\n\
No extra text!";

#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("classifier is disabled; set [classifier] provider in config")]
    Disabled,
    #[error("classifier service failed for '{identifier}': {source}")]
    Service {
        identifier: String,
        #[source]
        source: GeminiError,
    },
    #[error("classifier response for '{identifier}' is unusable: {source}")]
    Response {
        identifier: String,
        #[source]
        source: ResponseParseError,
    },
    #[error("could not render sample of '{identifier}': {source}")]
    Sample {
        identifier: String,
        #[source]
        source: TableError,
    },
}

/// Produces a table's dominant `(column, value)` pair.
///
/// Implementations receive an already-sampled table and must not touch any
/// store; the engine decides what to do with the result.
#[async_trait]
pub trait SignatureClassifier: Send + Sync {
    /// Short provider name for logs (e.g. `"gemini-2.0-flash"`).
    fn name(&self) -> &str;

    async fn classify(&self, identifier: &str, sample: &Table)
        -> Result<Signature, ClassificationError>;
}

/// Samples `table` down to `max_rows` and classifies it.
pub async fn classify_table(
    classifier: &dyn SignatureClassifier,
    table: &Table,
    max_rows: usize,
) -> Result<Signature, ClassificationError> {
    let sample = table.head(max_rows);
    match classifier.classify(&table.identifier, &sample).await {
        Ok(signature) => {
            info!(
                "{} analyzed by {}: {}",
                table.identifier,
                classifier.name(),
                signature
            );
            Ok(signature)
        }
        Err(e) => {
            warn!("{} could not be analyzed: {}", table.identifier, e);
            Err(e)
        }
    }
}

/// Full prompt text for a sampled table.
pub fn build_prompt(sample: &Table) -> Result<String, TableError> {
    let csv = to_csv_string(sample)?;
    Ok(format!("Data: {}\n{}", csv, SIGNATURE_PROMPT))
}

/// Builds the classifier named by `config.provider`.
pub fn create_classifier(config: &ClassifierConfig) -> anyhow::Result<Box<dyn SignatureClassifier>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledClassifier)),
        "gemini" => Ok(Box::new(GeminiClassifier::new(config)?)),
        other => anyhow::bail!("Unknown classifier provider: {}", other),
    }
}

// ============ Disabled ============

pub struct DisabledClassifier;

#[async_trait]
impl SignatureClassifier for DisabledClassifier {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn classify(
        &self,
        _identifier: &str,
        _sample: &Table,
    ) -> Result<Signature, ClassificationError> {
        Err(ClassificationError::Disabled)
    }
}

// ============ Gemini ============

pub struct GeminiClassifier {
    client: GeminiClient,
}

impl GeminiClassifier {
    /// # Errors
    ///
    /// Fails if the API key variable named in `config.api_key_env` is unset.
    pub fn new(config: &ClassifierConfig) -> Result<Self, GeminiError> {
        let client = GeminiClient::from_env(
            &config.endpoint,
            &config.model,
            &config.api_key_env,
            config.timeout_secs,
        )?;
        Ok(Self { client })
    }

    pub fn with_client(client: GeminiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SignatureClassifier for GeminiClassifier {
    fn name(&self) -> &str {
        self.client.model()
    }

    async fn classify(
        &self,
        identifier: &str,
        sample: &Table,
    ) -> Result<Signature, ClassificationError> {
        let prompt = build_prompt(sample).map_err(|source| ClassificationError::Sample {
            identifier: identifier.to_string(),
            source,
        })?;
        let raw = self
            .client
            .generate(&[Part::Text(prompt)])
            .await
            .map_err(|source| ClassificationError::Service {
                identifier: identifier.to_string(),
                source,
            })?;
        parse_signature(&raw).map_err(|source| ClassificationError::Response {
            identifier: identifier.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingClassifier {
        seen_rows: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl SignatureClassifier for RecordingClassifier {
        fn name(&self) -> &str {
            "recording"
        }

        async fn classify(
            &self,
            _identifier: &str,
            sample: &Table,
        ) -> Result<Signature, ClassificationError> {
            self.seen_rows.lock().unwrap().push(sample.len());
            Ok(Signature::new("n", "0").unwrap())
        }
    }

    fn numbered_table(rows: usize) -> Table {
        Table::new(
            "big.csv",
            vec!["n".into()],
            (0..rows).map(|i| vec![i.to_string()]).collect(),
        )
    }

    #[tokio::test]
    async fn test_classify_table_sends_at_most_sample_rows() {
        let classifier = RecordingClassifier {
            seen_rows: Mutex::new(Vec::new()),
        };
        classify_table(&classifier, &numbered_table(500), 20)
            .await
            .unwrap();
        classify_table(&classifier, &numbered_table(3), 20)
            .await
            .unwrap();
        assert_eq!(*classifier.seen_rows.lock().unwrap(), vec![20, 3]);
    }

    #[tokio::test]
    async fn test_disabled_classifier_fails() {
        let err = classify_table(&DisabledClassifier, &numbered_table(1), 20)
            .await
            .unwrap_err();
        assert!(matches!(err, ClassificationError::Disabled));
    }

    #[test]
    fn test_prompt_contains_sample_csv_and_instruction() {
        let prompt = build_prompt(&numbered_table(2)).unwrap();
        assert!(prompt.starts_with("Data: n\n0\n1\n"));
        assert!(prompt.ends_with("No extra text!"));
    }

    #[test]
    fn test_create_disabled_classifier() {
        let config = ClassifierConfig {
            provider: "disabled".into(),
            ..ClassifierConfig::default()
        };
        let classifier = create_classifier(&config).unwrap();
        assert_eq!(classifier.name(), "disabled");
    }
}
