//! Zero-shot product recognition over an HTTP inference endpoint.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use super::{check_status, Classifier, IntegrationError, IntegrationResult};
use crate::config::ClassifierConfig;

pub const ALLOWED_CONTENT_TYPES: [&str; 2] = ["image/jpeg", "image/png"];
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

pub struct HttpClassifier {
    client: Client,
    config: Option<ClassifierConfig>,
    labels: OnceCell<Vec<String>>,
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    inputs: String,
    parameters: Parameters<'a>,
}

#[derive(Serialize)]
struct Parameters<'a> {
    candidate_labels: &'a [String],
}

#[derive(Debug, Deserialize)]
struct Prediction {
    label: String,
    score: f64,
}

impl HttpClassifier {
    pub fn new(client: Client, config: Option<ClassifierConfig>) -> Self {
        Self { client, config, labels: OnceCell::new() }
    }

    async fn labels(&self, config: &ClassifierConfig) -> IntegrationResult<&Vec<String>> {
        self.labels
            .get_or_try_init(|| async {
                let raw = tokio::fs::read_to_string(&config.labels_path).await?;
                let labels = parse_labels(&raw);
                if labels.is_empty() {
                    return Err(IntegrationError::Decode("product label list is empty".into()));
                }
                tracing::info!(count = labels.len(), "loaded product labels");
                Ok(labels)
            })
            .await
    }
}

/// Reads the `product_name` column of a CSV file. A file without that header
/// is treated as one label per line.
pub fn parse_labels(raw: &str) -> Vec<String> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(raw.as_bytes());
    let column = reader
        .headers()
        .ok()
        .and_then(|headers| headers.iter().position(|name| name == "product_name"));

    let Some(column) = column else {
        return raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
    };
    reader
        .records()
        .filter_map(|record| match record {
            Ok(record) => record.get(column).filter(|v| !v.is_empty()).map(str::to_string),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed label row");
                None
            }
        })
        .collect()
}

pub fn validate_image(bytes: &[u8], content_type: &str) -> IntegrationResult<()> {
    if !ALLOWED_CONTENT_TYPES.contains(&content_type) {
        return Err(IntegrationError::InvalidInput("Only JPEG and PNG images are supported".into()));
    }
    if bytes.is_empty() {
        return Err(IntegrationError::InvalidInput("Image file is empty".into()));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(IntegrationError::InvalidInput("Image exceeds the 5 MB limit".into()));
    }
    Ok(())
}

fn best_label(predictions: Vec<Prediction>) -> Option<String> {
    predictions
        .into_iter()
        .max_by(|a, b| a.score.total_cmp(&b.score))
        .map(|p| p.label)
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, bytes: &[u8], content_type: &str) -> IntegrationResult<String> {
        validate_image(bytes, content_type)?;
        let config = self.config.as_ref().ok_or(IntegrationError::NotConfigured("product recognition"))?;
        let labels = self.labels(config).await?;

        let request = InferenceRequest {
            inputs: format!("data:{content_type};base64,{}", STANDARD.encode(bytes)),
            parameters: Parameters { candidate_labels: labels },
        };
        let mut builder = self.client.post(&config.url).json(&request);
        if let Some(token) = &config.token {
            builder = builder.bearer_auth(token);
        }
        let predictions: Vec<Prediction> = check_status(builder.send().await?).await?.json().await?;

        best_label(predictions).ok_or_else(|| IntegrationError::Decode("classifier returned no predictions".into()))
    }
}
