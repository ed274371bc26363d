use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{check_status, ImageStore, IntegrationError, IntegrationResult, StoredImage};
use crate::config::CloudinaryConfig;

pub struct Cloudinary {
    client: Client,
    config: Option<CloudinaryConfig>,
}

#[derive(Deserialize)]
struct UploadResponse {
    public_id: String,
}

impl Cloudinary {
    pub fn new(client: Client, config: Option<CloudinaryConfig>) -> Self {
        Self { client, config }
    }
}

/// Signed-upload signature: parameters sorted by name, joined as a query string, secret appended.
pub fn upload_signature(params: &[(&str, &str)], api_secret: &str) -> String {
    let mut sorted: Vec<_> = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let digest = Sha256::digest(format!("{joined}{api_secret}").as_bytes());
    hex::encode(digest)
}

/// Delivery URL with background removal applied.
pub fn delivery_url(cloud_name: &str, public_id: &str) -> String {
    format!("https://res.cloudinary.com/{cloud_name}/image/upload/e_background_removal/{public_id}.jpg")
}

#[async_trait]
impl ImageStore for Cloudinary {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> IntegrationResult<StoredImage> {
        let config = self.config.as_ref().ok_or(IntegrationError::NotConfigured("image storage"))?;
        if bytes.is_empty() {
            return Err(IntegrationError::InvalidInput("Image file is empty".into()));
        }

        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = upload_signature(&[("folder", &config.folder), ("timestamp", &timestamp)], &config.api_secret);
        let file = format!("data:{content_type};base64,{}", STANDARD.encode(&bytes));
        let url = format!("https://api.cloudinary.com/v1_1/{}/image/upload", config.cloud_name);

        let response = self
            .client
            .post(url)
            .form(&[
                ("file", file.as_str()),
                ("api_key", config.api_key.as_str()),
                ("timestamp", timestamp.as_str()),
                ("folder", config.folder.as_str()),
                ("signature", signature.as_str()),
                ("signature_algorithm", "sha256"),
            ])
            .send()
            .await?;
        let uploaded: UploadResponse = check_status(response).await?.json().await?;
        if uploaded.public_id.is_empty() {
            return Err(IntegrationError::Decode("upload response has no public_id".into()));
        }

        tracing::debug!(public_id = %uploaded.public_id, "image uploaded");
        Ok(StoredImage {
            url: delivery_url(&config.cloud_name, &uploaded.public_id),
            public_id: uploaded.public_id,
        })
    }
}
