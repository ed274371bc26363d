//! Outbound third-party services.
//!
//! Each service sits behind a trait so handlers only see [`AppState`](crate::state::AppState)
//! and tests can substitute fakes.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub mod classifier;
pub mod cloudinary;
pub mod fcm;
pub mod google;
pub mod razorpay;
pub mod sendgrid;

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("{0}")]
    NotConfigured(&'static str),

    #[error("{0}")]
    InvalidInput(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IntegrationResult<T> = Result<T, IntegrationError>;

/// Turns a non-success response into [`IntegrationError::Rejected`] keeping the body.
pub(crate) async fn check_status(response: reqwest::Response) -> IntegrationResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(IntegrationError::Rejected { status: status.as_u16(), body })
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn key_id(&self) -> Option<String>;

    /// Creates an order for `amount` in the smallest currency unit.
    async fn create_order(&self, amount: i64) -> IntegrationResult<GatewayOrder>;

    fn verify_payment_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> IntegrationResult<bool>;

    fn verify_webhook_signature(&self, body: &[u8], signature: &str) -> IntegrationResult<bool>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredImage {
    pub public_id: String,
    pub url: String,
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> IntegrationResult<StoredImage>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_otp(&self, to: &str, otp: &str) -> IntegrationResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedIdentity {
    pub email: String,
    pub name: Option<String>,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify_id_token(&self, id_token: &str) -> IntegrationResult<VerifiedIdentity>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The device token is no longer valid and should be forgotten.
    Unregistered,
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: HashMap<String, String>,
    pub high_priority: bool,
    pub sound: Option<String>,
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, token: &str, message: &PushMessage) -> PushOutcome;
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Best matching product label for the image.
    async fn classify(&self, bytes: &[u8], content_type: &str) -> IntegrationResult<String>;
}
