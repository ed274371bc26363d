#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::{body::{self, Body}, http::Request};
use chrono::Utc;
use mongodb::bson::Document;
use serde_json::Value;

use av_server::config::{AppConfig, RazorpayConfig};
use av_server::integrations::{
    razorpay::Razorpay, Classifier, IdentityVerifier, ImageStore, IntegrationError, IntegrationResult, Mailer,
    PushMessage, PushOutcome, PushSender, StoredImage, VerifiedIdentity,
};
use av_server::state::Integrations;
use av_server::tokens::TokenService;

pub const JWT_SECRET: &str = "integration-test-secret";
pub const KEY_SECRET: &str = "rzp_test_secret";
pub const WEBHOOK_SECRET: &str = "whsec_test";

pub struct NoImages;

#[async_trait]
impl ImageStore for NoImages {
    async fn upload(&self, _bytes: Vec<u8>, _content_type: &str) -> IntegrationResult<StoredImage> {
        Err(IntegrationError::NotConfigured("image storage"))
    }
}

pub struct SilentMailer;

#[async_trait]
impl Mailer for SilentMailer {
    async fn send_otp(&self, _to: &str, _otp: &str) -> IntegrationResult<()> {
        Ok(())
    }
}

pub struct RejectingIdentity;

#[async_trait]
impl IdentityVerifier for RejectingIdentity {
    async fn verify_id_token(&self, _id_token: &str) -> IntegrationResult<VerifiedIdentity> {
        Err(IntegrationError::InvalidInput("Invalid Google token".into()))
    }
}

pub struct NullPush;

#[async_trait]
impl PushSender for NullPush {
    async fn send(&self, _token: &str, _message: &PushMessage) -> PushOutcome {
        PushOutcome::Delivered
    }
}

pub struct FixedLabel;

#[async_trait]
impl Classifier for FixedLabel {
    async fn classify(&self, _bytes: &[u8], _content_type: &str) -> IntegrationResult<String> {
        Ok("Amul Milk".to_string())
    }
}

pub fn config(mongo_uri: &str, db_name: &str) -> AppConfig {
    AppConfig::from_lookup(|key| match key {
        "MONGO_URI" => Some(mongo_uri.to_string()),
        "DB_NAME" => Some(db_name.to_string()),
        "JWT_SECRET" => Some(JWT_SECRET.to_string()),
        "SCHEDULER_ENABLED" => Some("false".to_string()),
        _ => None,
    })
    .unwrap()
}

pub fn integrations(payments_configured: bool) -> Integrations {
    let razorpay = payments_configured.then(|| RazorpayConfig {
        key_id: "rzp_test_key".to_string(),
        key_secret: KEY_SECRET.to_string(),
        webhook_secret: Some(WEBHOOK_SECRET.to_string()),
    });
    Integrations {
        payments: Arc::new(Razorpay::new(reqwest::Client::new(), razorpay)),
        images: Arc::new(NoImages),
        mailer: Arc::new(SilentMailer),
        identity: Arc::new(RejectingIdentity),
        push: Arc::new(NullPush),
        classifier: Arc::new(FixedLabel),
    }
}

pub fn token_for_user(config: &AppConfig, user: &Document) -> String {
    TokenService::new(&config.jwt).issue_for_user(user, Utc::now()).unwrap()
}

pub fn json_request(method: &str, uri: &str, token: Option<&str>, payload: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(payload.to_string())).unwrap()
}

pub fn get_request(uri: &str, token: &str) -> Request<Body> {
    Request::get(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

pub fn webhook_request(payload: &Value, signature: &str) -> Request<Body> {
    Request::post("/payments/webhook")
        .header("content-type", "application/json")
        .header("x-razorpay-signature", signature)
        .body(Body::from(payload.to_string()))
        .unwrap()
}

pub fn multipart_request(uri: &str, content_type: &str, bytes: &[u8]) -> Request<Body> {
    let boundary = "av-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"file\"; filename=\"upload\"\r\n");
    body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    Request::post(uri)
        .header("content-type", format!("multipart/form-data; boundary={boundary}"))
        .body(Body::from(body))
        .unwrap()
}

pub async fn read_json(resp: axum::response::Response) -> Value {
    let bytes = body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
