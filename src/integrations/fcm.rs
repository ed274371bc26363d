//! Firebase Cloud Messaging HTTP v1 sender.
//!
//! Authenticates with a service-account key: a short-lived RS256 assertion is
//! exchanged for an OAuth access token, which is cached until shortly before
//! it expires.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{check_status, IntegrationError, IntegrationResult, PushMessage, PushOutcome, PushSender};
use crate::config::FcmConfig;

const SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
struct ServiceAccount {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct Fcm {
    client: Client,
    config: Option<FcmConfig>,
    account: Mutex<Option<ServiceAccount>>,
    token: Mutex<Option<CachedToken>>,
}

impl Fcm {
    pub fn new(client: Client, config: Option<FcmConfig>) -> Self {
        Self { client, config, account: Mutex::new(None), token: Mutex::new(None) }
    }

    async fn service_account(&self, config: &FcmConfig) -> IntegrationResult<ServiceAccount> {
        let mut guard = self.account.lock().await;
        if let Some(account) = guard.as_ref() {
            return Ok(account.clone());
        }
        let raw = tokio::fs::read_to_string(&config.service_account_path).await?;
        let account: ServiceAccount =
            serde_json::from_str(&raw).map_err(|e| IntegrationError::Decode(format!("service account: {e}")))?;
        *guard = Some(account.clone());
        Ok(account)
    }

    async fn access_token(&self, config: &FcmConfig) -> IntegrationResult<String> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.value.clone());
            }
        }

        let account = self.service_account(config).await?;
        let token_uri = account.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
        let now = chrono::Utc::now().timestamp();
        let claims = AssertionClaims { iss: &account.client_email, scope: SCOPE, aud: token_uri, iat: now, exp: now + 3600 };
        let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)?;

        let response = self
            .client
            .post(token_uri)
            .form(&[("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let token: TokenResponse = check_status(response).await?.json().await?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(REFRESH_MARGIN);
        *guard = Some(CachedToken { value: token.access_token.clone(), refresh_at: Instant::now() + lifetime });
        Ok(token.access_token)
    }

    async fn try_send(&self, config: &FcmConfig, token: &str, message: &PushMessage) -> IntegrationResult<()> {
        let access_token = self.access_token(config).await?;
        let url = format!("https://fcm.googleapis.com/v1/projects/{}/messages:send", config.project_id);
        let response = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(&message_body(token, message))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

fn message_body(token: &str, message: &PushMessage) -> Value {
    let priority = if message.high_priority { "high" } else { "normal" };
    let sound = message.sound.clone().unwrap_or_else(|| "default".to_string());
    json!({
        "message": {
            "token": token,
            "notification": { "title": message.title, "body": message.body },
            "data": message.data,
            "android": { "priority": priority, "notification": { "sound": sound } },
            "apns": { "payload": { "aps": { "sound": sound } } },
        }
    })
}

/// Whether an FCM error response means the device token is dead.
pub fn is_unregistered(status: u16, body: &str) -> bool {
    if status == 404 || body.contains("UNREGISTERED") {
        return true;
    }
    status == 400 && body.contains("INVALID_ARGUMENT") && body.contains("registration token")
}

#[async_trait]
impl PushSender for Fcm {
    async fn send(&self, token: &str, message: &PushMessage) -> PushOutcome {
        let Some(config) = self.config.as_ref() else {
            tracing::debug!("push delivery not configured; dropping notification");
            return PushOutcome::Failed("push delivery is not configured".into());
        };
        match self.try_send(config, token, message).await {
            Ok(()) => PushOutcome::Delivered,
            Err(IntegrationError::Rejected { status, body }) if is_unregistered(status, &body) => PushOutcome::Unregistered,
            Err(e) => {
                tracing::warn!(error = %e, "push notification failed");
                PushOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn classifies_dead_tokens() {
        assert!(is_unregistered(404, r#"{"error":{"status":"NOT_FOUND"}}"#));
        assert!(is_unregistered(400, r#"{"details":[{"errorCode":"UNREGISTERED"}]}"#));
        assert!(is_unregistered(400, r#"{"status":"INVALID_ARGUMENT","message":"The registration token is not a valid FCM registration token"}"#));
        assert!(!is_unregistered(400, r#"{"status":"INVALID_ARGUMENT","message":"data must be strings"}"#));
        assert!(!is_unregistered(503, "unavailable"));
    }

    #[test]
    fn high_priority_messages_carry_sound() {
        let message = PushMessage {
            title: "Check".into(),
            body: "Is it in stock?".into(),
            data: HashMap::from([("type".to_string(), "availability_check".to_string())]),
            high_priority: true,
            sound: Some("loud_shop_bell".into()),
        };
        let body = message_body("tok", &message);
        assert_eq!(body["message"]["token"], "tok");
        assert_eq!(body["message"]["android"]["priority"], "high");
        assert_eq!(body["message"]["android"]["notification"]["sound"], "loud_shop_bell");
        assert_eq!(body["message"]["data"]["type"], "availability_check");
    }
}
