//! Razorpay orders API and signature checks.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::{check_status, GatewayOrder, IntegrationError, IntegrationResult, PaymentGateway};
use crate::config::RazorpayConfig;

const ORDERS_URL: &str = "https://api.razorpay.com/v1/orders";
const CURRENCY: &str = "INR";

type HmacSha256 = Hmac<Sha256>;

pub struct Razorpay {
    client: Client,
    config: Option<RazorpayConfig>,
}

impl Razorpay {
    pub fn new(client: Client, config: Option<RazorpayConfig>) -> Self {
        Self { client, config }
    }

    fn config(&self) -> IntegrationResult<&RazorpayConfig> {
        self.config.as_ref().ok_or(IntegrationError::NotConfigured("payment gateway"))
    }
}

#[derive(Serialize)]
struct OrderRequest<'a> {
    amount: i64,
    currency: &'a str,
    payment_capture: u8,
}

#[derive(Deserialize)]
struct OrderResponse {
    id: String,
    amount: i64,
    currency: String,
}

/// Constant-time comparison of a hex HMAC-SHA256 signature.
pub fn verify_hmac_hex(secret: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(&expected).is_ok()
}

pub fn sign_hex(secret: &str, message: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(message);
            hex::encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    }
}

#[async_trait]
impl PaymentGateway for Razorpay {
    fn key_id(&self) -> Option<String> {
        self.config.as_ref().map(|c| c.key_id.clone())
    }

    async fn create_order(&self, amount: i64) -> IntegrationResult<GatewayOrder> {
        let config = self.config()?;
        if amount <= 0 {
            return Err(IntegrationError::InvalidInput("Amount must be positive".into()));
        }

        let response = self
            .client
            .post(ORDERS_URL)
            .basic_auth(&config.key_id, Some(&config.key_secret))
            .json(&OrderRequest { amount, currency: CURRENCY, payment_capture: 1 })
            .send()
            .await?;
        let order: OrderResponse = check_status(response).await?.json().await?;

        tracing::info!(order_id = %order.id, amount = order.amount, "payment order created");
        Ok(GatewayOrder { id: order.id, amount: order.amount, currency: order.currency })
    }

    fn verify_payment_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> IntegrationResult<bool> {
        let config = self.config()?;
        let message = format!("{order_id}|{payment_id}");
        Ok(verify_hmac_hex(&config.key_secret, message.as_bytes(), signature))
    }

    fn verify_webhook_signature(&self, body: &[u8], signature: &str) -> IntegrationResult<bool> {
        let secret = self
            .config()?
            .webhook_secret
            .as_deref()
            .ok_or(IntegrationError::NotConfigured("payment webhook secret"))?;
        Ok(verify_hmac_hex(secret, body, signature))
    }
}
