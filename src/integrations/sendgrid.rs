use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{check_status, IntegrationError, IntegrationResult, Mailer};
use crate::config::SendgridConfig;

const SEND_URL: &str = "https://api.sendgrid.com/v3/mail/send";
const OTP_SUBJECT: &str = "Your Verification Code";

pub struct Sendgrid {
    client: Client,
    config: Option<SendgridConfig>,
}

impl Sendgrid {
    pub fn new(client: Client, config: Option<SendgridConfig>) -> Self {
        Self { client, config }
    }
}

fn otp_message(sender: &str, to: &str, otp: &str) -> Value {
    json!({
        "personalizations": [{ "to": [{ "email": to }] }],
        "from": { "email": sender },
        "subject": OTP_SUBJECT,
        "content": [{
            "type": "text/html",
            "value": format!("<strong>Your OTP is: {otp}</strong><p>It will expire in 10 minutes.</p>"),
        }],
    })
}

#[async_trait]
impl Mailer for Sendgrid {
    async fn send_otp(&self, to: &str, otp: &str) -> IntegrationResult<()> {
        let config = self.config.as_ref().ok_or(IntegrationError::NotConfigured("email delivery"))?;
        let response = self
            .client
            .post(SEND_URL)
            .bearer_auth(&config.api_key)
            .json(&otp_message(&config.sender, to, otp))
            .send()
            .await?;
        check_status(response).await?;
        tracing::info!(to = %to, "verification email sent");
        Ok(())
    }
}
