use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{check_status, IdentityVerifier, IntegrationError, IntegrationResult, VerifiedIdentity};

const TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

/// Verifies Google ID tokens through the tokeninfo endpoint.
pub struct GoogleVerifier {
    client: Client,
    client_id: Option<String>,
}

impl GoogleVerifier {
    pub fn new(client: Client, client_id: Option<String>) -> Self {
        Self { client, client_id }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenInfo {
    aud: String,
    email: Option<String>,
    name: Option<String>,
    #[serde(default)]
    email_verified: Option<String>,
}

pub(crate) fn identity_from(info: TokenInfo, client_id: &str) -> IntegrationResult<VerifiedIdentity> {
    if info.aud != client_id {
        return Err(IntegrationError::InvalidInput("Google token was issued for another client".into()));
    }
    if info.email_verified.as_deref() == Some("false") {
        return Err(IntegrationError::InvalidInput("Google account email is not verified".into()));
    }
    let email = info
        .email
        .filter(|e| !e.is_empty())
        .ok_or_else(|| IntegrationError::InvalidInput("Google token carries no email".into()))?;
    Ok(VerifiedIdentity { email, name: info.name.filter(|n| !n.is_empty()) })
}

#[async_trait]
impl IdentityVerifier for GoogleVerifier {
    async fn verify_id_token(&self, id_token: &str) -> IntegrationResult<VerifiedIdentity> {
        let client_id = self.client_id.as_deref().ok_or(IntegrationError::NotConfigured("Google sign-in"))?;
        let response = self.client.get(TOKENINFO_URL).query(&[("id_token", id_token)]).send().await?;
        let response = match check_status(response).await {
            Ok(r) => r,
            Err(IntegrationError::Rejected { status: 400, .. }) => {
                return Err(IntegrationError::InvalidInput("Invalid Google token".into()));
            }
            Err(e) => return Err(e),
        };
        let info: TokenInfo = response.json().await?;
        identity_from(info, client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(aud: &str, email: Option<&str>) -> TokenInfo {
        TokenInfo {
            aud: aud.into(),
            email: email.map(Into::into),
            name: Some("Asha".into()),
            email_verified: Some("true".into()),
        }
    }

    #[test]
    fn accepts_matching_audience() {
        let identity = identity_from(info("web-client", Some("a@example.com")), "web-client").unwrap();
        assert_eq!(identity.email, "a@example.com");
        assert_eq!(identity.name.as_deref(), Some("Asha"));
    }

    #[test]
    fn rejects_foreign_audience_and_missing_email() {
        assert!(identity_from(info("other", Some("a@example.com")), "web-client").is_err());
        assert!(identity_from(info("web-client", None), "web-client").is_err());
    }
}
