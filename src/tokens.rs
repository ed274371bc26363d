use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use mongodb::bson::Document;
use serde::{Deserialize, Serialize};

use crate::billing;
use crate::config::JwtConfig;
use crate::error::ApiError;
use crate::models::Role;
use crate::routes::common::{document_id, get_bool, get_datetime, get_i64, get_string};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Claims {
    pub sub: String,
    pub uid: String,
    pub role: Role,
    pub onboarding_done: bool,
    pub has_entered_referral: bool,
    pub coins: i64,
    pub subscription_active: bool,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenService {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            ttl: Duration::minutes(config.expiry_minutes),
        }
    }

    /// Claims reflecting the stored user at `now`.
    pub fn claims_for_user(&self, user: &Document, now: DateTime<Utc>) -> Result<Claims, ApiError> {
        let sub = document_id(user).ok_or_else(|| ApiError::Internal("user document has no id".into()))?;
        let role = get_string(user, "role")
            .and_then(|r| Role::parse(&r))
            .unwrap_or(Role::Customer);
        Ok(Claims {
            sub,
            uid: get_string(user, "uid").unwrap_or_default(),
            role,
            onboarding_done: get_bool(user, "onboarding_done").unwrap_or(false),
            has_entered_referral: get_bool(user, "hasEnteredReferral").unwrap_or(false),
            coins: get_i64(user, "coins").unwrap_or(0),
            subscription_active: billing::subscription_active(get_datetime(user, "next_payment_date"), now),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        })
    }

    pub fn encode(&self, claims: &Claims) -> Result<String, ApiError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| ApiError::Internal(format!("token signing failed: {e}")))
    }

    pub fn issue_for_user(&self, user: &Document, now: DateTime<Utc>) -> Result<String, ApiError> {
        self.encode(&self.claims_for_user(user, now)?)
    }

    pub fn decode(&self, token: &str) -> Result<Claims, ApiError> {
        let validation = Validation::new(Algorithm::HS256);
        Ok(jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)?.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{doc, oid::ObjectId, DateTime as BsonDateTime};

    fn service() -> TokenService {
        TokenService::new(&JwtConfig { secret: "test-secret-0123456789".into(), expiry_minutes: 60 })
    }

    #[test]
    fn claims_reflect_user_document() {
        let now = Utc::now();
        let id = ObjectId::new();
        let user = doc! {
            "_id": id,
            "uid": "asha@example.com",
            "role": "owner",
            "onboarding_done": true,
            "coins": 28_i64,
            "next_payment_date": BsonDateTime::from_millis((now + Duration::days(2)).timestamp_millis()),
        };
        let claims = service().claims_for_user(&user, now).unwrap();
        assert_eq!(claims.sub, id.to_hex());
        assert_eq!(claims.role, Role::Owner);
        assert!(claims.onboarding_done);
        assert!(!claims.has_entered_referral);
        assert_eq!(claims.coins, 28);
        assert!(claims.subscription_active);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn issued_token_decodes() {
        let service = service();
        let user = doc! { "_id": ObjectId::new(), "role": "customer" };
        let token = service.issue_for_user(&user, Utc::now()).unwrap();
        let claims = service.decode(&token).unwrap();
        assert_eq!(claims.role, Role::Customer);
        assert!(!claims.subscription_active);
    }

    #[test]
    fn expired_token_is_rejected() {
        let service = service();
        let user = doc! { "_id": ObjectId::new(), "role": "customer" };
        let token = service.issue_for_user(&user, Utc::now() - Duration::days(1)).unwrap();
        let err = service.decode(&token).unwrap_err();
        assert_eq!(err.to_string(), "Token has expired");
    }

    #[test]
    fn foreign_secret_is_rejected() {
        let other = TokenService::new(&JwtConfig { secret: "another-secret-abcdef".into(), expiry_minutes: 60 });
        let user = doc! { "_id": ObjectId::new(), "role": "customer" };
        let token = other.issue_for_user(&user, Utc::now()).unwrap();
        assert!(matches!(service().decode(&token), Err(ApiError::Unauthorized(_))));
    }
}
