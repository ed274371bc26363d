use std::sync::Arc;

use mongodb::Database;

use crate::config::AppConfig;
use crate::integrations::{
    classifier::HttpClassifier, cloudinary::Cloudinary, fcm::Fcm, google::GoogleVerifier, razorpay::Razorpay,
    sendgrid::Sendgrid, Classifier, IdentityVerifier, ImageStore, Mailer, PaymentGateway, PushSender,
};
use crate::notifications::Notifier;
use crate::tokens::TokenService;

/// Shared handles passed to every router.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<AppConfig>,
    pub tokens: TokenService,
    pub payments: Arc<dyn PaymentGateway>,
    pub images: Arc<dyn ImageStore>,
    pub mailer: Arc<dyn Mailer>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub classifier: Arc<dyn Classifier>,
    pub notifier: Notifier,
}

/// Third-party clients, swappable for tests.
pub struct Integrations {
    pub payments: Arc<dyn PaymentGateway>,
    pub images: Arc<dyn ImageStore>,
    pub mailer: Arc<dyn Mailer>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub push: Arc<dyn PushSender>,
    pub classifier: Arc<dyn Classifier>,
}

impl Integrations {
    pub fn from_config(config: &AppConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            payments: Arc::new(Razorpay::new(client.clone(), config.razorpay.clone())),
            images: Arc::new(Cloudinary::new(client.clone(), config.cloudinary.clone())),
            mailer: Arc::new(Sendgrid::new(client.clone(), config.sendgrid.clone())),
            identity: Arc::new(GoogleVerifier::new(client.clone(), config.google_client_id.clone())),
            push: Arc::new(Fcm::new(client.clone(), config.fcm.clone())),
            classifier: Arc::new(HttpClassifier::new(client, config.classifier.clone())),
        }
    }
}

impl AppState {
    pub fn new(db: Database, config: AppConfig, integrations: Integrations) -> Self {
        let tokens = TokenService::new(&config.jwt);
        Self {
            notifier: Notifier::new(db.clone(), integrations.push),
            db,
            config: Arc::new(config),
            tokens,
            payments: integrations.payments,
            images: integrations.images,
            mailer: integrations.mailer,
            identity: integrations.identity,
            classifier: integrations.classifier,
        }
    }
}
