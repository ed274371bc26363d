//! Push notification delivery and the daily notification jobs.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::stream::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::Database;
use tracing::{debug, info, warn};

use crate::geo;
use crate::integrations::{PushMessage, PushOutcome, PushSender};
use crate::models::{SHOPS, USERS};
use crate::routes::common::{get_datetime, to_bson_datetime};

pub mod jobs;
pub mod messages;
pub mod scheduler;

pub use messages::Notice;

pub const NEARBY_RADIUS_KM: f64 = 5.0;
pub const MISSED_SALE_COOLDOWN_MINUTES: i64 = 60;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
    pub removed: usize,
}

#[derive(Clone)]
pub struct Notifier {
    db: Database,
    push: Arc<dyn PushSender>,
}

/// Non-empty tokens, de-duplicated.
pub fn unique_tokens<I: IntoIterator<Item = String>>(tokens: I) -> Vec<String> {
    tokens
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn tokens_of(user: &Document) -> Vec<String> {
    user.get_array("fcm_tokens")
        .map(|arr| arr.iter().filter_map(Bson::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Field-path-safe key for per-product cooldowns.
pub fn cooldown_key(product_name: &str) -> String {
    product_name.trim().to_lowercase().replace(['.', '$'], "_")
}

pub fn cooldown_elapsed(last_alert: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_alert {
        Some(last) => now - last >= Duration::minutes(MISSED_SALE_COOLDOWN_MINUTES),
        None => true,
    }
}

impl Notice {
    pub fn into_message(self, data: HashMap<String, String>) -> PushMessage {
        PushMessage { title: self.title, body: self.body, data, ..Default::default() }
    }
}

impl Notifier {
    pub fn new(db: Database, push: Arc<dyn PushSender>) -> Self {
        Self { db, push }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Sends to every token and forgets the ones the push service reports as dead.
    pub async fn send(&self, tokens: Vec<String>, message: &PushMessage) -> DeliveryReport {
        let tokens = unique_tokens(tokens);
        let mut report = DeliveryReport::default();
        if tokens.is_empty() {
            debug!(title = %message.title, "no device tokens for notification");
            return report;
        }

        let mut dead: Vec<String> = Vec::new();
        for token in tokens {
            match self.push.send(&token, message).await {
                PushOutcome::Delivered => report.delivered += 1,
                PushOutcome::Unregistered => dead.push(token),
                PushOutcome::Failed(_) => report.failed += 1,
            }
        }

        if !dead.is_empty() {
            report.removed = dead.len();
            let users = self.db.collection::<Document>(USERS);
            if let Err(e) = users
                .update_many(
                    doc! { "fcm_tokens": { "$in": dead.clone() } },
                    doc! { "$pull": { "fcm_tokens": { "$in": dead.clone() } } },
                )
                .await
            {
                warn!(error = %e, "failed to prune unregistered device tokens");
            }
        }

        info!(
            title = %message.title,
            delivered = report.delivered,
            failed = report.failed,
            removed = report.removed,
            "notification sent"
        );
        report
    }

    /// Device tokens of users whose stored location is within `radius_km`.
    pub async fn nearby_user_tokens(&self, lat: f64, lng: f64, radius_km: f64) -> mongodb::error::Result<Vec<String>> {
        let users = self.db.collection::<Document>(USERS);
        let filter = doc! {
            "location": {
                "$geoWithin": { "$centerSphere": [[lng, lat], geo::radians_for_km(radius_km)] }
            },
            "fcm_tokens": { "$exists": true, "$ne": [] },
        };
        let mut cursor = users.find(filter).projection(doc! { "fcm_tokens": 1 }).await?;
        let mut tokens = Vec::new();
        while let Some(user) = cursor.try_next().await? {
            tokens.extend(tokens_of(&user));
        }
        Ok(unique_tokens(tokens))
    }

    pub async fn user_tokens(&self, user_id: &ObjectId) -> mongodb::error::Result<Vec<String>> {
        let user = self
            .db
            .collection::<Document>(USERS)
            .find_one(doc! { "_id": *user_id })
            .projection(doc! { "fcm_tokens": 1 })
            .await?;
        Ok(user.as_ref().map(tokens_of).unwrap_or_default())
    }

    /// High-priority "do you have this?" ping to a shop owner.
    pub async fn availability_request(&self, owner_id: &ObjectId, product_id: &str, product_name: &str, image_url: &str) {
        let tokens = match self.user_tokens(owner_id).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, owner_id = %owner_id, "could not load owner tokens");
                return;
            }
        };
        let data = HashMap::from([
            ("type".to_string(), "availability_check".to_string()),
            ("product_id".to_string(), product_id.to_string()),
            ("product_name".to_string(), product_name.to_string()),
            ("image_url".to_string(), image_url.to_string()),
            ("sound".to_string(), "loud_shop_bell".to_string()),
            ("priority".to_string(), "high".to_string()),
        ]);
        let mut message = messages::availability_request(product_name).into_message(data);
        message.high_priority = true;
        message.sound = Some("loud_shop_bell".to_string());
        self.send(tokens, &message).await;
    }

    /// Tells an owner a nearby search hit an item they have run out of, at most once an hour per item.
    pub async fn missed_sale_alert(&self, shop: &Document, product_name: &str) -> mongodb::error::Result<bool> {
        let Ok(shop_id) = shop.get_object_id("_id") else {
            return Ok(false);
        };
        let key = cooldown_key(product_name);
        let now = Utc::now();
        let last = shop.get_document("fomo_cooldowns").ok().and_then(|c| get_datetime(c, &key));
        if !cooldown_elapsed(last, now) {
            debug!(shop_id = %shop_id, product = %product_name, "missed-sale alert on cooldown");
            return Ok(false);
        }

        let Some(owner_id) = shop.get_str("owner_id").ok().and_then(|id| ObjectId::parse_str(id).ok()) else {
            return Ok(false);
        };
        let tokens = self.user_tokens(&owner_id).await?;
        if tokens.is_empty() {
            return Ok(false);
        }

        let data = HashMap::from([
            ("type".to_string(), "fomo_alert".to_string()),
            ("product_name".to_string(), product_name.to_string()),
        ]);
        self.send(tokens, &messages::missed_sale(product_name).into_message(data)).await;

        self.db
            .collection::<Document>(SHOPS)
            .update_one(
                doc! { "_id": shop_id },
                doc! { "$set": { format!("fomo_cooldowns.{key}"): to_bson_datetime(now) } },
            )
            .await?;
        Ok(true)
    }
}
