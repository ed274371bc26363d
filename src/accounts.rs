//! User lookups and coin-ledger persistence shared by several routers.

use chrono::{DateTime, Duration, Utc};
use futures::stream::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::options::ReturnDocument;
use mongodb::Database;

use crate::billing::{self, LedgerEntry, RewardKind};
use crate::error::ApiError;
use crate::models::{REWARDS, USERS};
use crate::routes::common::{document_id, get_datetime, get_i64, get_string, to_bson_datetime};
use crate::tokens::Claims;

const REDEMPTION_LEASE_SECS: i64 = 30;

pub async fn load_user_by_id(db: &Database, user_id: &str) -> Result<Document, ApiError> {
    let oid = ObjectId::parse_str(user_id).map_err(|_| ApiError::Unauthorized("Invalid token subject".into()))?;
    db.collection::<Document>(USERS)
        .find_one(doc! { "_id": oid })
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))
}

pub async fn load_user(db: &Database, claims: &Claims) -> Result<Document, ApiError> {
    load_user_by_id(db, &claims.sub).await
}

pub fn user_oid(user: &Document) -> Result<ObjectId, ApiError> {
    user.get_object_id("_id").map_err(|_| ApiError::Internal("user document has no _id".into()))
}

/// Appends a signed ledger entry for the user and returns its id.
pub async fn record_reward(
    db: &Database,
    user: &Document,
    coins: i64,
    kind: RewardKind,
    at: DateTime<Utc>,
) -> Result<Bson, ApiError> {
    let entry = doc! {
        "user_id": document_id(user).unwrap_or_default(),
        "uid": get_string(user, "uid").unwrap_or_default(),
        "coins": coins,
        "type": kind.as_str(),
        "created_at": to_bson_datetime(at),
    };
    let inserted = db.collection::<Document>(REWARDS).insert_one(entry).await?;
    Ok(inserted.inserted_id)
}

pub fn ledger_entry(doc: &Document) -> Option<LedgerEntry> {
    let coins = get_i64(doc, "coins")?;
    let at = get_datetime(doc, "created_at").or_else(|| get_datetime(doc, "timestamp"))?;
    Some(LedgerEntry { coins, at })
}

pub async fn active_coins(db: &Database, user: &Document, now: DateTime<Utc>) -> Result<i64, ApiError> {
    let mut owners: Vec<Bson> = Vec::new();
    if let Some(id) = document_id(user) {
        owners.push(Bson::String(id));
    }
    if let Some(uid) = get_string(user, "uid").filter(|u| !u.is_empty()) {
        owners.push(Bson::String(uid));
    }
    if owners.is_empty() {
        return Ok(0);
    }

    let entries: Vec<Document> = db
        .collection::<Document>(REWARDS)
        .find(doc! { "$or": [{ "user_id": { "$in": owners.clone() } }, { "uid": { "$in": owners } }] })
        .await?
        .try_collect()
        .await?;
    let ledger: Vec<LedgerEntry> = entries.iter().filter_map(ledger_entry).collect();
    Ok(billing::active_coins(&ledger, now))
}

/// Pushes the renewal date one billing period out and returns the updated user.
pub async fn extend_subscription(
    db: &Database,
    user_id: ObjectId,
    method: &str,
    now: DateTime<Utc>,
) -> Result<Document, ApiError> {
    let next = billing::next_billing_date(now);
    db.collection::<Document>(USERS)
        .find_one_and_update(
            doc! { "_id": user_id },
            doc! { "$set": {
                "next_payment_date": to_bson_datetime(next),
                "subscription_active": true,
                "last_payment_method": method,
                "last_payment_time": to_bson_datetime(now),
            } },
        )
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))
}

/// Takes the user's redemption lease. `false` while another redemption holds
/// an unexpired one.
pub async fn claim_redemption(db: &Database, user_id: ObjectId, now: DateTime<Utc>) -> Result<bool, ApiError> {
    let claimed = db
        .collection::<Document>(USERS)
        .find_one_and_update(
            doc! {
                "_id": user_id,
                "$or": [
                    { "redeeming_until": { "$exists": false } },
                    { "redeeming_until": { "$lt": to_bson_datetime(now) } },
                ],
            },
            doc! { "$set": { "redeeming_until": to_bson_datetime(now + Duration::seconds(REDEMPTION_LEASE_SECS)) } },
        )
        .await?;
    Ok(claimed.is_some())
}

pub async fn release_redemption(db: &Database, user_id: ObjectId) {
    let released = db
        .collection::<Document>(USERS)
        .update_one(doc! { "_id": user_id }, doc! { "$unset": { "redeeming_until": "" } })
        .await;
    if let Err(e) = released {
        tracing::error!(user_id = %user_id, error = %e, "could not release redemption lease");
    }
}
