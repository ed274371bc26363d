use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use futures::stream::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use tracing::{info, warn};

use super::{messages, tokens_of, Notifier, NEARBY_RADIUS_KM};
use crate::geo;
use crate::models::{Role, PRODUCTS, PRODUCT_VIEWS, SHOPS, USERS};
use crate::routes::common::{get_datetime, get_string, to_bson_datetime};

pub const ESSENTIAL_CATEGORIES: [&str; 2] = ["Dairy & Beverages", "Fruits & Vegetables"];
pub const LOW_STOCK_THRESHOLD: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    CustomerEssentials,
    OwnerMorning,
    SubscriptionReminders,
    CustomerDeals,
    OwnerEvening,
    OwnerNight,
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::CustomerEssentials => "customer_essentials",
            Job::OwnerMorning => "owner_morning",
            Job::SubscriptionReminders => "subscription_reminders",
            Job::CustomerDeals => "customer_deals",
            Job::OwnerEvening => "owner_evening",
            Job::OwnerNight => "owner_night",
        }
    }
}

pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Runs one job and returns how many devices were reached.
pub async fn run(notifier: &Notifier, job: Job, now: DateTime<Utc>) -> mongodb::error::Result<usize> {
    let delivered = match job {
        Job::CustomerEssentials => customer_essentials(notifier).await?,
        Job::OwnerMorning => owner_morning(notifier).await?,
        Job::SubscriptionReminders => subscription_reminders(notifier, now).await?,
        Job::CustomerDeals => customer_deals(notifier, now).await?,
        Job::OwnerEvening => owner_evening(notifier, now).await?,
        Job::OwnerNight => owner_night(notifier).await?,
    };
    info!(job = job.name(), delivered, "notification job finished");
    Ok(delivered)
}

fn with_tokens(mut filter: Document) -> Document {
    filter.insert("fcm_tokens", doc! { "$exists": true, "$ne": [] });
    filter
}

async fn owners_with_tokens(notifier: &Notifier) -> mongodb::error::Result<Vec<Document>> {
    notifier
        .db()
        .collection::<Document>(USERS)
        .find(with_tokens(doc! { "role": Role::Owner.as_str() }))
        .await?
        .try_collect()
        .await
}

async fn owner_morning(notifier: &Notifier) -> mongodb::error::Result<usize> {
    let owners = owners_with_tokens(notifier).await?;
    let tokens: Vec<String> = owners.iter().flat_map(tokens_of).collect();
    let notice = messages::owner_morning(&mut rand::thread_rng());
    let report = notifier.send(tokens, &notice.into_message(HashMap::new())).await;
    Ok(report.delivered)
}

async fn owner_evening(notifier: &Notifier, now: DateTime<Utc>) -> mongodb::error::Result<usize> {
    let today = start_of_day(now);
    let yesterday = today - Duration::days(1);
    let shops = notifier.db().collection::<Document>(SHOPS);
    let views = notifier.db().collection::<Document>(PRODUCT_VIEWS);

    let mut delivered = 0;
    for owner in owners_with_tokens(notifier).await? {
        let Ok(owner_id) = owner.get_object_id("_id") else { continue };
        let Some(shop) = shops.find_one(doc! { "owner_id": owner_id.to_hex() }).await? else { continue };
        let Ok(shop_id) = shop.get_object_id("_id") else { continue };

        let today_views = views
            .count_documents(doc! { "shop_id": shop_id, "timestamp": { "$gte": to_bson_datetime(today) } })
            .await?;
        let yesterday_views = views
            .count_documents(doc! {
                "shop_id": shop_id,
                "timestamp": { "$gte": to_bson_datetime(yesterday), "$lt": to_bson_datetime(today) },
            })
            .await?;

        let notice = messages::owner_evening_stats(&mut rand::thread_rng(), today_views, yesterday_views);
        delivered += notifier.send(tokens_of(&owner), &notice.into_message(HashMap::new())).await.delivered;
    }
    Ok(delivered)
}

async fn owner_night(notifier: &Notifier) -> mongodb::error::Result<usize> {
    let products = notifier.db().collection::<Document>(PRODUCTS);
    let mut delivered = 0;
    for owner in owners_with_tokens(notifier).await? {
        let Ok(owner_id) = owner.get_object_id("_id") else { continue };
        let low: Vec<Document> = products
            .find(doc! { "owner_id": owner_id.to_hex(), "count": { "$lte": LOW_STOCK_THRESHOLD } })
            .projection(doc! { "product_name": 1 })
            .limit(3)
            .await?
            .try_collect()
            .await?;
        let names: Vec<String> = low.iter().filter_map(|p| get_string(p, "product_name")).collect();

        let notice = messages::owner_night_stock(&mut rand::thread_rng(), &names);
        delivered += notifier.send(tokens_of(&owner), &notice.into_message(HashMap::new())).await.delivered;
    }
    Ok(delivered)
}

async fn customer_essentials(notifier: &Notifier) -> mongodb::error::Result<usize> {
    let pipeline = vec![
        doc! { "$match": { "category": { "$in": ESSENTIAL_CATEGORIES.to_vec() }, "inStock": true, "count": { "$gt": 0 } } },
        doc! { "$group": { "_id": "$shop_id", "names": { "$addToSet": "$product_name" } } },
    ];
    let groups: Vec<Document> = notifier
        .db()
        .collection::<Document>(PRODUCTS)
        .aggregate(pipeline)
        .await?
        .try_collect()
        .await?;

    let shops = notifier.db().collection::<Document>(SHOPS);
    let mut delivered = 0;
    for group in groups {
        let Some(shop_id) = get_string(&group, "_id") else { continue };
        let Ok(oid) = ObjectId::parse_str(&shop_id) else { continue };
        let names: Vec<String> = group
            .get_array("names")
            .map(|a| a.iter().filter_map(Bson::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        if names.is_empty() {
            continue;
        }
        let Some(shop) = shops.find_one(doc! { "_id": oid }).await? else { continue };
        let Some((lat, lng)) = geo::shop_coordinates(&shop) else {
            warn!(shop_id = %shop_id, "shop has no coordinates; skipping essentials notice");
            continue;
        };

        let tokens = notifier.nearby_user_tokens(lat, lng, NEARBY_RADIUS_KM).await?;
        if tokens.is_empty() {
            continue;
        }
        let shop_name = get_string(&shop, "name").unwrap_or_else(|| "a nearby store".to_string());
        let data = HashMap::from([("shop_id".to_string(), shop_id.clone())]);
        let notice = messages::customer_essentials(&shop_name, &names);
        delivered += notifier.send(tokens, &notice.into_message(data)).await.delivered;
    }
    Ok(delivered)
}

async fn customer_deals(notifier: &Notifier, now: DateTime<Utc>) -> mongodb::error::Result<usize> {
    let shop_ids = notifier
        .db()
        .collection::<Document>(PRODUCTS)
        .distinct(
            "shop_id",
            doc! { "isOnSale": true, "saleEndDate": { "$gte": to_bson_datetime(now) }, "inStock": true, "count": { "$gt": 0 } },
        )
        .await?;
    let oids: Vec<ObjectId> = shop_ids
        .iter()
        .filter_map(Bson::as_str)
        .filter_map(|id| ObjectId::parse_str(id).ok())
        .collect();
    if oids.is_empty() {
        return Ok(0);
    }

    let shops: Vec<Document> = notifier
        .db()
        .collection::<Document>(SHOPS)
        .find(doc! { "_id": { "$in": oids } })
        .await?
        .try_collect()
        .await?;

    let mut delivered = 0;
    for shop in shops {
        let Some((lat, lng)) = geo::shop_coordinates(&shop) else { continue };
        let tokens = notifier.nearby_user_tokens(lat, lng, NEARBY_RADIUS_KM).await?;
        if tokens.is_empty() {
            continue;
        }
        let shop_name = get_string(&shop, "name").unwrap_or_else(|| "a nearby store".to_string());
        let data = HashMap::from([("screen".to_string(), "Deals".to_string())]);
        delivered += notifier.send(tokens, &messages::customer_deals(&shop_name).into_message(data)).await.delivered;
    }
    Ok(delivered)
}

async fn subscription_reminders(notifier: &Notifier, now: DateTime<Utc>) -> mongodb::error::Result<usize> {
    let users = notifier.db().collection::<Document>(USERS);
    let today = start_of_day(now);
    let horizon = crate::billing::REMINDER_OFFSETS_DAYS.iter().copied().max().unwrap_or(0) + 1;
    let filter = with_tokens(doc! {
        "next_payment_date": {
            "$gte": to_bson_datetime(today),
            "$lt": to_bson_datetime(today + Duration::days(horizon)),
        },
    });

    let mut delivered = 0;
    let mut cursor = users.find(filter).await?;
    while let Some(user) = cursor.try_next().await? {
        let Some(days) = get_datetime(&user, "next_payment_date").and_then(|next| crate::billing::reminder_due(next, now)) else {
            continue;
        };
        let role = get_string(&user, "role").and_then(|r| Role::parse(&r)).unwrap_or(Role::Customer);
        let data = HashMap::from([("screen".to_string(), "Subscription".to_string())]);
        let notice = messages::subscription_reminder(days, role);
        delivered += notifier.send(tokens_of(&user), &notice.into_message(data)).await.delivered;
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn start_of_day_truncates_to_midnight_utc() {
        let now = Utc.with_ymd_and_hms(2024, 7, 4, 17, 45, 12).unwrap();
        assert_eq!(start_of_day(now), Utc.with_ymd_and_hms(2024, 7, 4, 0, 0, 0).unwrap());
    }

    #[test]
    fn token_filter_is_added() {
        let filter = with_tokens(doc! { "role": "owner" });
        assert_eq!(filter.get_str("role").unwrap(), "owner");
        assert!(filter.get_document("fcm_tokens").is_ok());
    }
}
