//! Shop analytics for owners: daily performance, best sellers, stock alerts.

use std::collections::HashMap;

use axum::{Router, extract::{Query, State}, routing::{get, post}, Json, http::{HeaderMap, StatusCode}};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::stream::TryStreamExt;
use mongodb::{bson::{doc, oid::ObjectId, Bson, Document}, Database};
use serde::Deserialize;
use tracing::debug;

use crate::error::ApiError;
use crate::models::{Role, PRODUCTS, PRODUCT_SALES, PRODUCT_VIEWS, SHOPS};
use crate::notifications::jobs::{start_of_day, LOW_STOCK_THRESHOLD};
use crate::routes::common::{
    ApiResult, clamp_limit, data_response, data_response_with_status, document_id, get_i64, get_string,
    parse_object_id, require_role, to_bson_datetime,
};
use crate::routes::shops::require_owner_shop;
use crate::state::AppState;

const MAX_PERFORMANCE_DAYS: i64 = 90;

#[derive(Deserialize)]
struct PerformanceQuery {
    days: Option<i64>,
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct SaleRequest {
    product_id: String,
    shop_id: String,
    #[serde(default = "one")]
    quantity: i64,
}

fn one() -> i64{
    1
}

/// Writes a sale event and bumps the product and shop counters.
pub async fn record_sale(
    db: &Database,
    product_id: ObjectId,
    shop_id: Option<ObjectId>,
    quantity: i64,
    at: DateTime<Utc>,
) -> Result<(), ApiError> {
    let mut event = doc! { "product_id": product_id, "quantity": quantity, "timestamp": to_bson_datetime(at) };
    if let Some(shop_id) = shop_id {
        event.insert("shop_id", shop_id);
    }
    db.collection::<Document>(PRODUCT_SALES).insert_one(event).await?;
    db.collection::<Document>(PRODUCTS)
        .update_one(doc! { "_id": product_id }, doc! { "$inc": { "sale_count": quantity } })
        .await?;
    if let Some(shop_id) = shop_id {
        db.collection::<Document>(SHOPS)
            .update_one(doc! { "_id": shop_id }, doc! { "$inc": { "sale_count": quantity, "daily_sales": quantity } })
            .await?;
    }
    Ok(())
}

/// One row per day from `first`, zero-filled where nothing happened.
pub fn fill_days(first: NaiveDate, days: i64, sales: &HashMap<String, i64>, views: &HashMap<String, i64>) -> Vec<Document>{
    (0..days)
        .filter_map(|offset| first.checked_add_signed(Duration::days(offset)))
        .map(|day| {
            let key = day.format("%Y-%m-%d").to_string();
            doc! {
                "date": &key,
                "sales": sales.get(&key).copied().unwrap_or(0),
                "views": views.get(&key).copied().unwrap_or(0),
            }
        })
        .collect()
}

async fn daily_totals(db: &Database, collection: &str, shop_id: ObjectId, since: DateTime<Utc>, sum: Bson) -> Result<HashMap<String, i64>, ApiError>{
    let pipeline = vec![
        doc! { "$match": { "shop_id": shop_id, "timestamp": { "$gte": to_bson_datetime(since) } } },
        doc! { "$group": {
            "_id": { "$dateToString": { "format": "%Y-%m-%d", "date": "$timestamp" } },
            "total": { "$sum": sum },
        } },
    ];
    let rows: Vec<Document> = db.collection::<Document>(collection).aggregate(pipeline).await?.try_collect().await?;
    Ok(rows
        .iter()
        .filter_map(|row| Some((get_string(row, "_id")?, get_i64(row, "total").unwrap_or(0))))
        .collect())
}

async fn owner_shop_id(state: &AppState, owner_id: &str) -> Result<ObjectId, ApiError>{
    let shop = require_owner_shop(&state.db, owner_id).await?;
    shop.get_object_id("_id").map_err(|_| ApiError::Internal("shop document has no _id".into()))
}

async fn performance(State(state): State<AppState>, headers: HeaderMap, Query(query): Query<PerformanceQuery>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    let days = query.days.unwrap_or(7);
    if !(1..=MAX_PERFORMANCE_DAYS).contains(&days) {
        return Err(ApiError::validation("days must be between 1 and 90"));
    }
    let shop_id = owner_shop_id(&state, &claims.sub).await?;

    let since = start_of_day(Utc::now()) - Duration::days(days - 1);
    let sales = daily_totals(&state.db, PRODUCT_SALES, shop_id, since, Bson::String("$quantity".into())).await?;
    let views = daily_totals(&state.db, PRODUCT_VIEWS, shop_id, since, Bson::Int32(1)).await?;
    debug!(shop_id = %shop_id, days, "performance computed");

    let rows = fill_days(since.date_naive(), days, &sales, &views);
    Ok(data_response(Bson::Array(rows.into_iter().map(Bson::Document).collect())))
}

async fn top_products(State(state): State<AppState>, headers: HeaderMap, Query(query): Query<LimitQuery>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    let products: Vec<Document> = state.db.collection::<Document>(PRODUCTS)
        .find(doc! { "owner_id": &claims.sub })
        .sort(doc! { "sale_count": -1 })
        .limit(clamp_limit(query.limit, 3))
        .projection(doc! { "product_name": 1, "sale_count": 1 })
        .await?
        .try_collect()
        .await?;
    let body: Vec<Bson> = products
        .iter()
        .map(|p| Bson::Document(doc! {
            "id": document_id(p).unwrap_or_default(),
            "name": get_string(p, "product_name").unwrap_or_default(),
            "sold": get_i64(p, "sale_count").unwrap_or(0),
        }))
        .collect();
    Ok(data_response(Bson::Array(body)))
}

async fn dashboard(State(state): State<AppState>, headers: HeaderMap) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    let shop_id = owner_shop_id(&state, &claims.sub).await?;
    let now = Utc::now();
    let products = state.db.collection::<Document>(PRODUCTS);

    let today_views = state.db.collection::<Document>(PRODUCT_VIEWS)
        .count_documents(doc! { "shop_id": shop_id, "timestamp": { "$gte": to_bson_datetime(start_of_day(now)) } })
        .await?;
    let low_stock = products
        .count_documents(doc! { "owner_id": &claims.sub, "count": { "$lte": LOW_STOCK_THRESHOLD } })
        .await?;
    let promotions = products
        .count_documents(doc! {
            "owner_id": &claims.sub,
            "isOnSale": true,
            "saleEndDate": { "$gte": to_bson_datetime(now) },
        })
        .await?;

    Ok(data_response(Bson::Document(doc! {
        "todayViews": today_views as i64,
        "lowStockItems": low_stock as i64,
        "activePromotions": promotions as i64,
    })))
}

async fn inventory_alerts(State(state): State<AppState>, headers: HeaderMap, Query(query): Query<LimitQuery>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    let products: Vec<Document> = state.db.collection::<Document>(PRODUCTS)
        .find(doc! { "owner_id": &claims.sub, "count": { "$lte": LOW_STOCK_THRESHOLD } })
        .sort(doc! { "count": 1 })
        .limit(clamp_limit(query.limit, 5))
        .await?
        .try_collect()
        .await?;
    let body: Vec<Bson> = products
        .iter()
        .map(|p| Bson::Document(doc! {
            "id": document_id(p).unwrap_or_default(),
            "name": get_string(p, "product_name").unwrap_or_default(),
            "count": get_i64(p, "count").unwrap_or(0),
        }))
        .collect();
    Ok(data_response(Bson::Array(body)))
}

async fn add_sale(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<SaleRequest>) -> ApiResult{
    require_role(&state, &headers, &[Role::Owner, Role::Customer])?;
    let product_id = parse_object_id(&payload.product_id)?;
    let shop_id = parse_object_id(&payload.shop_id)?;
    if payload.quantity < 1 {
        return Err(ApiError::validation("quantity must be at least 1"));
    }
    record_sale(&state.db, product_id, Some(shop_id), payload.quantity, Utc::now()).await?;
    Ok(data_response_with_status(StatusCode::CREATED, Bson::Document(doc! { "ok": true })))
}

pub fn owner_router(state: AppState) -> Router{
    Router::new()
        .route("/performance", get(performance))
        .route("/top-products", get(top_products))
        .route("/dashboard", get(dashboard))
        .route("/inventory-alerts", get(inventory_alerts))
        .route("/sales", post(add_sale))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_day_is_present_in_order() {
        let first = NaiveDate::from_ymd_opt(2024, 2, 27).unwrap();
        let sales = HashMap::from([("2024-02-28".to_string(), 4)]);
        let views = HashMap::from([("2024-02-29".to_string(), 9), ("2024-03-05".to_string(), 1)]);
        let rows = fill_days(first, 4, &sales, &views);

        let dates: Vec<&str> = rows.iter().map(|r| r.get_str("date").unwrap()).collect();
        assert_eq!(dates, ["2024-02-27", "2024-02-28", "2024-02-29", "2024-03-01"]);
        assert_eq!(rows[0].get_i64("sales").unwrap(), 0);
        assert_eq!(rows[1].get_i64("sales").unwrap(), 4);
        assert_eq!(rows[2].get_i64("views").unwrap(), 9);
        assert_eq!(rows[3].get_i64("views").unwrap(), 0);
    }

    #[test]
    fn single_day_window() {
        let first = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(fill_days(first, 1, &HashMap::new(), &HashMap::new()).len(), 1);
    }
}
