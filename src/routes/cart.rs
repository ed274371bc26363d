use axum::{Json, Router, extract::State, http::HeaderMap, routing::{get, post}};
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::{bson::{doc, Bson, Document}, options::ReturnDocument};
use serde::Deserialize;
use tracing::info;

use crate::accounts::{load_user, record_reward, user_oid};
use crate::billing::{self, RewardKind};
use crate::error::ApiError;
use crate::models::{CartItem, Role, CART, PRODUCTS, USERS};
use crate::routes::common::{
    ApiResult, data_response, get_i64, get_string, iso_from_bson, parse_object_id, require_role, to_bson_datetime,
};
use crate::routes::owner::record_sale;
use crate::routes::products::product_view;
use crate::state::AppState;

#[derive(Deserialize)]
struct AddItemRequest {
    product_id: String,
}

#[derive(Deserialize)]
struct CheckoutRequest {
    #[serde(default)]
    items: Vec<CartItem>,
}

fn cart_entry(item: &CartItem, user_id: &str, uid: &str, at: mongodb::bson::DateTime) -> Result<Document, ApiError>{
    if item.quantity < 1 {
        return Err(ApiError::validation("Quantity must be at least 1"));
    }
    if !item.price.is_finite() || item.price < 0.0 {
        return Err(ApiError::validation("Price must be zero or more"));
    }
    parse_object_id(&item.id)?;
    Ok(doc! {
        "user_id": user_id,
        "uid": uid,
        "id": &item.id,
        "product_name": &item.product_name,
        "price": item.price,
        "unit": &item.unit,
        "quantity": item.quantity,
        "shop_id": &item.shop_id,
        "timestamp": at,
    })
}

async fn add_item(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<AddItemRequest>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer])?;
    let product_id = parse_object_id(&payload.product_id)?;
    let products = state.db.collection::<Document>(PRODUCTS);

    let reserved = products
        .find_one_and_update(
            doc! { "_id": product_id, "count": { "$gt": 0 } },
            doc! { "$inc": { "count": -1_i64 } },
        )
        .return_document(ReturnDocument::After)
        .await?;
    let Some(product) = reserved else {
        return match products.find_one(doc! { "_id": product_id }).await? {
            Some(_) => Err(ApiError::validation("Product is out of stock.")),
            None => Err(ApiError::not_found("Product not found")),
        };
    };

    let now = Utc::now();
    let shop_id = get_string(&product, "shop_id").and_then(|id| parse_object_id(&id).ok());
    record_sale(&state.db, product_id, shop_id, 1, now).await?;

    let mut product = product;
    let sold = get_i64(&product, "sale_count").unwrap_or(0) + 1;
    product.insert("sale_count", sold);
    info!(customer = %claims.sub, product_id = %product_id, "item reserved");
    Ok(data_response(Bson::Document(product_view(&product, now))))
}

async fn checkout(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<CheckoutRequest>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer])?;
    if payload.items.is_empty() {
        return Err(ApiError::validation("Cart is empty."));
    }
    let now = Utc::now();
    let at = to_bson_datetime(now);
    let entries = payload.items
        .iter()
        .map(|item| cart_entry(item, &claims.sub, &claims.uid, at))
        .collect::<Result<Vec<_>, _>>()?;

    let user = load_user(&state.db, &claims).await?;
    state.db.collection::<Document>(CART).insert_many(entries).await?;

    let updated = state.db.collection::<Document>(USERS)
        .find_one_and_update(
            doc! { "_id": user_oid(&user)? },
            doc! { "$inc": { "coins": billing::CHECKOUT_REWARD_COINS } },
        )
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    record_reward(&state.db, &updated, billing::CHECKOUT_REWARD_COINS, RewardKind::Checkout, now).await?;

    info!(customer = %claims.sub, items = payload.items.len(), "checkout complete");
    Ok(data_response(Bson::Document(doc! {
        "message": "Checkout successful",
        "updated_coins": get_i64(&updated, "coins").unwrap_or(0),
    })))
}

async fn get_cart(State(state): State<AppState>, headers: HeaderMap) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    let mut cursor = state.db.collection::<Document>(CART)
        .find(doc! { "user_id": &claims.sub })
        .projection(doc! { "_id": 0, "user_id": 0 })
        .sort(doc! { "timestamp": -1 })
        .await?;
    let mut items = Vec::new();
    while let Some(mut item) = cursor.try_next().await? {
        if let Some(at) = item.get("timestamp").and_then(iso_from_bson) {
            item.insert("timestamp", at);
        }
        items.push(Bson::Document(item));
    }
    Ok(data_response(Bson::Array(items)))
}

pub fn cart_router(state: AppState) -> Router{
    Router::new()
        .route("/", get(get_cart))
        .route("/items", post(add_item))
        .route("/checkout", post(checkout))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;

    fn item(quantity: i64) -> CartItem {
        CartItem {
            id: ObjectId::new().to_hex(),
            product_name: "Bread".into(),
            price: 40.0,
            unit: "pack".into(),
            quantity,
            shop_id: ObjectId::new().to_hex(),
        }
    }

    #[test]
    fn cart_entries_carry_the_caller() {
        let at = to_bson_datetime(Utc::now());
        let entry = cart_entry(&item(2), "abc", "user_1", at).unwrap();
        assert_eq!(entry.get_str("user_id").unwrap(), "abc");
        assert_eq!(entry.get_i64("quantity").unwrap(), 2);
    }

    #[test]
    fn bad_cart_items_are_rejected() {
        let at = to_bson_datetime(Utc::now());
        assert!(cart_entry(&item(0), "abc", "u", at).is_err());
        let mut bad_id = item(1);
        bad_id.id = "nope".into();
        assert!(cart_entry(&bad_id, "abc", "u", at).is_err());
    }
}
