use std::collections::{HashMap, HashSet};

use axum::{Router, extract::{Path, Query, State}, routing::{get, post, put}, Json, http::{HeaderMap, StatusCode}};
use chrono::Utc;
use futures::stream::TryStreamExt;
use mongodb::{bson::{doc, oid::ObjectId, Bson, Document}, Database};
use serde::Deserialize;
use tracing::{info, warn};

use crate::accounts::{load_user, user_oid};
use crate::error::{is_duplicate_key, ApiError};
use crate::geo;
use crate::models::{Role, PRODUCTS, PRODUCT_VIEWS, SHOPS, USERS};
use crate::routes::common::{
    ApiResult, data_response, data_response_with_status, document_id, get_bool, get_f64, get_string,
    now_datetime, parse_object_id, require_role, sanitize_text, to_bson_datetime,
};
use crate::routes::products::product_view;
use crate::routes::users::LocationRequest;
use crate::state::AppState;

pub const SEARCH_RADIUS_KM: f64 = 10.0;

#[derive(Deserialize)]
struct NewShopRequest {
    name: String,
    #[serde(default)]
    rating: f64,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    store: String,
}

#[derive(Deserialize)]
struct SearchQuery {
    product_name: String,
    user_lat: f64,
    user_lng: f64,
    #[serde(default)]
    in_stock: bool,
}

/// The shop owned by the given user, if any.
pub async fn find_owner_shop(db: &Database, owner_id: &str) -> Result<Option<Document>, ApiError>{
    Ok(db.collection::<Document>(SHOPS).find_one(doc! { "owner_id": owner_id }).await?)
}

pub async fn require_owner_shop(db: &Database, owner_id: &str) -> Result<Document, ApiError>{
    find_owner_shop(db, owner_id).await?.ok_or_else(|| ApiError::not_found("Shop not found"))
}

/// Case-insensitive substring match on the literal search text.
pub fn name_filter(product_name: &str) -> Document{
    doc! { "$regex": regex::escape(product_name.trim()), "$options": "i" }
}

fn search_hit(shop: &Document, products: &[Document], user: (f64, f64)) -> Option<(f64, Document)>{
    let (lat, lng) = geo::shop_coordinates(shop)?;
    let distance = geo::round_km(geo::haversine_km(user.0, user.1, lat, lng));
    let items: Vec<Bson> = products
        .iter()
        .map(|p| Bson::Document(doc! {
            "id": document_id(p).unwrap_or_default(),
            "name": get_string(p, "product_name").unwrap_or_default(),
            "price": get_f64(p, "price").unwrap_or(0.0),
            "unit": get_string(p, "unit").unwrap_or_default(),
            "inStock": get_bool(p, "inStock").unwrap_or(false),
        }))
        .collect();
    let hit = doc! {
        "id": document_id(shop).unwrap_or_default(),
        "name": get_string(shop, "name").unwrap_or_default(),
        "rating": get_f64(shop, "rating").unwrap_or(0.0),
        "store": get_string(shop, "store").unwrap_or_default(),
        "latitude": lat,
        "longitude": lng,
        "distance": distance,
        "products": items,
    };
    Some((distance, hit))
}

fn group_by_shop(products: Vec<Document>) -> HashMap<String, Vec<Document>>{
    let mut grouped: HashMap<String, Vec<Document>> = HashMap::new();
    for product in products {
        if let Some(shop_id) = get_string(&product, "shop_id") {
            grouped.entry(shop_id).or_default().push(product);
        }
    }
    grouped
}

fn shop_object_ids<'a>(ids: impl Iterator<Item = &'a String>) -> Vec<ObjectId>{
    ids.filter_map(|id| ObjectId::parse_str(id).ok()).collect()
}

async fn nearby_shops(db: &Database, ids: Vec<ObjectId>, lat: f64, lng: f64) -> Result<Vec<Document>, ApiError>{
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let shops = db.collection::<Document>(SHOPS)
        .find(doc! {
            "_id": { "$in": ids },
            "location": { "$nearSphere": {
                "$geometry": geo::geo_point(lat, lng),
                "$maxDistance": SEARCH_RADIUS_KM * 1000.0,
            } },
        })
        .await?
        .try_collect()
        .await?;
    Ok(shops)
}

async fn add_shop(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<NewShopRequest>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    let name = sanitize_text(&payload.name);
    if name.is_empty() {
        return Err(ApiError::validation("Shop name is required"));
    }
    if !(0.0..=5.0).contains(&payload.rating) {
        return Err(ApiError::validation("Rating must be between 0 and 5"));
    }
    let (lat, lng) = geo::validate_indian_coordinates(payload.latitude, payload.longitude)?;
    let owner = load_user(&state.db, &claims).await?;
    let owner_id = user_oid(&owner)?;

    if find_owner_shop(&state.db, &claims.sub).await?.is_some() {
        return Err(ApiError::validation("Shop already exists for this owner"));
    }

    let now = Utc::now();
    let inserted = state.db.collection::<Document>(SHOPS)
        .insert_one(doc! {
            "name": &name,
            "rating": payload.rating,
            "store": sanitize_text(&payload.store),
            "owner_id": &claims.sub,
            "latitude": lat,
            "longitude": lng,
            "location": geo::geo_point(lat, lng),
            "view_count": 0_i64,
            "sale_count": 0_i64,
            "created_at": to_bson_datetime(now),
        })
        .await
        .map_err(|e| if is_duplicate_key(&e) {
            ApiError::validation("Shop already exists for this owner")
        } else {
            e.into()
        })?;
    let shop_id = inserted.inserted_id.as_object_id().map(|id| id.to_hex()).unwrap_or_default();

    state.db.collection::<Document>(USERS)
        .update_one(doc! { "_id": owner_id }, doc! { "$set": { "onboarding_done": true } })
        .await?;
    let mut owner = owner;
    owner.insert("onboarding_done", true);

    info!(shop_id = %shop_id, owner = %claims.sub, "shop created");
    let token = state.tokens.issue_for_user(&owner, now)?;
    Ok(data_response_with_status(StatusCode::CREATED, Bson::Document(doc! {
        "shop_id": shop_id,
        "access_token": token,
        "token_type": "bearer",
    })))
}

async fn my_shop(State(state): State<AppState>, headers: HeaderMap) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    let shop = find_owner_shop(&state.db, &claims.sub).await?;
    let body = match shop.as_ref().and_then(document_id) {
        Some(shop_id) => doc! { "exists": true, "shop_id": shop_id },
        None => doc! { "exists": false, "shop_id": Bson::Null },
    };
    Ok(data_response(Bson::Document(body)))
}

async fn update_shop_location(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<LocationRequest>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    let (lat, lng) = geo::validate_indian_coordinates(payload.latitude, payload.longitude)?;
    let result = state.db.collection::<Document>(SHOPS)
        .update_one(
            doc! { "owner_id": &claims.sub },
            doc! { "$set": {
                "latitude": lat,
                "longitude": lng,
                "location": geo::geo_point(lat, lng),
                "last_updated": now_datetime(),
            } },
        )
        .await?;
    if result.matched_count == 0 {
        return Err(ApiError::not_found("Shop not found"));
    }
    Ok(data_response(Bson::Document(doc! { "latitude": lat, "longitude": lng })))
}

async fn update_owner_location(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<LocationRequest>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    let (lat, lng) = geo::validate_indian_coordinates(payload.latitude, payload.longitude)?;
    let result = state.db.collection::<Document>(SHOPS)
        .update_one(
            doc! { "owner_id": &claims.sub },
            doc! { "$set": { "owner_location": geo::geo_point(lat, lng), "last_updated": now_datetime() } },
        )
        .await?;
    if result.matched_count == 0 {
        return Err(ApiError::not_found("Shop not found"));
    }
    Ok(data_response(Bson::Document(doc! { "latitude": lat, "longitude": lng })))
}

async fn search_shops(State(state): State<AppState>, Query(query): Query<SearchQuery>) -> ApiResult{
    if query.product_name.trim().is_empty() {
        return Err(ApiError::validation("product_name is required"));
    }
    geo::validate_query_point(query.user_lat, query.user_lng)?;
    let products = state.db.collection::<Document>(PRODUCTS);

    let mut filter = doc! { "product_name": name_filter(&query.product_name), "count": { "$gt": 0 } };
    if query.in_stock {
        filter.insert("inStock", true);
    }
    let matches: Vec<Document> = products.find(filter).await?.try_collect().await?;
    let grouped = group_by_shop(matches);
    let shops = nearby_shops(&state.db, shop_object_ids(grouped.keys()), query.user_lat, query.user_lng).await?;

    let mut hits: Vec<(f64, Document)> = shops
        .iter()
        .filter_map(|shop| {
            let shop_products = grouped.get(&document_id(shop)?)?;
            search_hit(shop, shop_products, (query.user_lat, query.user_lng))
        })
        .collect();
    hits.sort_by(|a, b| a.0.total_cmp(&b.0));

    let sold_out: Vec<Document> = products
        .find(doc! { "product_name": name_filter(&query.product_name), "count": { "$lte": 0 } })
        .projection(doc! { "shop_id": 1, "product_name": 1 })
        .await?
        .try_collect()
        .await?;
    if !sold_out.is_empty() {
        let notifier = state.notifier.clone();
        let db = state.db.clone();
        let (lat, lng) = (query.user_lat, query.user_lng);
        tokio::spawn(async move {
            let grouped = group_by_shop(sold_out);
            let shops = match nearby_shops(&db, shop_object_ids(grouped.keys()), lat, lng).await {
                Ok(shops) => shops,
                Err(e) => {
                    warn!(error = %e, "missed-sale lookup failed");
                    return;
                }
            };
            for shop in shops {
                let Some(items) = document_id(&shop).and_then(|id| grouped.get(&id)) else {
                    continue;
                };
                let names: HashSet<String> = items.iter().filter_map(|p| get_string(p, "product_name")).collect();
                for name in names {
                    if let Err(e) = notifier.missed_sale_alert(&shop, &name).await {
                        warn!(error = %e, product = %name, "missed-sale alert failed");
                    }
                }
            }
        });
    }

    let body: Vec<Bson> = hits.into_iter().map(|(_, hit)| Bson::Document(hit)).collect();
    Ok(data_response(Bson::Array(body)))
}

async fn load_shop(db: &Database, id: &str) -> Result<(ObjectId, Document), ApiError>{
    let oid = parse_object_id(id)?;
    let shop = db.collection::<Document>(SHOPS)
        .find_one(doc! { "_id": oid })
        .await?
        .ok_or_else(|| ApiError::not_found("Shop not found"))?;
    Ok((oid, shop))
}

async fn get_shop(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult{
    let (oid, shop) = load_shop(&state.db, &id).await?;
    let now = Utc::now();
    let products: Vec<Document> = state.db.collection::<Document>(PRODUCTS)
        .find(doc! { "shop_id": oid.to_hex(), "count": { "$gt": 0 } })
        .await?
        .try_collect()
        .await?;
    let (lat, lng) = geo::shop_coordinates(&shop).unwrap_or_default();

    let mut body = doc! {
        "id": oid.to_hex(),
        "name": get_string(&shop, "name").unwrap_or_default(),
        "latitude": lat,
        "longitude": lng,
        "rating": get_f64(&shop, "rating").unwrap_or(0.0),
        "products": products.iter().map(|p| Bson::Document(product_view(p, now))).collect::<Vec<_>>(),
    };
    if let Ok(location) = shop.get_document("location") {
        body.insert("location", location.clone());
    }
    Ok(data_response(Bson::Document(body)))
}

async fn shop_coordinates(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult{
    let (_, shop) = load_shop(&state.db, &id).await?;
    let (lat, lng) = geo::shop_coordinates(&shop)
        .ok_or_else(|| ApiError::not_found("Shop has no coordinates"))?;
    Ok(data_response(Bson::Document(doc! { "latitude": lat, "longitude": lng })))
}

async fn record_view(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult{
    let oid = parse_object_id(&id)?;
    let result = state.db.collection::<Document>(SHOPS)
        .update_one(doc! { "_id": oid }, doc! { "$inc": { "view_count": 1_i64 } })
        .await?;
    if result.matched_count == 0 {
        return Err(ApiError::not_found("Shop not found"));
    }
    state.db.collection::<Document>(PRODUCT_VIEWS)
        .insert_one(doc! { "shop_id": oid, "timestamp": now_datetime(), "type": "view" })
        .await?;
    Ok(data_response_with_status(StatusCode::CREATED, Bson::Document(doc! { "ok": true })))
}

pub fn shops_router(state: AppState) -> Router{
    Router::new()
        .route("/", post(add_shop))
        .route("/mine", get(my_shop))
        .route("/mine/location", put(update_shop_location))
        .route("/mine/owner-location", put(update_owner_location))
        .route("/search", get(search_shops))
        .route("/{id}", get(get_shop))
        .route("/{id}/coordinates", get(shop_coordinates))
        .route("/{id}/views", post(record_view))
        .with_state(state)
}
