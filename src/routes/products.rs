use std::collections::HashMap;

use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    routing::{get, patch, post, put},
    Json,
    http::{HeaderMap, StatusCode},
};
use chrono::{DateTime, Duration, Utc};
use futures::stream::TryStreamExt;
use mongodb::{bson::{doc, oid::ObjectId, Bson, Document}, options::ReturnDocument, Database};
use serde::Deserialize;
use tracing::info;

use crate::error::ApiError;
use crate::geo;
use crate::integrations::classifier::{self, MAX_IMAGE_BYTES};
use crate::models::{Role, PRODUCTS, PRODUCT_VIEWS, SHOPS};
use crate::routes::common::{
    ApiResult, clamp_limit, data_response, data_response_with_status, document_id, get_bool, get_datetime,
    get_f64, get_i64, get_string, now_datetime, parse_object_id, require_role, sanitize_text, to_bson_datetime,
};
use crate::routes::shops::require_owner_shop;
use crate::state::AppState;

const DISCOVERY_RADIUS_M: f64 = 5000.0;
const DEALS_RADIUS_M: f64 = 20000.0;
const UPLOAD_BODY_LIMIT: usize = MAX_IMAGE_BYTES + 1024 * 1024;

const TAGLINES: [&str; 8] = [
    "Cheaper than before!",
    "Lowest price nearby!",
    "Price Drop Alert!",
    "Unbeatable Value!",
    "Super Saver Deal!",
    "Less price than others!",
    "Market Best Rate!",
    "Huge Savings Today!",
];

#[derive(Deserialize)]
struct ProductPatch {
    product_name: Option<String>,
    price: Option<f64>,
    unit: Option<String>,
    #[serde(rename = "inStock")]
    in_stock: Option<bool>,
    count: Option<i64>,
    category: Option<String>,
}

#[derive(Deserialize)]
struct BulkStockRequest {
    in_stock: bool,
}

#[derive(Deserialize)]
struct PromotionRequest {
    #[serde(rename = "salePrice")]
    sale_price: f64,
    #[serde(rename = "saleDescription", default)]
    sale_description: String,
    #[serde(rename = "durationDays")]
    duration_days: i64,
}

#[derive(Deserialize)]
struct NearbyQuery {
    user_lat: f64,
    user_lng: f64,
    limit: Option<i64>,
    skip: Option<i64>,
}

#[derive(Default)]
struct UploadForm {
    fields: HashMap<String, String>,
    file: Option<(Vec<u8>, String)>,
}

/// Whole days left on a sale, rounded up; zero once it has ended.
pub fn sale_days_left(end: DateTime<Utc>, now: DateTime<Utc>) -> i64{
    let seconds = (end - now).num_seconds();
    if seconds <= 0 {
        0
    } else {
        (seconds + 86_399) / 86_400
    }
}

pub fn tagline(product_name: &str, index: usize) -> &'static str{
    TAGLINES[(product_name.chars().count() + index) % TAGLINES.len()]
}

/// Client-facing shape of a stored product.
pub fn product_view(product: &Document, now: DateTime<Utc>) -> Document{
    let mut view = doc! {
        "id": document_id(product).unwrap_or_default(),
        "product_name": get_string(product, "product_name").unwrap_or_default(),
        "price": get_f64(product, "price").unwrap_or(0.0),
        "unit": get_string(product, "unit").unwrap_or_default(),
        "count": get_i64(product, "count").unwrap_or(0),
        "category": get_string(product, "category").unwrap_or_default(),
        "imageUrl": get_string(product, "imageUrl").unwrap_or_default(),
        "inStock": get_bool(product, "inStock").unwrap_or(false),
        "sale_count": get_i64(product, "sale_count").unwrap_or(0),
        "shop_id": get_string(product, "shop_id").unwrap_or_default(),
    };
    let on_sale = get_bool(product, "isOnSale").unwrap_or(false);
    view.insert("isOnSale", on_sale);
    if on_sale {
        view.insert("salePrice", get_f64(product, "salePrice").unwrap_or(0.0));
        view.insert("saleDescription", get_string(product, "saleDescription").unwrap_or_default());
        if let Some(end) = get_datetime(product, "saleEndDate") {
            view.insert("saleEndDate", end.to_rfc3339());
            view.insert("saleDaysLeft", sale_days_left(end, now));
        }
    }
    view
}

/// Builds the `$set` for a partial update; `None` when the patch is empty.
fn patch_document(patch: ProductPatch, now: DateTime<Utc>) -> Result<Option<Document>, ApiError>{
    let mut set = Document::new();
    if let Some(name) = patch.product_name {
        let name = sanitize_text(&name);
        if name.is_empty() {
            return Err(ApiError::validation("Product name cannot be empty"));
        }
        set.insert("product_name", name);
    }
    if let Some(price) = patch.price {
        if !price.is_finite() || price < 0.0 {
            return Err(ApiError::validation("Price must be zero or more"));
        }
        set.insert("price", price);
    }
    if let Some(unit) = patch.unit {
        set.insert("unit", unit.trim());
    }
    if let Some(in_stock) = patch.in_stock {
        set.insert("inStock", in_stock);
        set.insert("lastUpdated", to_bson_datetime(now));
    }
    if let Some(count) = patch.count {
        if count < 0 {
            return Err(ApiError::validation("Count must be zero or more"));
        }
        set.insert("count", count);
    }
    if let Some(category) = patch.category {
        set.insert("category", sanitize_text(&category));
    }
    Ok((!set.is_empty()).then_some(set))
}

async fn read_upload(mut multipart: Multipart) -> Result<UploadForm, ApiError>{
    let invalid = |e: axum::extract::multipart::MultipartError| ApiError::validation(format!("Invalid form data: {e}"));
    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let content_type = field.content_type().unwrap_or("application/octet-stream").to_string();
            let bytes = field.bytes().await.map_err(invalid)?;
            form.file = Some((bytes.to_vec(), content_type));
        } else {
            let value = field.text().await.map_err(invalid)?;
            form.fields.insert(name, value);
        }
    }
    Ok(form)
}

fn required_field<'a>(form: &'a UploadForm, name: &str) -> Result<&'a str, ApiError>{
    form.fields
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::validation(format!("{name} is required")))
}

fn parsed_field<T: std::str::FromStr>(form: &UploadForm, name: &str) -> Result<T, ApiError>{
    required_field(form, name)?
        .parse::<T>()
        .map_err(|_| ApiError::validation(format!("{name} is not a valid number")))
}

async fn owned_product(db: &Database, owner_id: &str, id: &str) -> Result<ObjectId, ApiError>{
    let oid = parse_object_id(id)?;
    let product = db.collection::<Document>(PRODUCTS)
        .find_one(doc! { "_id": oid })
        .projection(doc! { "owner_id": 1 })
        .await?
        .ok_or_else(|| ApiError::not_found("Product not found"))?;
    if get_string(&product, "owner_id").as_deref() != Some(owner_id) {
        return Err(ApiError::Forbidden("Not your product".into()));
    }
    Ok(oid)
}

async fn add_product(State(state): State<AppState>, headers: HeaderMap, multipart: Multipart) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    let form = read_upload(multipart).await?;

    let name = sanitize_text(required_field(&form, "product_name")?);
    if name.is_empty() {
        return Err(ApiError::validation("product_name is required"));
    }
    let price: f64 = parsed_field(&form, "price")?;
    let count: i64 = parsed_field(&form, "count")?;
    if !price.is_finite() || price < 0.0 || count < 0 {
        return Err(ApiError::validation("Price and count must be zero or more"));
    }
    let unit = required_field(&form, "unit")?.to_string();
    let category = form.fields.get("category").map(|c| sanitize_text(c)).unwrap_or_default();
    let (bytes, content_type) = form.file
        .ok_or_else(|| ApiError::validation("file is required"))?;
    if !content_type.starts_with("image/") {
        return Err(ApiError::validation("Only image uploads are accepted"));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ApiError::validation("Image exceeds the 5 MB limit"));
    }

    let shop = require_owner_shop(&state.db, &claims.sub).await?;
    let image = state.images.upload(bytes, &content_type).await?;

    let now = Utc::now();
    let mut product = doc! {
        "product_name": &name,
        "price": price,
        "unit": unit,
        "owner_id": &claims.sub,
        "shop_id": document_id(&shop).unwrap_or_default(),
        "count": count,
        "category": category,
        "imageUrl": &image.url,
        "image_public_id": &image.public_id,
        "inStock": true,
        "sale_count": 0_i64,
        "created_at": to_bson_datetime(now),
    };
    let inserted = state.db.collection::<Document>(PRODUCTS).insert_one(&product).await?;
    product.insert("_id", inserted.inserted_id);

    info!(owner = %claims.sub, product = %name, "product added");
    Ok(data_response_with_status(StatusCode::CREATED, Bson::Document(product_view(&product, now))))
}

async fn my_products(State(state): State<AppState>, headers: HeaderMap) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    let now = Utc::now();
    let products: Vec<Document> = state.db.collection::<Document>(PRODUCTS)
        .find(doc! { "owner_id": &claims.sub })
        .sort(doc! { "created_at": -1 })
        .await?
        .try_collect()
        .await?;
    let body: Vec<Bson> = products.iter().map(|p| Bson::Document(product_view(p, now))).collect();
    Ok(data_response(Bson::Array(body)))
}

async fn update_product(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<ProductPatch>,
) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    let now = Utc::now();
    let set = patch_document(payload, now)?.ok_or_else(|| ApiError::validation("No update data provided"))?;
    let oid = owned_product(&state.db, &claims.sub, &id).await?;
    let updated = state.db.collection::<Document>(PRODUCTS)
        .find_one_and_update(doc! { "_id": oid }, doc! { "$set": set })
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| ApiError::not_found("Product not found"))?;
    Ok(data_response(Bson::Document(product_view(&updated, now))))
}

async fn delete_product(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    let oid = owned_product(&state.db, &claims.sub, &id).await?;
    state.db.collection::<Document>(PRODUCTS).delete_one(doc! { "_id": oid }).await?;
    info!(owner = %claims.sub, product_id = %oid, "product deleted");
    Ok(data_response(Bson::Document(doc! { "deleted": true })))
}

async fn bulk_stock(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<BulkStockRequest>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    let result = state.db.collection::<Document>(PRODUCTS)
        .update_many(
            doc! { "owner_id": &claims.sub },
            doc! { "$set": { "inStock": payload.in_stock, "lastUpdated": now_datetime() } },
        )
        .await?;
    Ok(data_response(Bson::Document(doc! { "updated": result.modified_count as i64 })))
}

async fn set_promotion(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<PromotionRequest>,
) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    if payload.duration_days < 1 {
        return Err(ApiError::validation("durationDays must be at least 1"));
    }
    if !payload.sale_price.is_finite() || payload.sale_price < 0.0 {
        return Err(ApiError::validation("salePrice must be zero or more"));
    }
    let oid = owned_product(&state.db, &claims.sub, &id).await?;
    let now = Utc::now();
    let end = now + Duration::days(payload.duration_days);
    let updated = state.db.collection::<Document>(PRODUCTS)
        .find_one_and_update(
            doc! { "_id": oid },
            doc! { "$set": {
                "isOnSale": true,
                "salePrice": payload.sale_price,
                "saleDescription": sanitize_text(&payload.sale_description),
                "saleEndDate": to_bson_datetime(end),
            } },
        )
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| ApiError::not_found("Product not found"))?;
    Ok(data_response(Bson::Document(product_view(&updated, now))))
}

async fn clear_promotion(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    let oid = owned_product(&state.db, &claims.sub, &id).await?;
    let updated = state.db.collection::<Document>(PRODUCTS)
        .find_one_and_update(
            doc! { "_id": oid },
            doc! { "$unset": { "isOnSale": "", "salePrice": "", "saleDescription": "", "saleEndDate": "" } },
        )
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| ApiError::not_found("Product not found"))?;
    Ok(data_response(Bson::Document(product_view(&updated, Utc::now()))))
}

/// Shops within the discovery radius joined with their in-stock, full-price products.
fn nearby_offers_pipeline(lat: f64, lng: f64) -> Vec<Document>{
    vec![
        doc! { "$geoNear": {
            "near": geo::geo_point(lat, lng),
            "distanceField": "distance_m",
            "maxDistance": DISCOVERY_RADIUS_M,
            "spherical": true,
        } },
        doc! { "$lookup": {
            "from": PRODUCTS,
            "let": { "shop_id_str": { "$toString": "$_id" } },
            "pipeline": [ { "$match": { "$expr": { "$eq": ["$shop_id", "$$shop_id_str"] } } } ],
            "as": "product",
        } },
        doc! { "$unwind": "$product" },
        doc! { "$match": { "product.inStock": true, "product.isOnSale": { "$ne": true } } },
    ]
}

fn offer_view(row: &Document) -> Document{
    let product = row.get_document("product").cloned().unwrap_or_default();
    doc! {
        "id": document_id(&product).unwrap_or_default(),
        "product_name": get_string(&product, "product_name").unwrap_or_default(),
        "price": get_f64(&product, "price").unwrap_or(0.0),
        "unit": get_string(&product, "unit").unwrap_or_default(),
        "imageUrl": get_string(&product, "imageUrl").unwrap_or_default(),
        "shop_id": document_id(row).unwrap_or_default(),
        "shop_name": get_string(row, "name").unwrap_or_default(),
        "distance": geo::round_km(get_f64(row, "distance_m").unwrap_or(0.0) / 1000.0),
        "sold_count": get_i64(&product, "sale_count").unwrap_or(0),
    }
}

fn page(query: &NearbyQuery) -> (i64, i64){
    (query.skip.unwrap_or(0).max(0), clamp_limit(query.limit, 10))
}

async fn trending(State(state): State<AppState>, Query(query): Query<NearbyQuery>) -> ApiResult{
    geo::validate_query_point(query.user_lat, query.user_lng)?;
    let (skip, limit) = page(&query);
    let mut pipeline = nearby_offers_pipeline(query.user_lat, query.user_lng);
    pipeline.extend([
        doc! { "$sort": { "product.sale_count": -1, "distance_m": 1 } },
        doc! { "$skip": skip },
        doc! { "$limit": limit },
    ]);
    let rows: Vec<Document> = state.db.collection::<Document>(SHOPS).aggregate(pipeline).await?.try_collect().await?;
    let body: Vec<Bson> = rows.iter().map(|r| Bson::Document(offer_view(r))).collect();
    Ok(data_response(Bson::Array(body)))
}

async fn best_price(State(state): State<AppState>, Query(query): Query<NearbyQuery>) -> ApiResult{
    geo::validate_query_point(query.user_lat, query.user_lng)?;
    let (skip, limit) = page(&query);
    let mut pipeline = nearby_offers_pipeline(query.user_lat, query.user_lng);
    pipeline.extend([
        doc! { "$sort": { "product.sale_count": -1, "product.price": 1 } },
        doc! { "$group": { "_id": "$product.product_name", "best": { "$first": "$$ROOT" } } },
        doc! { "$replaceRoot": { "newRoot": "$best" } },
        doc! { "$sort": { "distance_m": 1 } },
        doc! { "$skip": skip },
        doc! { "$limit": limit },
    ]);
    let rows: Vec<Document> = state.db.collection::<Document>(SHOPS).aggregate(pipeline).await?.try_collect().await?;
    let body: Vec<Bson> = rows
        .iter()
        .enumerate()
        .map(|(index, row)| {
            let mut offer = offer_view(row);
            let line = tagline(offer.get_str("product_name").unwrap_or_default(), index);
            offer.insert("marketing_tagline", line);
            Bson::Document(offer)
        })
        .collect();
    Ok(data_response(Bson::Array(body)))
}

async fn deals(State(state): State<AppState>, Query(query): Query<NearbyQuery>) -> ApiResult{
    geo::validate_query_point(query.user_lat, query.user_lng)?;
    let limit = clamp_limit(query.limit, 10);
    let shops: Vec<Document> = state.db.collection::<Document>(SHOPS)
        .find(doc! { "location": { "$nearSphere": {
            "$geometry": geo::geo_point(query.user_lat, query.user_lng),
            "$maxDistance": DEALS_RADIUS_M,
        } } })
        .projection(doc! { "name": 1, "latitude": 1, "longitude": 1, "location": 1 })
        .await?
        .try_collect()
        .await?;
    let by_id: HashMap<String, &Document> = shops.iter().filter_map(|s| Some((document_id(s)?, s))).collect();
    if by_id.is_empty() {
        return Ok(data_response(Bson::Array(Vec::new())));
    }

    let now = Utc::now();
    let ids: Vec<String> = by_id.keys().cloned().collect();
    let products: Vec<Document> = state.db.collection::<Document>(PRODUCTS)
        .find(doc! {
            "shop_id": { "$in": ids },
            "isOnSale": true,
            "saleEndDate": { "$gte": to_bson_datetime(now) },
        })
        .sort(doc! { "created_at": -1 })
        .limit(limit)
        .await?
        .try_collect()
        .await?;

    let body: Vec<Bson> = products
        .iter()
        .filter_map(|product| {
            let shop = by_id.get(&get_string(product, "shop_id")?)?;
            let mut deal = product_view(product, now);
            deal.insert("shop_name", get_string(shop, "name").unwrap_or_default());
            if let Some((lat, lng)) = geo::shop_coordinates(shop) {
                deal.insert("shop_latitude", lat);
                deal.insert("shop_longitude", lng);
                deal.insert("distance", geo::round_km(geo::haversine_km(query.user_lat, query.user_lng, lat, lng)));
            }
            Some(Bson::Document(deal))
        })
        .collect();
    Ok(data_response(Bson::Array(body)))
}

async fn availability_request(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer])?;
    let oid = parse_object_id(&id)?;
    let product = state.db.collection::<Document>(PRODUCTS)
        .find_one(doc! { "_id": oid })
        .await?
        .ok_or_else(|| ApiError::not_found("Product not found"))?;
    let owner_id = get_string(&product, "owner_id")
        .and_then(|id| ObjectId::parse_str(id).ok())
        .ok_or_else(|| ApiError::not_found("Product has no owner"))?;

    let name = get_string(&product, "product_name").unwrap_or_default();
    let image_url = get_string(&product, "imageUrl").unwrap_or_default();
    let notifier = state.notifier.clone();
    let product_id = oid.to_hex();
    tokio::spawn(async move {
        notifier.availability_request(&owner_id, &product_id, &name, &image_url).await;
    });

    info!(customer = %claims.sub, product_id = %oid, "availability request queued");
    Ok(data_response_with_status(StatusCode::ACCEPTED, Bson::Document(doc! { "requested": true })))
}

async fn predict(State(state): State<AppState>, multipart: Multipart) -> ApiResult{
    let form = read_upload(multipart).await?;
    let (bytes, content_type) = form.file.ok_or_else(|| ApiError::validation("file is required"))?;
    classifier::validate_image(&bytes, &content_type)?;
    let product_name = state.classifier.classify(&bytes, &content_type).await?;
    Ok(data_response(Bson::Document(doc! { "product_name": product_name })))
}

/// View event for a product, attributed to its shop when the product has one.
pub fn product_view_event(product_id: ObjectId, shop_id: Option<ObjectId>, at: DateTime<Utc>) -> Document{
    let mut event = doc! { "product_id": product_id, "timestamp": to_bson_datetime(at), "type": "product_view" };
    if let Some(shop_id) = shop_id {
        event.insert("shop_id", shop_id);
    }
    event
}

async fn record_product_view(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult{
    let oid = parse_object_id(&id)?;
    let product = state.db.collection::<Document>(PRODUCTS)
        .find_one_and_update(doc! { "_id": oid }, doc! { "$inc": { "view_count": 1_i64 } })
        .await?
        .ok_or_else(|| ApiError::not_found("Product not found"))?;
    let shop_id = get_string(&product, "shop_id").and_then(|id| ObjectId::parse_str(&id).ok());

    state.db.collection::<Document>(PRODUCT_VIEWS)
        .insert_one(product_view_event(oid, shop_id, Utc::now()))
        .await?;
    Ok(data_response_with_status(StatusCode::CREATED, Bson::Document(doc! { "ok": true })))
}

pub fn products_router(state: AppState) -> Router{
    Router::new()
        .route("/", post(add_product))
        .route("/mine", get(my_products))
        .route("/bulk-stock", post(bulk_stock))
        .route("/trending", get(trending))
        .route("/best-price", get(best_price))
        .route("/deals", get(deals))
        .route("/predict", post(predict))
        .route("/{id}", patch(update_product).delete(delete_product))
        .route("/{id}/promotion", put(set_promotion).delete(clear_promotion))
        .route("/{id}/availability-request", post(availability_request))
        .route("/{id}/views", post(record_product_view))
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn product_views_carry_the_shop_when_known() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let (product, shop) = (ObjectId::new(), ObjectId::new());
        let event = product_view_event(product, Some(shop), at);
        assert_eq!(event.get_object_id("product_id").unwrap(), product);
        assert_eq!(event.get_object_id("shop_id").unwrap(), shop);
        assert!(!product_view_event(product, None, at).contains_key("shop_id"));
    }

    #[test]
    fn sale_days_round_up_and_floor_at_zero() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(sale_days_left(now + Duration::hours(1), now), 1);
        assert_eq!(sale_days_left(now + Duration::days(2), now), 2);
        assert_eq!(sale_days_left(now + Duration::days(2) + Duration::minutes(1), now), 3);
        assert_eq!(sale_days_left(now - Duration::days(1), now), 0);
    }

    #[test]
    fn taglines_rotate_with_name_length_and_position() {
        assert_eq!(tagline("Milk", 0), TAGLINES[4]);
        assert_eq!(tagline("Milk", 5), TAGLINES[1]);
        assert_eq!(tagline("", 8), TAGLINES[0]);
    }

    #[test]
    fn product_view_includes_sale_fields_only_on_sale() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let regular = product_view(&doc! { "product_name": "Rice", "price": 50, "count": 3 }, now);
        assert!(!regular.get_bool("isOnSale").unwrap());
        assert!(regular.get("salePrice").is_none());

        let sale = product_view(&doc! {
            "product_name": "Rice",
            "isOnSale": true,
            "salePrice": 40.0,
            "saleEndDate": to_bson_datetime(now + Duration::days(3)),
        }, now);
        assert_eq!(sale.get_f64("salePrice").unwrap(), 40.0);
        assert_eq!(sale.get_i64("saleDaysLeft").unwrap(), 3);
    }

    #[test]
    fn empty_patch_is_reported() {
        let now = Utc::now();
        let empty = ProductPatch { product_name: None, price: None, unit: None, in_stock: None, count: None, category: None };
        assert!(patch_document(empty, now).unwrap().is_none());

        let stock = ProductPatch { product_name: None, price: None, unit: None, in_stock: Some(false), count: Some(4), category: None };
        let set = patch_document(stock, now).unwrap().unwrap();
        assert!(!set.get_bool("inStock").unwrap());
        assert!(set.contains_key("lastUpdated"));
        assert_eq!(set.get_i64("count").unwrap(), 4);
    }

    #[test]
    fn invalid_patch_values_are_rejected() {
        let now = Utc::now();
        let negative = ProductPatch { product_name: None, price: Some(-1.0), unit: None, in_stock: None, count: None, category: None };
        assert!(patch_document(negative, now).is_err());
        let blank = ProductPatch { product_name: Some("<>".into()), price: None, unit: None, in_stock: None, count: None, category: None };
        assert!(patch_document(blank, now).is_err());
    }

    #[test]
    fn offer_view_flattens_joined_rows() {
        let row = doc! {
            "_id": ObjectId::new(),
            "name": "Fresh Mart",
            "distance_m": 1234.0,
            "product": { "_id": ObjectId::new(), "product_name": "Eggs", "price": 6.5, "sale_count": 12 },
        };
        let offer = offer_view(&row);
        assert_eq!(offer.get_str("shop_name").unwrap(), "Fresh Mart");
        assert_eq!(offer.get_i64("sold_count").unwrap(), 12);
        assert!((offer.get_f64("distance").unwrap() - 1.23).abs() < 0.01);
    }
}
