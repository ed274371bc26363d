use axum::{Router, extract::State, routing::{get, put}, Json, http::HeaderMap};
use mongodb::{bson::{doc, Bson, Document}, options::ReturnDocument};
use serde::Deserialize;

use crate::accounts::{load_user, user_oid};
use crate::error::ApiError;
use crate::geo;
use crate::models::{Role, USERS};
use crate::routes::common::{ApiResult, data_response, document_id, get_bool, get_i64, get_string, now_datetime, require_role};
use crate::state::AppState;

const PROFILE_FIELD_MAX: usize = 50;

#[derive(Deserialize)]
struct ProfileUpdate {
    #[serde(rename = "fullName")]
    full_name: String,
    #[serde(default)]
    city: String,
}

#[derive(Deserialize)]
pub struct LocationRequest {
    pub latitude: f64,
    pub longitude: f64,
}

fn profile_document(user: &Document) -> Document{
    doc! {
        "id": document_id(user).unwrap_or_default(),
        "email": get_string(user, "email").unwrap_or_default(),
        "fullName": get_string(user, "fullName").unwrap_or_default(),
        "city": get_string(user, "city").unwrap_or_default(),
        "role": get_string(user, "role").unwrap_or_else(|| Role::Customer.as_str().to_string()),
        "referral_code": get_string(user, "referral_code").unwrap_or_default(),
        "referral_count": get_i64(user, "referral_count").unwrap_or(0),
        "referral_earnings": get_i64(user, "referral_earnings").unwrap_or(0),
        "coins": get_i64(user, "coins").unwrap_or(0),
        "onboarding_done": get_bool(user, "onboarding_done").unwrap_or(false),
        "hasEnteredReferral": get_bool(user, "hasEnteredReferral").unwrap_or(false),
        "uid": get_string(user, "uid").or_else(|| get_string(user, "email")).unwrap_or_default(),
    }
}

/// Trimmed name and city, both bounded; the name may not be blank.
pub fn validate_profile(full_name: &str, city: &str) -> Result<(String, String), ApiError>{
    let name = full_name.trim();
    let city = city.trim();
    if name.is_empty() {
        return Err(ApiError::validation("Full name cannot be empty"));
    }
    if name.chars().count() > PROFILE_FIELD_MAX || city.chars().count() > PROFILE_FIELD_MAX {
        return Err(ApiError::validation("Name and city must be at most 50 characters"));
    }
    Ok((name.to_string(), city.to_string()))
}

async fn get_profile(State(state): State<AppState>, headers: HeaderMap) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    let user = load_user(&state.db, &claims).await?;
    Ok(data_response(Bson::Document(profile_document(&user))))
}

async fn update_profile(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<ProfileUpdate>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    let (name, city) = validate_profile(&payload.full_name, &payload.city)?;
    let user = load_user(&state.db, &claims).await?;

    let updated = state.db.collection::<Document>(USERS)
        .find_one_and_update(
            doc! { "_id": user_oid(&user)? },
            doc! { "$set": { "fullName": name, "city": city, "updated_at": now_datetime() } },
        )
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(data_response(Bson::Document(profile_document(&updated))))
}

async fn update_location(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<LocationRequest>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    let (lat, lng) = geo::validate_indian_coordinates(payload.latitude, payload.longitude)?;
    let user = load_user(&state.db, &claims).await?;

    state.db.collection::<Document>(USERS)
        .update_one(
            doc! { "_id": user_oid(&user)? },
            doc! { "$set": {
                "latitude": lat,
                "longitude": lng,
                "location": geo::geo_point(lat, lng),
                "location_updated_at": now_datetime(),
            } },
        )
        .await?;
    Ok(data_response(Bson::Document(doc! { "latitude": lat, "longitude": lng })))
}

pub fn users_router(state: AppState) -> Router{
    Router::new()
        .route("/me", get(get_profile).patch(update_profile))
        .route("/me/location", put(update_location))
        .with_state(state)
}
