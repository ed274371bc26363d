use axum::{Json, http::{StatusCode, HeaderMap}, response::{IntoResponse, Response}};
use chrono::{DateTime, TimeZone, Utc};
use mongodb::bson::{doc, oid::ObjectId, Bson, Document, DateTime as BsonDateTime};

use crate::error::ApiError;
use crate::models::Role;
use crate::state::AppState;
use crate::tokens::Claims;

pub type ApiResult = Result<Response, ApiError>;

pub fn data_response(value: Bson) -> Response{
    Json(doc! { "data": value }).into_response()
}

pub fn data_response_with_status(status: StatusCode, value: Bson) -> Response{
    (status, Json(doc! { "data": value })).into_response()
}

pub fn token_response(token: String) -> Response{
    data_response(Bson::Document(doc! { "access_token": token, "token_type": "bearer" }))
}

pub fn get_string(doc: &Document, key: &str) -> Option<String>{
    doc.get(key).and_then(Bson::as_str).map(|s| s.to_string())
}

pub fn get_bool(doc: &Document, key: &str) -> Option<bool>{
    doc.get(key).and_then(Bson::as_bool)
}

pub fn get_f64(doc: &Document, key: &str) -> Option<f64>{
    match doc.get(key) {
        Some(Bson::Double(v)) => Some(*v),
        Some(Bson::Int32(v)) => Some(*v as f64),
        Some(Bson::Int64(v)) => Some(*v as f64),
        Some(Bson::String(s)) => s.parse::<f64>().ok(),
        _ => None,
    }
}

pub fn get_i64(doc: &Document, key: &str) -> Option<i64>{
    match doc.get(key) {
        Some(Bson::Int32(v)) => Some(*v as i64),
        Some(Bson::Int64(v)) => Some(*v),
        Some(Bson::Double(v)) => Some(v.round() as i64),
        _ => None,
    }
}

/// Accepts BSON datetimes and RFC 3339 strings.
pub fn get_datetime(doc: &Document, key: &str) -> Option<DateTime<Utc>>{
    match doc.get(key) {
        Some(Bson::DateTime(dt)) => Utc.timestamp_millis_opt(dt.timestamp_millis()).single(),
        Some(Bson::String(s)) => DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc)),
        _ => None,
    }
}

pub fn document_id(doc: &Document) -> Option<String>{
    match doc.get_object_id("_id") {
        Ok(oid) => Some(oid.to_hex()),
        Err(_) => get_string(doc, "id"),
    }
}

pub fn parse_object_id(raw: &str) -> Result<ObjectId, ApiError>{
    ObjectId::parse_str(raw.trim()).map_err(|_| ApiError::validation("Invalid ID format"))
}

pub fn to_bson_datetime(dt: DateTime<Utc>) -> BsonDateTime{
    BsonDateTime::from_millis(dt.timestamp_millis())
}

pub fn now_datetime() -> BsonDateTime{
    to_bson_datetime(Utc::now())
}

pub fn iso_from_bson(value: &Bson) -> Option<String>{
    match value {
        Bson::DateTime(dt) => dt.try_to_rfc3339_string().ok(),
        Bson::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Strips everything but word characters, whitespace and `.,-`.
pub fn sanitize_text(raw: &str) -> String{
    raw.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || matches!(c, '_' | '.' | ',' | '-'))
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String>{
    let header = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(|s| s.trim().to_string())
}

pub fn auth_claims(state: &AppState, headers: &HeaderMap) -> Result<Claims, ApiError>{
    let token = bearer_token(headers).ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;
    state.tokens.decode(&token)
}

pub fn require_role(state: &AppState, headers: &HeaderMap, allowed_roles: &[Role]) -> Result<Claims, ApiError>{
    let claims = auth_claims(state, headers)?;
    if allowed_roles.contains(&claims.role) {
        Ok(claims)
    } else {
        Err(ApiError::Forbidden("forbidden".into()))
    }
}

pub fn clamp_limit(limit: Option<i64>, default: i64) -> i64{
    limit.unwrap_or(default).clamp(1, 50)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_words_and_basic_punctuation() {
        assert_eq!(sanitize_text("  Amul <b>Milk</b> 1.5L, full-cream! "), "Amul bMilkb 1.5L, full-cream");
    }

    #[test]
    fn datetime_reads_bson_and_rfc3339() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let doc = doc! { "a": to_bson_datetime(now), "b": "2024-03-01T10:00:00Z", "c": 5 };
        assert_eq!(get_datetime(&doc, "a"), Some(now));
        assert_eq!(get_datetime(&doc, "b"), Some(now));
        assert_eq!(get_datetime(&doc, "c"), None);
    }

    #[test]
    fn numeric_getters_accept_mixed_widths() {
        let doc = doc! { "i": 3_i32, "l": 4_i64, "d": 2.6 };
        assert_eq!(get_i64(&doc, "i"), Some(3));
        assert_eq!(get_i64(&doc, "d"), Some(3));
        assert_eq!(get_f64(&doc, "l"), Some(4.0));
    }

    #[test]
    fn document_id_prefers_object_id() {
        let oid = ObjectId::new();
        assert_eq!(document_id(&doc! { "_id": oid, "id": "other" }), Some(oid.to_hex()));
        assert_eq!(document_id(&doc! { "id": "legacy" }), Some("legacy".to_string()));
    }

    #[test]
    fn bearer_token_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def"));
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(clamp_limit(None, 10), 10);
        assert_eq!(clamp_limit(Some(0), 10), 1);
        assert_eq!(clamp_limit(Some(500), 10), 50);
    }
}
