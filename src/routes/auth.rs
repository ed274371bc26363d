use axum::{Router, extract::State, routing::{get, post}, Json, http::HeaderMap};
use axum::http::StatusCode;
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{DateTime, Duration, Utc};
use mongodb::{bson::{doc, Bson, Document}, options::ReturnDocument};
use rand::Rng;
use serde::Deserialize;
use tracing::{info, warn};

use crate::accounts::{load_user, load_user_by_id};
use crate::billing;
use crate::error::{is_duplicate_key, ApiError};
use crate::integrations::IntegrationError;
use crate::models::{Role, USERS};
use crate::routes::common::{ApiResult, auth_claims, data_response, data_response_with_status, get_bool, get_datetime, get_string, to_bson_datetime, token_response};
use crate::state::AppState;

const OTP_TTL_MINUTES: i64 = 10;
const REFERRAL_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Deserialize)]
struct SignupRequest {
    email: String,
    #[serde(rename = "fullName")]
    full_name: String,
    #[serde(default)]
    city: String,
    password: String,
    role: String,
}

#[derive(Deserialize)]
struct VerifyOtpRequest {
    email: String,
    otp: String,
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct GoogleLoginRequest {
    id_token: String,
    role: String,
}

#[derive(Deserialize)]
struct RefreshRequest {
    token: String,
}

pub fn generate_otp<R: Rng + ?Sized>(rng: &mut R) -> String{
    format!("{:06}", rng.gen_range(0..1_000_000))
}

pub fn generate_referral_code<R: Rng + ?Sized>(rng: &mut R) -> String{
    (0..6)
        .map(|_| REFERRAL_ALPHABET[rng.gen_range(0..REFERRAL_ALPHABET.len())] as char)
        .collect()
}

pub fn uid_from_email(email: &str) -> String{
    email.trim().to_lowercase().replace(' ', "_")
}

pub fn normalize_email(raw: &str) -> Result<String, ApiError>{
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.'),
        None => false,
    };
    if !valid || email.contains(char::is_whitespace) {
        return Err(ApiError::validation("A valid email address is required"));
    }
    Ok(email)
}

fn parse_role(raw: &str) -> Result<Role, ApiError>{
    Role::parse(raw).ok_or_else(|| ApiError::validation("Role must be 'customer' or 'owner'"))
}

/// Fresh account with zeroed counters.
pub fn new_user_document(email: &str, full_name: &str, city: &str, role: Role, referral_code: &str, now: DateTime<Utc>) -> Document{
    doc! {
        "email": email,
        "fullName": full_name,
        "city": city,
        "role": role.as_str(),
        "uid": uid_from_email(email),
        "referral_code": referral_code,
        "referral_count": 0_i64,
        "referral_earnings": 0_i64,
        "coins": 0_i64,
        "is_verified": false,
        "onboarding_done": false,
        "hasEnteredReferral": false,
        "fcm_tokens": [],
        "created_at": to_bson_datetime(now),
    }
}

async fn hash_password(password: String) -> Result<String, ApiError>{
    tokio::task::spawn_blocking(move || hash(password, DEFAULT_COST))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
}

async fn password_matches(password: String, stored: String) -> Result<bool, ApiError>{
    tokio::task::spawn_blocking(move || verify(password, &stored).unwrap_or(false))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// A concurrent signup may win the unique email index between lookup and insert.
fn email_taken(err: mongodb::error::Error) -> ApiError{
    if is_duplicate_key(&err) {
        ApiError::validation("Email already registered")
    } else {
        err.into()
    }
}

async fn unique_referral_code(state: &AppState) -> Result<String, ApiError>{
    let users = state.db.collection::<Document>(USERS);
    for _ in 0..8 {
        let code = generate_referral_code(&mut rand::thread_rng());
        if users.find_one(doc! { "referral_code": &code }).await?.is_none() {
            return Ok(code);
        }
    }
    Err(ApiError::Internal("could not allocate a unique referral code".into()))
}

async fn signup(State(state): State<AppState>, Json(payload): Json<SignupRequest>) -> ApiResult{
    let email = normalize_email(&payload.email)?;
    let full_name = payload.full_name.trim().to_string();
    if full_name.is_empty() {
        return Err(ApiError::validation("Full name is required"));
    }
    if payload.password.chars().count() < 6 {
        return Err(ApiError::validation("Password must be at least 6 characters"));
    }
    let role = parse_role(&payload.role)?;

    let users = state.db.collection::<Document>(USERS);
    let existing = users.find_one(doc! { "email": &email }).await?;
    if existing.as_ref().and_then(|u| get_bool(u, "is_verified")).unwrap_or(false) {
        return Err(ApiError::validation("Email already registered"));
    }

    let otp = generate_otp(&mut rand::thread_rng());
    let now = Utc::now();
    let otp_expiry = to_bson_datetime(now + Duration::minutes(OTP_TTL_MINUTES));
    let password_hash = hash_password(payload.password).await?;
    let city = payload.city.trim().to_string();

    match existing {
        Some(user) => {
            users.update_one(
                doc! { "_id": user.get_object_id("_id").map_err(|_| ApiError::Internal("user without _id".into()))? },
                doc! { "$set": {
                    "password": password_hash,
                    "fullName": &full_name,
                    "city": &city,
                    "role": role.as_str(),
                    "otp": &otp,
                    "otp_expiry": otp_expiry,
                } },
            ).await?;
        }
        None => {
            let referral_code = unique_referral_code(&state).await?;
            let mut user = new_user_document(&email, &full_name, &city, role, &referral_code, now);
            user.insert("password", password_hash);
            user.insert("otp", &otp);
            user.insert("otp_expiry", otp_expiry);
            users.insert_one(user).await.map_err(email_taken)?;
        }
    }

    let mailer = state.mailer.clone();
    let to = email.clone();
    tokio::spawn(async move {
        if let Err(e) = mailer.send_otp(&to, &otp).await {
            warn!(error = %e, to = %to, "failed to send verification email");
        }
    });

    info!(email = %email, role = role.as_str(), "signup started");
    Ok(data_response_with_status(StatusCode::CREATED, Bson::Document(doc! { "message": "OTP has been sent to your email." })))
}

async fn verify_otp(State(state): State<AppState>, Json(payload): Json<VerifyOtpRequest>) -> ApiResult{
    let email = normalize_email(&payload.email)?;
    let users = state.db.collection::<Document>(USERS);
    let user = users.find_one(doc! { "email": &email })
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    if get_bool(&user, "is_verified").unwrap_or(false) {
        return Err(ApiError::validation("User already verified"));
    }
    let now = Utc::now();
    match get_datetime(&user, "otp_expiry") {
        Some(expiry) if now <= expiry => {}
        _ => return Err(ApiError::validation("OTP has expired")),
    }
    if get_string(&user, "otp").as_deref() != Some(payload.otp.trim()) {
        return Err(ApiError::validation("Invalid OTP"));
    }

    let verified = users.find_one_and_update(
        doc! { "_id": user.get_object_id("_id").map_err(|_| ApiError::Internal("user without _id".into()))? },
        doc! {
            "$set": {
                "is_verified": true,
                "next_payment_date": to_bson_datetime(billing::trial_end(now)),
                "subscription_active": true,
            },
            "$unset": { "otp": "", "otp_expiry": "" },
        },
    )
    .return_document(ReturnDocument::After)
    .await?
    .ok_or_else(|| ApiError::not_found("User not found"))?;

    info!(email = %email, "email verified");
    Ok(token_response(state.tokens.issue_for_user(&verified, now)?))
}

async fn login(State(state): State<AppState>, Json(payload): Json<LoginRequest>) -> ApiResult{
    let email = payload.email.trim().to_lowercase();
    let user = state.db.collection::<Document>(USERS)
        .find_one(doc! { "email": &email })
        .await?;

    let Some(user_doc) = user else {
        return Err(ApiError::Unauthorized("Invalid credentials".into()));
    };
    let Some(stored) = get_string(&user_doc, "password") else {
        return Err(ApiError::Unauthorized("Invalid credentials".into()));
    };
    if !password_matches(payload.password, stored).await? {
        return Err(ApiError::Unauthorized("Invalid credentials".into()));
    }
    if !get_bool(&user_doc, "is_verified").unwrap_or(false) {
        return Err(ApiError::Forbidden("Please verify your email first".into()));
    }

    Ok(token_response(state.tokens.issue_for_user(&user_doc, Utc::now())?))
}

async fn google_login(State(state): State<AppState>, Json(payload): Json<GoogleLoginRequest>) -> ApiResult{
    let role = parse_role(&payload.role)?;
    let identity = state.identity.verify_id_token(&payload.id_token).await.map_err(|e| match e {
        IntegrationError::InvalidInput(msg) => ApiError::Unauthorized(msg),
        other => ApiError::from(other),
    })?;
    let email = identity.email.trim().to_lowercase();

    let users = state.db.collection::<Document>(USERS);
    let now = Utc::now();
    let user = match users.find_one(doc! { "email": &email }).await? {
        Some(existing) => {
            let existing_role = get_string(&existing, "role").unwrap_or_default();
            if existing_role != role.as_str() {
                return Err(ApiError::Forbidden(format!("This email is registered as a {existing_role}")));
            }
            existing
        }
        None => {
            let referral_code = unique_referral_code(&state).await?;
            let name = identity.name.unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_string());
            let mut user = new_user_document(&email, &name, "", role, &referral_code, now);
            user.insert("is_verified", true);
            user.insert("next_payment_date", to_bson_datetime(billing::trial_end(now)));
            user.insert("subscription_active", true);
            let inserted = users.insert_one(user.clone()).await.map_err(email_taken)?;
            user.insert("_id", inserted.inserted_id);
            info!(email = %email, role = role.as_str(), "account created via Google");
            user
        }
    };

    Ok(token_response(state.tokens.issue_for_user(&user, now)?))
}

async fn verify_token(State(state): State<AppState>, headers: HeaderMap) -> ApiResult{
    let claims = auth_claims(&state, &headers)?;
    let user = load_user(&state.db, &claims).await?;
    Ok(data_response(Bson::Document(doc! {
        "role": get_string(&user, "role").unwrap_or_default(),
        "onboardingDone": get_bool(&user, "onboarding_done").unwrap_or(false),
        "uid": get_string(&user, "uid").unwrap_or_default(),
        "hasEnteredReferral": get_bool(&user, "hasEnteredReferral").unwrap_or(false),
    })))
}

async fn refresh_token(State(state): State<AppState>, Json(payload): Json<RefreshRequest>) -> ApiResult{
    let claims = state.tokens.decode(&payload.token)?;
    let user = load_user_by_id(&state.db, &claims.sub).await?;
    Ok(token_response(state.tokens.issue_for_user(&user, Utc::now())?))
}

/// Re-issues the caller's token from current account state.
async fn issue_session(State(state): State<AppState>, headers: HeaderMap) -> ApiResult{
    let claims = auth_claims(&state, &headers)?;
    let user = load_user(&state.db, &claims).await?;
    Ok(token_response(state.tokens.issue_for_user(&user, Utc::now())?))
}

pub fn auth_router(state: AppState) -> Router{
    Router::new()
        .route("/signup", post(signup))
        .route("/verify-otp", post(verify_otp))
        .route("/login", post(login))
        .route("/google", post(google_login))
        .route("/verify", get(verify_token))
        .route("/refresh", post(refresh_token))
        .route("/session", post(issue_session))
        .with_state(state)
}
