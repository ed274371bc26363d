use axum::Router;

use crate::state::AppState;

// api routes all import here
pub mod auth;
pub mod cart;
pub mod common;
pub mod health;
pub mod owner;
pub mod payments;
pub mod products;
pub mod push;
pub mod referral;
pub mod rewards;
pub mod shops;
pub mod subscription;
pub mod users;

pub fn api_router(state: AppState) -> Router{
    // every module owns one path prefix
    Router::new()
    .merge(health::health_router(state.clone()))
    .nest("/auth", auth::auth_router(state.clone()))
    .nest("/referral", referral::referral_router(state.clone()))
    .nest("/users", users::users_router(state.clone()))
    .nest("/push", push::push_router(state.clone()))
    .nest("/shops", shops::shops_router(state.clone()))
    .nest("/products", products::products_router(state.clone()))
    .nest("/cart", cart::cart_router(state.clone()))
    .nest("/owner", owner::owner_router(state.clone()))
    .nest("/rewards", rewards::rewards_router(state.clone()))
    .nest("/subscription", subscription::subscription_router(state.clone()))
    .nest("/payments", payments::payments_router(state))
}
