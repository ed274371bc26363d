//! Router tests against a live MongoDB. Set `AV_TEST_MONGO_URI` to run them;
//! each test works in its own throwaway database.

mod support;

use axum::{http::StatusCode, Router};
use chrono::{Duration, Utc};
use mongodb::bson::{doc, oid::ObjectId, Document};
use mongodb::Database;
use serde_json::json;
use tower::util::ServiceExt; // for `oneshot`

use av_server::app;
use av_server::config::AppConfig;
use av_server::db;
use av_server::integrations::razorpay::sign_hex;
use av_server::models::{CART, PAYMENTS, PRODUCTS, PRODUCT_SALES, PRODUCT_VIEWS, REWARDS, SHOPS, USERS};
use av_server::routes::common::to_bson_datetime;
use av_server::state::AppState;

use support::{get_request, json_request, read_json, token_for_user, webhook_request, KEY_SECRET, WEBHOOK_SECRET};

struct Store {
    app: Router,
    db: Database,
    config: AppConfig,
}

impl Store {
    async fn open() -> Option<Store> {
        let Ok(uri) = std::env::var("AV_TEST_MONGO_URI") else {
            eprintln!("AV_TEST_MONGO_URI not set; skipping");
            return None;
        };
        let name = format!("av_test_{}", ObjectId::new().to_hex());
        let config = support::config(&uri, &name);
        let database = db::connect(&config.database).await.unwrap();
        db::ensure_indexes(&database).await.unwrap();
        let app = app(AppState::new(database.clone(), support::config(&uri, &name), support::integrations(true)));
        Some(Store { app, db: database, config })
    }

    async fn close(self) {
        self.db.drop().await.unwrap();
    }

    fn token(&self, user: &Document) -> String {
        token_for_user(&self.config, user)
    }

    async fn insert_user(&self, role: &str, extra: Document) -> Document {
        let id = ObjectId::new();
        let mut user = doc! {
            "_id": id,
            "email": format!("{}@example.com", id.to_hex()),
            "uid": id.to_hex(),
            "fullName": "Test User",
            "role": role,
            "is_verified": true,
            "coins": 0_i64,
            "referral_count": 0_i64,
            "referral_earnings": 0_i64,
            "referral_code": id.to_hex()[18..].to_uppercase(),
            "hasEnteredReferral": false,
            "fcm_tokens": [],
            "created_at": to_bson_datetime(Utc::now()),
        };
        user.extend(extra);
        self.db.collection::<Document>(USERS).insert_one(user.clone()).await.unwrap();
        user
    }

    async fn insert_shop(&self, owner: &Document) -> ObjectId {
        let id = ObjectId::new();
        self.db
            .collection::<Document>(SHOPS)
            .insert_one(doc! {
                "_id": id,
                "name": "Corner Store",
                "owner_id": owner.get_object_id("_id").unwrap().to_hex(),
                "latitude": 12.97,
                "longitude": 77.59,
                "location": { "type": "Point", "coordinates": [77.59, 12.97] },
            })
            .await
            .unwrap();
        id
    }

    async fn insert_product(&self, owner: &Document, shop_id: ObjectId, count: i64) -> ObjectId {
        let id = ObjectId::new();
        self.db
            .collection::<Document>(PRODUCTS)
            .insert_one(doc! {
                "_id": id,
                "product_name": "Amul Milk",
                "price": 30.0,
                "unit": "500 ml",
                "owner_id": owner.get_object_id("_id").unwrap().to_hex(),
                "shop_id": shop_id.to_hex(),
                "count": count,
                "inStock": true,
                "sale_count": 0_i64,
            })
            .await
            .unwrap();
        id
    }

    async fn user(&self, id: ObjectId) -> Document {
        self.db.collection::<Document>(USERS).find_one(doc! { "_id": id }).await.unwrap().unwrap()
    }

    async fn count(&self, collection: &str, filter: Document) -> u64 {
        self.db.collection::<Document>(collection).count_documents(filter).await.unwrap()
    }
}

#[tokio::test]
async fn referral_code_can_only_be_applied_once() {
    let Some(store) = Store::open().await else { return };
    let referrer = store.insert_user("customer", doc! { "referral_code": "REF123" }).await;
    let customer = store.insert_user("customer", doc! {}).await;
    let token = store.token(&customer);

    let resp = store.app.clone()
        .oneshot(json_request("POST", "/referral/apply", Some(&token), json!({ "referral_code": "ref123" })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(read_json(resp).await["data"]["updated_coins"], 25);

    let resp = store.app.clone()
        .oneshot(json_request("POST", "/referral/apply", Some(&token), json!({ "referral_code": "REF123" })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(resp).await["message"], "Referral already used");

    let referrer = store.user(referrer.get_object_id("_id").unwrap()).await;
    assert_eq!(referrer.get_i64("referral_count").unwrap(), 1);
    assert_eq!(referrer.get_i64("coins").unwrap(), 25);
    let customer_id = customer.get_object_id("_id").unwrap();
    assert_eq!(store.user(customer_id).await.get_i64("coins").unwrap(), 25);
    assert_eq!(store.count(REWARDS, doc! { "user_id": customer_id.to_hex() }).await, 1);
    store.close().await;
}

#[tokio::test]
async fn stock_is_reserved_once_and_checkout_leaves_it_alone() {
    let Some(store) = Store::open().await else { return };
    let owner = store.insert_user("owner", doc! {}).await;
    let shop_id = store.insert_shop(&owner).await;
    let product_id = store.insert_product(&owner, shop_id, 1).await;
    let customer = store.insert_user("customer", doc! {}).await;
    let token = store.token(&customer);
    let add = json!({ "product_id": product_id.to_hex() });

    let resp = store.app.clone().oneshot(json_request("POST", "/cart/items", Some(&token), add.clone())).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = store.app.clone().oneshot(json_request("POST", "/cart/items", Some(&token), add)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(resp).await["message"], "Product is out of stock.");

    let items = json!({ "items": [{
        "id": product_id.to_hex(),
        "product_name": "Amul Milk",
        "price": 30.0,
        "unit": "500 ml",
        "quantity": 1,
        "shop_id": shop_id.to_hex(),
    }] });
    let resp = store.app.clone().oneshot(json_request("POST", "/cart/checkout", Some(&token), items)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(read_json(resp).await["data"]["updated_coins"], 3);

    let product = store.db.collection::<Document>(PRODUCTS).find_one(doc! { "_id": product_id }).await.unwrap().unwrap();
    assert_eq!(product.get_i64("count").unwrap(), 0);
    assert_eq!(product.get_i64("sale_count").unwrap(), 1);
    assert_eq!(store.count(PRODUCT_SALES, doc! { "product_id": product_id }).await, 1);
    assert_eq!(store.count(CART, doc! {}).await, 1);
    store.close().await;
}

async fn customer_with_expiring_coins(store: &Store) -> Document {
    let customer = store.insert_user("customer", doc! { "coins": 900_i64 }).await;
    let user_id = customer.get_object_id("_id").unwrap().to_hex();
    let now = Utc::now();
    store.db
        .collection::<Document>(REWARDS)
        .insert_many(vec![
            doc! { "user_id": &user_id, "coins": 450_i64, "type": "purchase", "created_at": to_bson_datetime(now - Duration::days(120)) },
            doc! { "user_id": &user_id, "coins": 450_i64, "type": "purchase", "created_at": to_bson_datetime(now - Duration::days(1)) },
        ])
        .await
        .unwrap();
    customer
}

#[tokio::test]
async fn redeeming_spends_active_coins_only() {
    let Some(store) = Store::open().await else { return };
    let customer = customer_with_expiring_coins(&store).await;
    let customer_id = customer.get_object_id("_id").unwrap();
    let token = store.token(&customer);

    let resp = store.app.clone().oneshot(json_request("POST", "/subscription/redeem", Some(&token), json!({}))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = read_json(resp).await;
    assert_eq!(body["data"]["coins_used"], 450);
    assert_eq!(body["data"]["updated_coins"], 450);
    assert_eq!(store.count(REWARDS, doc! { "user_id": customer_id.to_hex(), "coins": -450_i64, "type": "subscription" }).await, 1);

    let resp = store.app.clone().oneshot(json_request("POST", "/subscription/redeem", Some(&token), json!({}))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(resp).await["message"], "Not enough coins");

    let user = store.user(customer_id).await;
    assert_eq!(user.get_i64("coins").unwrap(), 450);
    assert_eq!(user.get_str("last_payment_method").unwrap(), "coins");
    assert!(!user.contains_key("redeeming_until"));
    store.close().await;
}

#[tokio::test]
async fn concurrent_redemptions_debit_once() {
    let Some(store) = Store::open().await else { return };
    let customer = customer_with_expiring_coins(&store).await;
    let customer_id = customer.get_object_id("_id").unwrap();
    let token = store.token(&customer);

    let (first, second) = tokio::join!(
        store.app.clone().oneshot(json_request("POST", "/subscription/redeem", Some(&token), json!({}))),
        store.app.clone().oneshot(json_request("POST", "/subscription/redeem", Some(&token), json!({}))),
    );
    let statuses = [first.unwrap().status(), second.unwrap().status()];
    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::OK).count(), 1);

    assert_eq!(store.user(customer_id).await.get_i64("coins").unwrap(), 450);
    assert_eq!(store.count(REWARDS, doc! { "user_id": customer_id.to_hex(), "type": "subscription" }).await, 1);
    store.close().await;
}

fn captured_event(payment_id: &str, order_id: &str) -> serde_json::Value {
    json!({
        "event": "payment.captured",
        "payload": { "payment": { "entity": { "id": payment_id, "order_id": order_id, "amount": 9900 } } },
    })
}

#[tokio::test]
async fn client_verification_after_webhook_still_renews() {
    let Some(store) = Store::open().await else { return };
    let customer = store.insert_user("customer", doc! {}).await;
    let customer_id = customer.get_object_id("_id").unwrap();
    let token = store.token(&customer);

    let event = captured_event("pay_1", "order_1");
    let resp = store.app.clone()
        .oneshot(webhook_request(&event, &sign_hex(WEBHOOK_SECRET, event.to_string().as_bytes())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let verify = json!({
        "order_id": "order_1",
        "payment_id": "pay_1",
        "signature": sign_hex(KEY_SECRET, b"order_1|pay_1"),
        "amount": 99.0,
    });
    let resp = store.app.clone().oneshot(json_request("POST", "/payments/verify", Some(&token), verify.clone())).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let user = store.user(customer_id).await;
    assert_eq!(user.get_str("last_payment_method").unwrap(), "razorpay");
    assert!(user.get_datetime("next_payment_date").is_ok());

    let payment = store.db.collection::<Document>(PAYMENTS).find_one(doc! { "payment_id": "pay_1" }).await.unwrap().unwrap();
    assert_eq!(payment.get_str("status").unwrap(), "captured");
    assert!(payment.get_bool("client_verified").unwrap());
    assert_eq!(store.count(PAYMENTS, doc! { "payment_id": "pay_1" }).await, 1);

    let resp = store.app.clone().oneshot(json_request("POST", "/payments/verify", Some(&token), verify)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(read_json(resp).await["message"], "Payment already processed");
    store.close().await;
}

#[tokio::test]
async fn coin_purchase_after_webhook_credits_once() {
    let Some(store) = Store::open().await else { return };
    let customer = store.insert_user("customer", doc! {}).await;
    let customer_id = customer.get_object_id("_id").unwrap();
    let token = store.token(&customer);

    let event = captured_event("pay_2", "order_2");
    store.app.clone()
        .oneshot(webhook_request(&event, &sign_hex(WEBHOOK_SECRET, event.to_string().as_bytes())))
        .await
        .unwrap();

    let purchase = json!({
        "razorpay_order_id": "order_2",
        "razorpay_payment_id": "pay_2",
        "razorpay_signature": sign_hex(KEY_SECRET, b"order_2|pay_2"),
        "coins_to_add": 100,
        "amount_paid": 99,
    });
    let resp = store.app.clone().oneshot(json_request("POST", "/payments/coin-purchases/verify", Some(&token), purchase.clone())).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(read_json(resp).await["data"]["updated_coins"], 100);

    let resp = store.app.clone().oneshot(json_request("POST", "/payments/coin-purchases/verify", Some(&token), purchase)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(store.user(customer_id).await.get_i64("coins").unwrap(), 100);
    assert_eq!(store.count(REWARDS, doc! { "user_id": customer_id.to_hex(), "type": "purchase" }).await, 1);
    store.close().await;
}

#[tokio::test]
async fn performance_fills_days_without_events() {
    let Some(store) = Store::open().await else { return };
    let owner = store.insert_user("owner", doc! {}).await;
    let shop_id = store.insert_shop(&owner).await;
    let product_id = store.insert_product(&owner, shop_id, 5).await;
    let now = Utc::now();
    store.db
        .collection::<Document>(PRODUCT_SALES)
        .insert_one(doc! { "product_id": product_id, "shop_id": shop_id, "quantity": 2_i64, "timestamp": to_bson_datetime(now) })
        .await
        .unwrap();
    store.db
        .collection::<Document>(PRODUCT_VIEWS)
        .insert_one(doc! { "product_id": product_id, "shop_id": shop_id, "timestamp": to_bson_datetime(now - Duration::days(1)) })
        .await
        .unwrap();

    let resp = store.app.clone().oneshot(get_request("/owner/performance?days=3", &store.token(&owner))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let rows = read_json(resp).await["data"].as_array().unwrap().clone();
    assert_eq!(rows.len(), 3);
    assert_eq!((rows[0]["sales"].clone(), rows[0]["views"].clone()), (json!(0), json!(0)));
    assert_eq!((rows[1]["sales"].clone(), rows[1]["views"].clone()), (json!(0), json!(1)));
    assert_eq!((rows[2]["sales"].clone(), rows[2]["views"].clone()), (json!(2), json!(0)));
    assert_eq!(rows[2]["date"], now.format("%Y-%m-%d").to_string());
    store.close().await;
}

#[tokio::test]
async fn owner_gets_a_single_shop_under_concurrent_creates() {
    let Some(store) = Store::open().await else { return };
    let owner = store.insert_user("owner", doc! {}).await;
    let token = store.token(&owner);
    let shop = json!({ "name": "Corner Store", "rating": 4.0, "latitude": 12.97, "longitude": 77.59, "store": "grocery" });

    let (first, second) = tokio::join!(
        store.app.clone().oneshot(json_request("POST", "/shops", Some(&token), shop.clone())),
        store.app.clone().oneshot(json_request("POST", "/shops", Some(&token), shop)),
    );
    let mut statuses = vec![first.unwrap().status(), second.unwrap().status()];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::CREATED, StatusCode::BAD_REQUEST]);
    assert_eq!(store.count(SHOPS, doc! {}).await, 1);
    store.close().await;
}

#[tokio::test]
async fn product_views_are_counted_for_the_shop() {
    let Some(store) = Store::open().await else { return };
    let owner = store.insert_user("owner", doc! {}).await;
    let shop_id = store.insert_shop(&owner).await;
    let product_id = store.insert_product(&owner, shop_id, 5).await;

    let uri = format!("/products/{}/views", product_id.to_hex());
    let resp = store.app.clone().oneshot(json_request("POST", &uri, None, json!({}))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(store.count(PRODUCT_VIEWS, doc! { "product_id": product_id, "shop_id": shop_id }).await, 1);

    let missing = format!("/products/{}/views", ObjectId::new().to_hex());
    let resp = store.app.clone().oneshot(json_request("POST", &missing, None, json!({}))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = store.app.clone().oneshot(get_request("/owner/dashboard", &store.token(&owner))).await.unwrap();
    assert_eq!(read_json(resp).await["data"]["todayViews"], 1);
    store.close().await;
}

#[tokio::test]
async fn racing_signups_for_one_email_never_fail_with_server_error() {
    let Some(store) = Store::open().await else { return };
    let signup = json!({ "email": "asha@example.com", "fullName": "Asha", "city": "Pune", "password": "secret1", "role": "customer" });

    let (first, second) = tokio::join!(
        store.app.clone().oneshot(json_request("POST", "/auth/signup", None, signup.clone())),
        store.app.clone().oneshot(json_request("POST", "/auth/signup", None, signup)),
    );
    for resp in [first.unwrap(), second.unwrap()] {
        assert!(matches!(resp.status(), StatusCode::CREATED | StatusCode::BAD_REQUEST), "{}", resp.status());
    }
    assert_eq!(store.count(USERS, doc! { "email": "asha@example.com" }).await, 1);
    store.close().await;
}
