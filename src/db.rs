use mongodb::{
    bson::doc,
    options::{ClientOptions, IndexOptions},
    Client, Database, IndexModel,
};

use crate::config::DatabaseConfig;
use crate::models::{PAYMENTS, PRODUCTS, PRODUCT_SALES, PRODUCT_VIEWS, REWARDS, SHOPS, USERS};

/// Builds the client without waiting for a server; the driver connects on first use.
pub async fn connect(config: &DatabaseConfig) -> mongodb::error::Result<Database> {
    let mut options = ClientOptions::parse(&config.uri).await?;
    options.app_name = Some("av_server".to_string());
    let client = Client::with_options(options)?;
    Ok(client.database(&config.name))
}

pub async fn ping(db: &Database) -> bool {
    db.run_command(doc! { "ping": 1 }).await.is_ok()
}

pub async fn ensure_indexes(db: &Database) -> mongodb::error::Result<()> {
    let unique = || IndexOptions::builder().unique(true).build();

    db.collection::<mongodb::bson::Document>(USERS)
        .create_indexes(vec![
            IndexModel::builder().keys(doc! { "email": 1 }).options(unique()).build(),
            IndexModel::builder().keys(doc! { "referral_code": 1 }).build(),
            IndexModel::builder().keys(doc! { "location": "2dsphere" }).build(),
        ])
        .await?;

    db.collection::<mongodb::bson::Document>(SHOPS)
        .create_indexes(vec![
            IndexModel::builder().keys(doc! { "location": "2dsphere" }).build(),
            IndexModel::builder().keys(doc! { "owner_id": 1 }).options(unique()).build(),
        ])
        .await?;

    db.collection::<mongodb::bson::Document>(PRODUCTS)
        .create_indexes(vec![
            IndexModel::builder().keys(doc! { "owner_id": 1 }).build(),
            IndexModel::builder().keys(doc! { "shop_id": 1 }).build(),
        ])
        .await?;

    db.collection::<mongodb::bson::Document>(REWARDS)
        .create_index(IndexModel::builder().keys(doc! { "user_id": 1, "created_at": -1 }).build())
        .await?;

    db.collection::<mongodb::bson::Document>(PAYMENTS)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "payment_id": 1 })
                .options(IndexOptions::builder().unique(true).sparse(true).build())
                .build(),
        )
        .await?;

    db.collection::<mongodb::bson::Document>(PRODUCT_VIEWS)
        .create_indexes(vec![
            IndexModel::builder().keys(doc! { "shop_id": 1, "timestamp": -1 }).build(),
            IndexModel::builder().keys(doc! { "product_id": 1 }).build(),
        ])
        .await?;

    db.collection::<mongodb::bson::Document>(PRODUCT_SALES)
        .create_indexes(vec![
            IndexModel::builder().keys(doc! { "shop_id": 1, "timestamp": -1 }).build(),
            IndexModel::builder().keys(doc! { "product_id": 1 }).build(),
        ])
        .await?;

    tracing::info!("database indexes ensured");
    Ok(())
}
