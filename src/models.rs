use serde::{Deserialize, Serialize};

pub const USERS: &str = "users";
pub const SHOPS: &str = "shops";
pub const PRODUCTS: &str = "products";
pub const CART: &str = "cart";
pub const REWARDS: &str = "rewards";
pub const REFERRAL_TRANSACTIONS: &str = "referral_transactions";
pub const PAYMENTS: &str = "payments";
pub const PRODUCT_VIEWS: &str = "product_views";
pub const PRODUCT_SALES: &str = "product_sales";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Owner => "owner",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "customer" => Some(Role::Customer),
            "owner" => Some(Role::Owner),
            _ => None,
        }
    }
}

/// Line item submitted at checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub id: String,
    pub product_name: String,
    pub price: f64,
    pub unit: String,
    pub quantity: i64,
    pub shop_id: String,
}
