use chrono::NaiveTime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub uri: String,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct JwtConfig {
    pub secret: String,
    pub expiry_minutes: i64,
}

#[derive(Clone, Debug)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: String,
    pub webhook_secret: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub folder: String,
}

#[derive(Clone, Debug)]
pub struct SendgridConfig {
    pub api_key: String,
    pub sender: String,
}

#[derive(Clone, Debug)]
pub struct FcmConfig {
    pub project_id: String,
    pub service_account_path: String,
}

#[derive(Clone, Debug)]
pub struct ClassifierConfig {
    pub url: String,
    pub token: Option<String>,
    pub labels_path: String,
}

/// UTC wall-clock times for the daily notification jobs.
#[derive(Clone, Debug)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub customer_essentials: NaiveTime,
    pub owner_morning: NaiveTime,
    pub subscription_reminders: NaiveTime,
    pub customer_deals: NaiveTime,
    pub owner_evening: NaiveTime,
    pub owner_night: NaiveTime,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub razorpay: Option<RazorpayConfig>,
    pub cloudinary: Option<CloudinaryConfig>,
    pub sendgrid: Option<SendgridConfig>,
    pub google_client_id: Option<String>,
    pub fcm: Option<FcmConfig>,
    pub classifier: Option<ClassifierConfig>,
    pub schedule: ScheduleConfig,
}

pub fn parse_time(name: &'static str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|e| ConfigError::Invalid {
        name,
        reason: format!("expected HH:MM ({e})"),
    })
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = get("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = match get("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|e| ConfigError::Invalid { name: "PORT", reason: e.to_string() })?,
            None => 8000,
        };
        let cors_origins = get("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();

        let uri = get("MONGO_URI").ok_or(ConfigError::Missing("MONGO_URI"))?;
        let name = get("DB_NAME").unwrap_or_else(|| "project_av".to_string());

        let secret = get("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        if secret.len() < 16 {
            return Err(ConfigError::Invalid { name: "JWT_SECRET", reason: "must be at least 16 characters".into() });
        }
        let expiry_minutes = match get("JWT_EXPIRY_MINUTES") {
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|m| *m > 0)
                .ok_or_else(|| ConfigError::Invalid { name: "JWT_EXPIRY_MINUTES", reason: "expected a positive integer".into() })?,
            None => 1440,
        };

        let razorpay = match (get("RAZORPAY_KEY_ID"), get("RAZORPAY_KEY_SECRET")) {
            (Some(key_id), Some(key_secret)) => Some(RazorpayConfig {
                key_id,
                key_secret,
                webhook_secret: get("RAZORPAY_WEBHOOK_SECRET"),
            }),
            _ => None,
        };

        let cloudinary = match (get("CLOUDINARY_CLOUD_NAME"), get("CLOUDINARY_API_KEY"), get("CLOUDINARY_API_SECRET")) {
            (Some(cloud_name), Some(api_key), Some(api_secret)) => Some(CloudinaryConfig {
                cloud_name,
                api_key,
                api_secret,
                folder: get("CLOUDINARY_FOLDER").unwrap_or_else(|| "project_av_products".to_string()),
            }),
            _ => None,
        };

        let sendgrid = match (get("SENDGRID_API_KEY"), get("SENDER_EMAIL")) {
            (Some(api_key), Some(sender)) => Some(SendgridConfig { api_key, sender }),
            _ => None,
        };

        let fcm = match (get("FCM_PROJECT_ID"), get("FCM_SERVICE_ACCOUNT_PATH")) {
            (Some(project_id), Some(service_account_path)) => Some(FcmConfig { project_id, service_account_path }),
            _ => None,
        };

        let classifier = get("CLASSIFIER_URL").map(|url| ClassifierConfig {
            url,
            token: get("CLASSIFIER_TOKEN"),
            labels_path: get("PRODUCT_LABELS_PATH").unwrap_or_else(|| "product_labels.csv".to_string()),
        });

        let time = |key: &'static str, default: &str| -> Result<NaiveTime, ConfigError> {
            parse_time(key, &get(key).unwrap_or_else(|| default.to_string()))
        };
        let schedule = ScheduleConfig {
            enabled: get("SCHEDULER_ENABLED").map(|v| v != "false" && v != "0").unwrap_or(true),
            customer_essentials: time("SCHEDULE_CUSTOMER_ESSENTIALS", "02:00")?,
            owner_morning: time("SCHEDULE_OWNER_MORNING", "03:00")?,
            subscription_reminders: time("SCHEDULE_SUBSCRIPTION_REMINDERS", "04:00")?,
            customer_deals: time("SCHEDULE_CUSTOMER_DEALS", "06:30")?,
            owner_evening: time("SCHEDULE_OWNER_EVENING", "13:30")?,
            owner_night: time("SCHEDULE_OWNER_NIGHT", "16:30")?,
        };

        Ok(Self {
            server: ServerConfig { host, port, cors_origins },
            database: DatabaseConfig { uri, name },
            jwt: JwtConfig { secret, expiry_minutes },
            razorpay,
            cloudinary,
            sendgrid,
            google_client_id: get("GOOGLE_CLIENT_ID"),
            fcm,
            classifier,
            schedule,
        })
    }
}
