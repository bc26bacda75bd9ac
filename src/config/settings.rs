use std::env;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppSettings {
    pub app: AppConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub billing: BillingConfig,
    pub payment: PaymentConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub environment: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    /// Optional read replica used for authorization-decision reads only.
    pub read_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BillingConfig {
    pub free_uses_per_account: i64,
    pub paid_uses_per_purchase: i64,
    pub price_per_purchase_minor: i64,
    pub default_currency: String,
    pub request_deadline_seconds: u64,
    /// When set, write verification also asserts that `balance_minor` held
    /// its pre-transaction value. Deployment-configurable because the field
    /// is reserved for currency-denominated balances and unused today.
    pub enforce_balance_minor_invariant: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentConfig {
    pub provider: String,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
}

impl AppSettings {
    pub fn from_env() -> Result<Self, AppError> {
        // App config
        let app_name = env::var("APP_NAME").unwrap_or_else(|_| "billing-server".to_string());
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        // Server config
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .map_err(|_| {
                AppError::Configuration("SERVER_PORT must be a valid port number".to_string())
            })?;

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();

        // Database config
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::Configuration("DATABASE_URL must be set".to_string()))?;
        let database_read_url = env::var("DATABASE_READ_URL").ok();

        // Billing config
        let free_uses_per_account = parse_i64_var("FREE_USES_PER_ACCOUNT", 3)?;
        let paid_uses_per_purchase = parse_i64_var("PAID_USES_PER_PURCHASE", 50)?;
        let price_per_purchase_minor = parse_i64_var("PRICE_PER_PURCHASE_MINOR", 500)?;
        if free_uses_per_account < 0 {
            return Err(AppError::Configuration(
                "FREE_USES_PER_ACCOUNT must not be negative".to_string(),
            ));
        }
        if paid_uses_per_purchase <= 0 || price_per_purchase_minor <= 0 {
            return Err(AppError::Configuration(
                "PAID_USES_PER_PURCHASE and PRICE_PER_PURCHASE_MINOR must be positive".to_string(),
            ));
        }

        let default_currency = env::var("DEFAULT_CURRENCY").unwrap_or_else(|_| "USD".to_string());
        if default_currency.len() != 3 {
            return Err(AppError::Configuration(
                "DEFAULT_CURRENCY must be a three-letter code".to_string(),
            ));
        }

        let request_deadline_seconds = parse_u64_var("REQUEST_DEADLINE_SECONDS", 10)?;

        let enforce_balance_minor_invariant = env::var("BALANCE_MINOR_INVARIANT")
            .unwrap_or_else(|_| "true".to_string())
            .parse::<bool>()
            .map_err(|_| {
                AppError::Configuration("BALANCE_MINOR_INVARIANT must be true or false".to_string())
            })?;

        // Payment provider config
        let payment_provider =
            env::var("PAYMENT_PROVIDER").unwrap_or_else(|_| "stripe".to_string());
        let stripe_secret_key = env::var("STRIPE_SECRET_KEY").ok();
        let stripe_webhook_secret = env::var("STRIPE_WEBHOOK_SECRET").ok();

        Ok(Self {
            app: AppConfig {
                name: app_name,
                environment,
            },
            server: ServerConfig {
                host: server_host,
                port: server_port,
                cors_origins,
            },
            database: DatabaseConfig {
                url: database_url,
                read_url: database_read_url,
            },
            billing: BillingConfig {
                free_uses_per_account,
                paid_uses_per_purchase,
                price_per_purchase_minor,
                default_currency,
                request_deadline_seconds,
                enforce_balance_minor_invariant,
            },
            payment: PaymentConfig {
                provider: payment_provider,
                stripe_secret_key,
                stripe_webhook_secret,
            },
        })
    }
}

fn parse_i64_var(name: &str, default: i64) -> Result<i64, AppError> {
    match env::var(name) {
        Ok(value) => value
            .parse::<i64>()
            .map_err(|_| AppError::Configuration(format!("{} must be a valid number", name))),
        Err(_) => Ok(default),
    }
}

fn parse_u64_var(name: &str, default: u64) -> Result<u64, AppError> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map_err(|_| AppError::Configuration(format!("{} must be a valid number", name))),
        Err(_) => Ok(default),
    }
}

impl BillingConfig {
    pub fn purchase_hint(&self) -> crate::models::billing::PurchaseHint {
        crate::models::billing::PurchaseHint {
            price_minor: self.price_per_purchase_minor,
            uses: self.paid_uses_per_purchase,
        }
    }
}
