use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::AppSettings;
use crate::error::AppError;
use crate::models::enums::PaymentStatus;
use crate::models::identity::AccountIdentity;

pub mod stripe;
pub mod stripe_types;

pub use stripe::StripeGateway;

#[derive(Debug, thiserror::Error)]
pub enum PaymentGatewayError {
    #[error("Webhook signature verification failed: {0}")]
    SignatureInvalid(String),
    #[error("Provider API error: {0}")]
    Api(String),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone)]
pub struct CreateIntentRequest {
    pub account_id: Uuid,
    pub identity: AccountIdentity,
    pub amount_minor: i64,
    pub currency: String,
    pub uses_purchased: i64,
    pub customer_email: Option<String>,
    pub return_url: Option<String>,
}

/// Provider-side view of a payment intent.
#[derive(Debug, Clone)]
pub struct GatewayIntent {
    pub external_id: String,
    pub client_secret: Option<String>,
    pub status: PaymentStatus,
    pub amount_minor: i64,
    pub currency: String,
}

/// Authenticated provider event, already reduced to what the reconciler
/// acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    PaymentSucceeded {
        external_id: String,
        amount_minor: i64,
        identity: Option<AccountIdentity>,
    },
    PaymentFailed {
        external_id: String,
        reason: Option<String>,
    },
    Refund {
        external_id: String,
        amount_minor: i64,
    },
    Ignored {
        kind: String,
    },
}

/// Narrow capability surface over an external payment provider. One
/// implementation per provider; selected once at startup.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider_name(&self) -> &str;

    /// Header carrying the provider's event signature.
    fn signature_header(&self) -> &'static str;

    async fn create_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<GatewayIntent, PaymentGatewayError>;

    /// Fetches the current provider-side state of an intent. May be polled.
    async fn confirm(&self, external_id: &str) -> Result<GatewayIntent, PaymentGatewayError>;

    /// Parses and authenticates a raw webhook delivery. Must reject on
    /// signature mismatch before any side effect.
    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookEvent, PaymentGatewayError>;

    async fn refund(
        &self,
        external_id: &str,
        _amount_minor: Option<i64>,
    ) -> Result<(), PaymentGatewayError> {
        Err(PaymentGatewayError::Unsupported(format!(
            "refund not supported for {}",
            external_id
        )))
    }
}

/// Builds the configured gateway. The provider is fixed for the process
/// lifetime; reconfiguration requires a restart.
pub fn create_gateway(settings: &AppSettings) -> Result<Arc<dyn PaymentGateway>, AppError> {
    match settings.payment.provider.as_str() {
        "stripe" => {
            let secret_key = settings.payment.stripe_secret_key.clone().ok_or_else(|| {
                AppError::Configuration(
                    "STRIPE_SECRET_KEY must be set when PAYMENT_PROVIDER is stripe".to_string(),
                )
            })?;
            let webhook_secret =
                settings.payment.stripe_webhook_secret.clone().ok_or_else(|| {
                    AppError::Configuration(
                        "STRIPE_WEBHOOK_SECRET must be set when PAYMENT_PROVIDER is stripe"
                            .to_string(),
                    )
                })?;
            Ok(Arc::new(StripeGateway::new(
                secret_key,
                webhook_secret,
                settings.billing.request_deadline_seconds,
            )))
        }
        other => Err(AppError::Configuration(format!(
            "Unsupported payment provider: {}",
            other
        ))),
    }
}
