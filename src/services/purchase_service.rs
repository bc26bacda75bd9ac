use std::sync::Arc;

use chrono::Utc;
use log::warn;
use uuid::Uuid;

use crate::config::settings::BillingConfig;
use crate::db::connection::DatabasePools;
use crate::db::repositories::{PaymentRecord, PaymentRepository};
use crate::error::AppError;
use crate::models::billing::PurchaseRequest;
use crate::services::account_service::{AccountProfile, AccountService};
use crate::services::payment::{CreateIntentRequest, PaymentGateway};

/// Creates payment intents and answers status polls. Fulfilment (the
/// actual credit) happens exclusively on the webhook path.
#[derive(Clone)]
pub struct PurchaseService {
    accounts: AccountService,
    payments: PaymentRepository,
    gateway: Arc<dyn PaymentGateway>,
    config: BillingConfig,
}

impl PurchaseService {
    pub fn new(
        pools: DatabasePools,
        config: BillingConfig,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            accounts: AccountService::new(pools.clone(), config.clone()),
            payments: PaymentRepository::new(pools.primary.clone()),
            gateway,
            config,
        }
    }

    pub async fn create_purchase(
        &self,
        request: PurchaseRequest,
    ) -> Result<PaymentRecord, AppError> {
        request.identity.validate()?;

        let profile = AccountProfile {
            customer_email: request.customer_email.clone(),
            ..Default::default()
        };
        let account = self
            .accounts
            .get_or_create(&request.identity, &profile)
            .await?;

        let intent_request = CreateIntentRequest {
            account_id: account.account_id,
            identity: account.identity(),
            amount_minor: self.config.price_per_purchase_minor,
            currency: self.config.default_currency.clone(),
            uses_purchased: self.config.paid_uses_per_purchase,
            customer_email: request.customer_email.clone(),
            return_url: request.return_url.clone(),
        };
        let intent = self.gateway.create_intent(&intent_request).await?;

        let record = PaymentRecord {
            payment_id: Uuid::new_v4(),
            provider: self.gateway.provider_name().to_string(),
            external_transaction_id: intent.external_id,
            account_id: account.account_id,
            amount_minor: intent.amount_minor,
            currency: intent.currency,
            uses_purchased: self.config.paid_uses_per_purchase,
            status: intent.status.as_str().to_string(),
            client_secret: intent.client_secret,
            failure_reason: None,
            fulfilled_by_credit_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.payments.insert(&record).await
    }

    /// Returns the stored payment state, refreshing it from the provider
    /// while the payment is still in flight. A provider hiccup during the
    /// refresh degrades to the stored state rather than failing the poll.
    pub async fn get_purchase(&self, payment_id: &Uuid) -> Result<PaymentRecord, AppError> {
        let record = self
            .payments
            .find_by_payment_id(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("payment {}", payment_id)))?;

        if record.status()?.is_terminal() {
            return Ok(record);
        }

        match self.gateway.confirm(&record.external_transaction_id).await {
            Ok(intent) if intent.status.as_str() != record.status => {
                self.payments.update_status(&record.payment_id, intent.status).await
            }
            Ok(_) => Ok(record),
            Err(e) => {
                warn!(
                    "Failed to refresh payment {} from provider: {}",
                    payment_id, e
                );
                Ok(record)
            }
        }
    }
}
