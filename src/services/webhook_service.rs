use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::settings::BillingConfig;
use crate::db::connection::DatabasePools;
use crate::db::repositories::{
    AccountRepository, CreditRepository, PaymentRecord, PaymentRepository,
};
use crate::error::AppError;
use crate::models::enums::{PaymentStatus, TransactionType};
use crate::models::identity::AccountIdentity;
use crate::services::ledger_service::{CreditCommand, LedgerService};
use crate::services::payment::{PaymentGateway, WebhookEvent};

/// What the reconciler did with a verified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDisposition {
    Credited,
    AlreadyProcessed,
    MarkedFailed,
    RefundLogged,
    Ignored,
}

impl WebhookDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookDisposition::Credited => "credited",
            WebhookDisposition::AlreadyProcessed => "already_processed",
            WebhookDisposition::MarkedFailed => "marked_failed",
            WebhookDisposition::RefundLogged => "refund_logged",
            WebhookDisposition::Ignored => "ignored",
        }
    }
}

/// Turns authenticated provider events into at-most-once ledger effects.
#[derive(Clone)]
pub struct WebhookService {
    gateway: Arc<dyn PaymentGateway>,
    payments: PaymentRepository,
    accounts: AccountRepository,
    credits: CreditRepository,
    ledger: LedgerService,
    config: BillingConfig,
}

impl WebhookService {
    pub fn new(
        pools: DatabasePools,
        config: BillingConfig,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            payments: PaymentRepository::new(pools.primary.clone()),
            accounts: AccountRepository::new(pools.primary.clone()),
            credits: CreditRepository::new(pools.primary.clone()),
            ledger: LedgerService::new(pools.clone(), config.clone()),
            gateway,
            config,
        }
    }

    /// Name of the header carrying the provider's signature.
    pub fn signature_header(&self) -> &'static str {
        self.gateway.signature_header()
    }

    /// Verifies and processes one raw webhook delivery. Signature failures
    /// surface before any side effect.
    pub async fn process(
        &self,
        provider: &str,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookDisposition, AppError> {
        if provider != self.gateway.provider_name() {
            return Err(AppError::NotFound(format!(
                "unknown payment provider: {}",
                provider
            )));
        }

        let event = self.gateway.verify_webhook(payload, signature_header)?;

        match event {
            WebhookEvent::PaymentSucceeded {
                external_id,
                amount_minor,
                identity,
            } => self.fulfill_payment(&external_id, amount_minor, identity).await,
            WebhookEvent::PaymentFailed {
                external_id,
                reason,
            } => {
                let updated = self
                    .payments
                    .mark_failed(
                        self.gateway.provider_name(),
                        &external_id,
                        reason.as_deref(),
                    )
                    .await?;
                if updated.is_none() {
                    info!(
                        "Payment failure for unknown or already fulfilled transaction {}",
                        external_id
                    );
                }
                Ok(WebhookDisposition::MarkedFailed)
            }
            WebhookEvent::Refund {
                external_id,
                amount_minor,
            } => {
                // Logged only; credit clawback is deliberately not performed.
                info!(
                    "Refund of {} received for {}; no ledger effect",
                    amount_minor, external_id
                );
                Ok(WebhookDisposition::RefundLogged)
            }
            WebhookEvent::Ignored { kind } => {
                debug!("Acknowledging ignored event kind {}", kind);
                Ok(WebhookDisposition::Ignored)
            }
        }
    }

    /// Credits the account for a succeeded payment exactly once. Duplicate
    /// deliveries are acknowledged without a second credit.
    async fn fulfill_payment(
        &self,
        external_id: &str,
        amount_minor: i64,
        identity: Option<AccountIdentity>,
    ) -> Result<WebhookDisposition, AppError> {
        let provider = self.gateway.provider_name();

        let record = self.payments.find_by_external_id(provider, external_id).await?;
        if let Some(record) = &record {
            if record.is_fulfilled() {
                info!(
                    "Payment {} already fulfilled, acknowledging duplicate delivery",
                    external_id
                );
                return Ok(WebhookDisposition::AlreadyProcessed);
            }
        }
        if self
            .credits
            .find_by_external_transaction_id(external_id)
            .await?
            .is_some()
        {
            info!(
                "Credit already recorded for transaction {}, acknowledging duplicate delivery",
                external_id
            );
            return Ok(WebhookDisposition::AlreadyProcessed);
        }

        // Resolve the identity: event metadata first, then the account the
        // recorded intent points at. An event with neither cannot be
        // routed; acknowledge it so the provider stops redelivering.
        let identity = match identity {
            Some(identity) => Some(identity),
            None => match &record {
                Some(record) => self
                    .accounts
                    .find_by_id(&record.account_id)
                    .await?
                    .map(|account| account.identity()),
                None => None,
            },
        };
        let Some(identity) = identity else {
            error!(
                "Payment {} carries no identity and no recorded intent; cannot credit",
                external_id
            );
            return Ok(WebhookDisposition::Ignored);
        };

        let uses = record
            .as_ref()
            .map(|r| r.uses_purchased)
            .unwrap_or(self.config.paid_uses_per_purchase);
        if let Some(record) = &record {
            if record.amount_minor != amount_minor {
                warn!(
                    "Payment {} amount {} disagrees with recorded intent amount {}",
                    external_id, amount_minor, record.amount_minor
                );
            }
        }

        let outcome = self
            .ledger
            .credit(CreditCommand {
                identity,
                amount_minor: uses,
                transaction_type: TransactionType::Purchase,
                external_transaction_id: Some(external_id.to_string()),
                currency: None,
                description: Some(format!("Purchase of {} uses", uses)),
                idempotency_key: Some(external_id.to_string()),
                customer_email: None,
            })
            .await?;

        if record.is_some() {
            self.payments
                .mark_succeeded(provider, external_id, &outcome.credit.credit_id)
                .await?;
        } else if amount_minor > 0 {
            // No intent was recorded before the webhook landed; write one
            // so the (provider, external id) pairing is still unique.
            let record = PaymentRecord {
                payment_id: Uuid::new_v4(),
                provider: provider.to_string(),
                external_transaction_id: external_id.to_string(),
                account_id: outcome.account.account_id,
                amount_minor,
                currency: outcome.credit.currency.clone(),
                uses_purchased: uses,
                status: PaymentStatus::Succeeded.as_str().to_string(),
                client_secret: None,
                failure_reason: None,
                fulfilled_by_credit_id: Some(outcome.credit.credit_id),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            if let Err(e) = self.payments.insert(&record).await {
                warn!(
                    "Failed to backfill payment record for {}: {}",
                    external_id, e
                );
            }
        }

        if outcome.replayed {
            Ok(WebhookDisposition::AlreadyProcessed)
        } else {
            Ok(WebhookDisposition::Credited)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // End-to-end webhook processing, gated on a reachable Postgres.
    mod integration {
        use super::super::*;
        use crate::config::settings::DatabaseConfig;
        use crate::db::connection::create_pools;
        use crate::services::payment::{
            CreateIntentRequest, GatewayIntent, PaymentGatewayError,
        };
        use async_trait::async_trait;

        /// Gateway double that skips signature verification and replays a
        /// canned event, so the reconciler can be driven without a provider.
        struct StaticGateway {
            event: WebhookEvent,
        }

        #[async_trait]
        impl PaymentGateway for StaticGateway {
            fn provider_name(&self) -> &str {
                "stripe"
            }

            fn signature_header(&self) -> &'static str {
                "Stripe-Signature"
            }

            async fn create_intent(
                &self,
                _request: &CreateIntentRequest,
            ) -> Result<GatewayIntent, PaymentGatewayError> {
                Err(PaymentGatewayError::Unsupported("test gateway".to_string()))
            }

            async fn confirm(
                &self,
                _external_id: &str,
            ) -> Result<GatewayIntent, PaymentGatewayError> {
                Err(PaymentGatewayError::Unsupported("test gateway".to_string()))
            }

            fn verify_webhook(
                &self,
                _payload: &[u8],
                _signature_header: &str,
            ) -> Result<WebhookEvent, PaymentGatewayError> {
                Ok(self.event.clone())
            }
        }

        fn config() -> BillingConfig {
            BillingConfig {
                free_uses_per_account: 3,
                paid_uses_per_purchase: 50,
                price_per_purchase_minor: 500,
                default_currency: "USD".to_string(),
                request_deadline_seconds: 10,
                enforce_balance_minor_invariant: true,
            }
        }

        #[tokio::test]
        async fn duplicate_delivery_credits_at_most_once() {
            let Ok(url) = std::env::var("DATABASE_URL") else {
                return;
            };
            let Ok(pools) = create_pools(&DatabaseConfig {
                url,
                read_url: None,
            })
            .await
            else {
                return;
            };
            if sqlx::migrate!("./migrations")
                .run(&pools.primary)
                .await
                .is_err()
            {
                return;
            }

            let external_id = format!("pi-{}", Uuid::new_v4());
            let identity = AccountIdentity::new(
                "oauth:google",
                format!("wh-{}", Uuid::new_v4()),
            );
            let gateway = Arc::new(StaticGateway {
                event: WebhookEvent::PaymentSucceeded {
                    external_id: external_id.clone(),
                    amount_minor: 500,
                    identity: Some(identity.clone()),
                },
            });
            let service = WebhookService::new(pools.clone(), config(), gateway);

            let first = service.process("stripe", b"{}", "sig").await.unwrap();
            assert_eq!(first, WebhookDisposition::Credited);

            let second = service.process("stripe", b"{}", "sig").await.unwrap();
            assert_eq!(second, WebhookDisposition::AlreadyProcessed);

            let accounts = AccountRepository::new(pools.primary.clone());
            let account = accounts
                .find_by_identity(&identity)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(account.paid_credits, 50);

            let credits = CreditRepository::new(pools.primary.clone());
            let credit = credits
                .find_by_external_transaction_id(&external_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(credit.amount_minor, 50);
        }
    }
}
