use chrono::Utc;
use uuid::Uuid;

use crate::config::AppSettings;
use crate::db::connection::DatabasePools;
use crate::db::repositories::{
    Account, ChargeRepository, CreditCheck, ProductInventoryRepository,
};
use crate::error::AppError;
use crate::models::billing::{
    AccountUpsertRequest, CreditCheckRequest, CreditCheckResponse,
};
use crate::models::identity::AccountIdentity;
use crate::services::account_service::{AccountProfile, AccountService};
use crate::services::audit_service::AuditService;
use crate::services::credit_policy;

/// Read-path facade: authorization decisions and account lookups.
#[derive(Debug, Clone)]
pub struct BillingService {
    accounts: AccountService,
    charges_read: ChargeRepository,
    inventory_read: ProductInventoryRepository,
    audit: AuditService,
    settings: AppSettings,
}

impl BillingService {
    pub fn new(pools: DatabasePools, settings: AppSettings) -> Self {
        Self {
            accounts: AccountService::new(pools.clone(), settings.billing.clone()),
            charges_read: ChargeRepository::new(pools.read_pool().clone()),
            inventory_read: ProductInventoryRepository::new(pools.read_pool().clone()),
            audit: AuditService::new(pools.clone()),
            settings,
        }
    }

    /// Decides whether the principal may be served, creating the account
    /// on first observation. Every decision is appended to the audit log
    /// asynchronously.
    pub async fn check_credits(
        &self,
        request: CreditCheckRequest,
    ) -> Result<CreditCheckResponse, AppError> {
        request.identity.validate()?;

        let profile = AccountProfile {
            customer_email: request.customer_email.clone(),
            agent_id: request.agent_id.clone(),
            ..Default::default()
        };
        let account = self
            .accounts
            .get_or_create(&request.identity, &profile)
            .await?;

        let (product_free, product_paid) = self
            .inventory_read
            .pool_summary(&account.account_id)
            .await?;
        let decision = credit_policy::authorize(
            &account,
            product_free,
            product_paid,
            &self.settings.billing,
        )?;
        let total_uses = self
            .charges_read
            .count_for_account(&account.account_id)
            .await?;

        self.audit.record_decision(CreditCheck {
            check_id: Uuid::new_v4(),
            account_id: Some(account.account_id),
            oauth_provider: request.identity.oauth_provider.clone(),
            external_id: request.identity.external_id.clone(),
            wa_id: request.identity.wa_id.clone(),
            tenant_id: request.identity.tenant_id.clone(),
            allowed: decision.allowed,
            pool: Some(decision.pool.as_str().to_string()),
            denial_reason: decision.denial_reason.map(|r| r.as_str().to_string()),
            agent_id: request.agent_id.clone(),
            channel_id: request.channel_id.clone(),
            request_id: request.request_id.clone(),
            created_at: Utc::now(),
        });

        Ok(CreditCheckResponse {
            has_credit: decision.allowed,
            credits_remaining: account.paid_credits,
            free_uses_remaining: account.free_uses_remaining,
            total_uses,
            plan_name: account.plan_name.clone(),
            purchase_required: decision.purchase_hint.is_some(),
            purchase_price_minor: decision.purchase_hint.map(|h| h.price_minor),
            purchase_uses: decision.purchase_hint.map(|h| h.uses),
            reason: decision.denial_reason.map(|r| r.as_str().to_string()),
        })
    }

    pub async fn upsert_account(
        &self,
        request: AccountUpsertRequest,
    ) -> Result<Account, AppError> {
        let profile = AccountProfile {
            currency: request.currency.clone(),
            plan_name: request.plan_name.clone(),
            customer_email: request.customer_email.clone(),
            marketing_opt_in: request.marketing_opt_in,
            marketing_opt_in_source: request.marketing_opt_in_source.clone(),
            user_role: request.user_role.clone(),
            agent_id: request.agent_id.clone(),
        };
        self.accounts.get_or_create(&request.identity, &profile).await
    }

    pub async fn get_account(
        &self,
        oauth_provider: &str,
        external_id: &str,
    ) -> Result<Account, AppError> {
        let identity = AccountIdentity::new(oauth_provider, external_id);
        self.accounts.find(&identity).await?.ok_or_else(|| {
            AppError::AccountNotFound(format!("{}/{}", oauth_provider, external_id))
        })
    }
}
