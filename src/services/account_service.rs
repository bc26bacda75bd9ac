use crate::config::settings::BillingConfig;
use crate::db::connection::DatabasePools;
use crate::db::repositories::{Account, AccountRepository, AccountSeed};
use crate::error::AppError;
use crate::models::identity::AccountIdentity;

/// Optional profile fields propagated from the caller. Persisted when the
/// account is first created, never overwritten afterwards.
#[derive(Debug, Clone, Default)]
pub struct AccountProfile {
    pub currency: Option<String>,
    pub plan_name: Option<String>,
    pub customer_email: Option<String>,
    pub marketing_opt_in: Option<bool>,
    pub marketing_opt_in_source: Option<String>,
    pub user_role: Option<String>,
    pub agent_id: Option<String>,
}

/// Lookup / upsert of accounts by composite identity.
#[derive(Debug, Clone)]
pub struct AccountService {
    accounts: AccountRepository,
    accounts_read: AccountRepository,
    config: BillingConfig,
}

impl AccountService {
    pub fn new(pools: DatabasePools, config: BillingConfig) -> Self {
        Self {
            accounts: AccountRepository::new(pools.primary.clone()),
            accounts_read: AccountRepository::new(pools.read_pool().clone()),
            config,
        }
    }

    pub fn seed_from_profile(&self, profile: &AccountProfile) -> AccountSeed {
        AccountSeed {
            free_uses_remaining: self.config.free_uses_per_account,
            currency: profile
                .currency
                .clone()
                .unwrap_or_else(|| self.config.default_currency.clone()),
            plan_name: profile
                .plan_name
                .clone()
                .unwrap_or_else(|| "free".to_string()),
            customer_email: profile.customer_email.clone(),
            marketing_opt_in: profile.marketing_opt_in,
            marketing_opt_in_source: profile.marketing_opt_in_source.clone(),
            user_role: profile.user_role.clone(),
            agent_id: profile.agent_id.clone(),
        }
    }

    /// Returns the canonical account for the identity, creating it with
    /// seeded balances on first observation.
    pub async fn get_or_create(
        &self,
        identity: &AccountIdentity,
        profile: &AccountProfile,
    ) -> Result<Account, AppError> {
        identity.validate()?;
        let seed = self.seed_from_profile(profile);
        self.accounts.upsert(identity, &seed).await
    }

    /// Read-path lookup; uses the replica when one is configured.
    pub async fn find(&self, identity: &AccountIdentity) -> Result<Option<Account>, AppError> {
        identity.validate()?;
        self.accounts_read.find_by_identity(identity).await
    }
}
