//! The transactional ledger engine.
//!
//! Every balance mutation runs as a single transaction on the primary:
//! lock the account row, re-read balances, apply the pool selection,
//! write the account and the ledger row, then verify the writes by
//! re-reading them before commit. Isolation is READ COMMITTED with an
//! explicit `SELECT ... FOR UPDATE` on the account row; per-account
//! mutations are serialised by that lock.

use log::info;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::config::settings::BillingConfig;
use crate::db::connection::DatabasePools;
use crate::db::repositories::{
    Account, AccountRepository, AccountSeed, Charge, ChargeRepository, Credit, CreditRepository,
    ProductInventoryRepository, ProductUsage,
};
use crate::error::AppError;
use crate::models::enums::{AccountStatus, TransactionType};
use crate::models::identity::AccountIdentity;
use crate::services::credit_policy::{self, BalancePlan};

/// Idempotency keys are opaque strings bounded in length.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

#[derive(Debug, Clone)]
pub struct ChargeCommand {
    pub identity: AccountIdentity,
    pub amount_minor: i64,
    pub currency: Option<String>,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
    pub metadata: Option<JsonValue>,
    pub product_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChargeOutcome {
    pub charge: Charge,
    pub account: Account,
    /// True when the charge was already recorded under the same
    /// idempotency key and the prior row is being returned.
    pub replayed: bool,
}

#[derive(Debug, Clone)]
pub struct CreditCommand {
    pub identity: AccountIdentity,
    pub amount_minor: i64,
    pub transaction_type: TransactionType,
    pub external_transaction_id: Option<String>,
    pub currency: Option<String>,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreditOutcome {
    pub credit: Credit,
    pub account: Account,
    pub replayed: bool,
}

#[derive(Debug, Clone)]
pub struct LedgerService {
    pools: DatabasePools,
    accounts: AccountRepository,
    charges: ChargeRepository,
    credits: CreditRepository,
    inventory: ProductInventoryRepository,
    config: BillingConfig,
}

impl LedgerService {
    pub fn new(pools: DatabasePools, config: BillingConfig) -> Self {
        Self {
            accounts: AccountRepository::new(pools.primary.clone()),
            charges: ChargeRepository::new(pools.primary.clone()),
            credits: CreditRepository::new(pools.primary.clone()),
            inventory: ProductInventoryRepository::new(pools.primary.clone()),
            pools,
            config,
        }
    }

    /// Applies a charge under the account row lock.
    pub async fn charge(&self, cmd: ChargeCommand) -> Result<ChargeOutcome, AppError> {
        cmd.identity.validate()?;
        if cmd.amount_minor <= 0 {
            return Err(AppError::Validation(
                "amount_minor must be positive".to_string(),
            ));
        }
        validate_idempotency_key(cmd.idempotency_key.as_deref())?;
        if let Some(product_type) = &cmd.product_type {
            if product_type.is_empty() {
                return Err(AppError::Validation(
                    "product_type must not be empty".to_string(),
                ));
            }
        }

        let account = self
            .accounts
            .find_by_identity(&cmd.identity)
            .await?
            .ok_or_else(|| {
                AppError::AccountNotFound(format!(
                    "{}/{}",
                    cmd.identity.oauth_provider, cmd.identity.external_id
                ))
            })?;
        self.ensure_chargeable(&account)?;

        if let Some(key) = &cmd.idempotency_key {
            if let Some(existing) = self
                .charges
                .find_by_idempotency_key(&account.account_id, key)
                .await?
            {
                info!(
                    "Returning existing charge {} for idempotency key {}",
                    existing.charge_id, key
                );
                return Ok(ChargeOutcome {
                    charge: existing,
                    account,
                    replayed: true,
                });
            }
        }

        match self.charge_transaction(&cmd, &account).await {
            Ok(outcome) => Ok(outcome),
            Err(AppError::IdempotencyConflict(_)) if cmd.idempotency_key.is_some() => {
                // Lost a race with a concurrent writer holding the same
                // key; the winner's row is this request's result.
                let key = cmd.idempotency_key.as_deref().unwrap_or_default();
                let existing = self
                    .charges
                    .find_by_idempotency_key(&account.account_id, key)
                    .await?
                    .ok_or_else(|| {
                        AppError::DataIntegrity(format!(
                            "charge with idempotency key {} vanished after conflict",
                            key
                        ))
                    })?;
                Ok(ChargeOutcome {
                    charge: existing,
                    account,
                    replayed: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn charge_transaction(
        &self,
        cmd: &ChargeCommand,
        account: &Account,
    ) -> Result<ChargeOutcome, AppError> {
        let mut tx = self.pools.primary.begin().await?;

        let locked = self
            .accounts
            .lock_for_update(&account.account_id, &mut tx)
            .await?
            .ok_or_else(|| {
                AppError::AccountNotFound(format!("account {} disappeared", account.account_id))
            })?;
        // The status may have flipped since the pre-lock check.
        self.ensure_chargeable(&locked)?;

        let inventory = match &cmd.product_type {
            Some(product_type) => {
                self.inventory
                    .upsert_with_executor(&locked.account_id, product_type, &mut tx)
                    .await?;
                Some(
                    self.inventory
                        .lock_for_update(&locked.account_id, product_type, &mut tx)
                        .await?
                        .ok_or_else(|| {
                            AppError::DataIntegrity(format!(
                                "product inventory vanished after upsert: {}",
                                product_type
                            ))
                        })?,
                )
            }
            None => None,
        };

        let plan = credit_policy::select_pool(&locked, inventory.as_ref(), cmd.amount_minor)
            .ok_or_else(|| AppError::InsufficientCredits {
                message: format!(
                    "account {} cannot cover a charge of {}",
                    locked.account_id, cmd.amount_minor
                ),
                hint: Some(self.config.purchase_hint()),
            })?;

        let balance_before = locked.displayed_balance();
        let updated = self
            .accounts
            .update_balances_with_executor(
                &locked.account_id,
                plan.new_paid_credits,
                plan.new_free_uses,
                locked.balance_minor,
                &mut tx,
            )
            .await?;
        let balance_after = updated.displayed_balance();

        let charge = Charge {
            charge_id: Uuid::new_v4(),
            account_id: locked.account_id,
            amount_minor: cmd.amount_minor,
            currency: cmd
                .currency
                .clone()
                .unwrap_or_else(|| locked.currency.clone()),
            description: cmd.description.clone(),
            idempotency_key: cmd.idempotency_key.clone(),
            metadata: cmd.metadata.clone(),
            balance_before,
            balance_after,
            created_at: chrono::Utc::now(),
        };
        let inserted = self.charges.insert_with_executor(&charge, &mut tx).await?;

        if let Some(product_type) = &cmd.product_type {
            self.apply_product_charge(cmd, &locked, product_type, &plan, &mut tx)
                .await?;
        }

        let (verified_account, verified_charge) = self
            .verify_charge_write(cmd, &locked, &plan, balance_after, &inserted.charge_id, &mut tx)
            .await?;

        tx.commit().await?;

        info!(
            "Charged account {} via {:?}: balance {} -> {}",
            locked.account_id, plan.selection, balance_before, balance_after
        );

        Ok(ChargeOutcome {
            charge: verified_charge,
            account: verified_account,
            replayed: false,
        })
    }

    async fn apply_product_charge(
        &self,
        cmd: &ChargeCommand,
        account: &Account,
        product_type: &str,
        plan: &BalancePlan,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<(), AppError> {
        let new_product_free = plan.new_product_free.ok_or_else(|| {
            AppError::Internal("product charge plan is missing product pools".to_string())
        })?;
        let new_product_paid = plan.new_product_paid.ok_or_else(|| {
            AppError::Internal("product charge plan is missing product pools".to_string())
        })?;

        self.inventory
            .update_pools_with_executor(
                &account.account_id,
                product_type,
                new_product_free,
                new_product_paid,
                tx,
            )
            .await?;

        let usage = ProductUsage {
            usage_id: Uuid::new_v4(),
            account_id: account.account_id,
            product_type: product_type.to_string(),
            amount_minor: cmd.amount_minor,
            pool: plan.selection.usage_pool_str().to_string(),
            idempotency_key: cmd.idempotency_key.clone(),
            metadata: cmd.metadata.clone(),
            created_at: chrono::Utc::now(),
        };
        self.inventory.insert_usage_with_executor(&usage, tx).await?;

        Ok(())
    }

    /// Re-reads the account and the just-inserted charge by primary key and
    /// compares them to the intended state. Any mismatch aborts the
    /// enclosing transaction.
    async fn verify_charge_write(
        &self,
        cmd: &ChargeCommand,
        locked: &Account,
        plan: &BalancePlan,
        balance_after: i64,
        charge_id: &Uuid,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<(Account, Charge), AppError> {
        let verified_account = self
            .accounts
            .find_by_id_with_executor(&locked.account_id, tx)
            .await?
            .ok_or_else(|| {
                AppError::WriteVerification(format!(
                    "account {} not readable after update",
                    locked.account_id
                ))
            })?;

        if verified_account.paid_credits != plan.new_paid_credits
            || verified_account.free_uses_remaining != plan.new_free_uses
        {
            return Err(AppError::WriteVerification(format!(
                "account {} balances disagree with intent: paid {} != {}, free {} != {}",
                locked.account_id,
                verified_account.paid_credits,
                plan.new_paid_credits,
                verified_account.free_uses_remaining,
                plan.new_free_uses
            )));
        }
        if self.config.enforce_balance_minor_invariant
            && verified_account.balance_minor != locked.balance_minor
        {
            return Err(AppError::WriteVerification(format!(
                "account {} balance_minor changed during charge: {} != {}",
                locked.account_id, verified_account.balance_minor, locked.balance_minor
            )));
        }

        let verified_charge = self
            .charges
            .find_by_id_with_executor(charge_id, tx)
            .await?
            .ok_or_else(|| {
                AppError::WriteVerification(format!(
                    "charge {} not readable after insert",
                    charge_id
                ))
            })?;
        if verified_charge.account_id != locked.account_id
            || verified_charge.amount_minor != cmd.amount_minor
            || verified_charge.balance_after != balance_after
        {
            return Err(AppError::WriteVerification(format!(
                "charge {} fields disagree with input",
                charge_id
            )));
        }

        Ok((verified_account, verified_charge))
    }

    /// Adds credits to the main paid pool. The account is created
    /// implicitly when absent; purchase webhooks may arrive before the
    /// identity is otherwise known. Suspended and closed accounts still
    /// accept credits.
    pub async fn credit(&self, cmd: CreditCommand) -> Result<CreditOutcome, AppError> {
        cmd.identity.validate()?;
        if cmd.amount_minor <= 0 {
            return Err(AppError::Validation(
                "amount_minor must be positive".to_string(),
            ));
        }
        validate_idempotency_key(cmd.idempotency_key.as_deref())?;

        let seed = AccountSeed {
            free_uses_remaining: self.config.free_uses_per_account,
            currency: cmd
                .currency
                .clone()
                .unwrap_or_else(|| self.config.default_currency.clone()),
            plan_name: "free".to_string(),
            customer_email: cmd.customer_email.clone(),
            marketing_opt_in: None,
            marketing_opt_in_source: None,
            user_role: None,
            agent_id: None,
        };
        let account = self.accounts.upsert(&cmd.identity, &seed).await?;

        if let Some(key) = &cmd.idempotency_key {
            if let Some(existing) = self
                .credits
                .find_by_idempotency_key(&account.account_id, key)
                .await?
            {
                info!(
                    "Returning existing credit {} for idempotency key {}",
                    existing.credit_id, key
                );
                return Ok(CreditOutcome {
                    credit: existing,
                    account,
                    replayed: true,
                });
            }
        }

        match self.credit_transaction(&cmd, &account).await {
            Ok(outcome) => Ok(outcome),
            Err(AppError::IdempotencyConflict(_)) if cmd.idempotency_key.is_some() => {
                let key = cmd.idempotency_key.as_deref().unwrap_or_default();
                let existing = self
                    .credits
                    .find_by_idempotency_key(&account.account_id, key)
                    .await?
                    .ok_or_else(|| {
                        AppError::DataIntegrity(format!(
                            "credit with idempotency key {} vanished after conflict",
                            key
                        ))
                    })?;
                Ok(CreditOutcome {
                    credit: existing,
                    account,
                    replayed: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn credit_transaction(
        &self,
        cmd: &CreditCommand,
        account: &Account,
    ) -> Result<CreditOutcome, AppError> {
        let mut tx = self.pools.primary.begin().await?;

        let locked = self
            .accounts
            .lock_for_update(&account.account_id, &mut tx)
            .await?
            .ok_or_else(|| {
                AppError::AccountNotFound(format!("account {} disappeared", account.account_id))
            })?;

        let balance_before = locked.paid_credits;
        let new_paid = balance_before.checked_add(cmd.amount_minor).ok_or_else(|| {
            AppError::Validation("credit amount overflows the balance".to_string())
        })?;

        self.accounts
            .update_balances_with_executor(
                &locked.account_id,
                new_paid,
                locked.free_uses_remaining,
                locked.balance_minor,
                &mut tx,
            )
            .await?;

        let credit = Credit {
            credit_id: Uuid::new_v4(),
            account_id: locked.account_id,
            amount_minor: cmd.amount_minor,
            currency: cmd
                .currency
                .clone()
                .unwrap_or_else(|| locked.currency.clone()),
            description: cmd.description.clone(),
            transaction_type: cmd.transaction_type.as_str().to_string(),
            external_transaction_id: cmd.external_transaction_id.clone(),
            idempotency_key: cmd.idempotency_key.clone(),
            balance_before,
            balance_after: new_paid,
            created_at: chrono::Utc::now(),
        };
        let inserted = self.credits.insert_with_executor(&credit, &mut tx).await?;

        let verified_account = self
            .accounts
            .find_by_id_with_executor(&locked.account_id, &mut tx)
            .await?
            .ok_or_else(|| {
                AppError::WriteVerification(format!(
                    "account {} not readable after update",
                    locked.account_id
                ))
            })?;
        if verified_account.paid_credits != balance_before + cmd.amount_minor {
            return Err(AppError::WriteVerification(format!(
                "account {} paid_credits disagree with intent: {} != {}",
                locked.account_id,
                verified_account.paid_credits,
                balance_before + cmd.amount_minor
            )));
        }
        if self.config.enforce_balance_minor_invariant
            && verified_account.balance_minor != locked.balance_minor
        {
            return Err(AppError::WriteVerification(format!(
                "account {} balance_minor changed during credit",
                locked.account_id
            )));
        }

        let verified_credit = self
            .credits
            .find_by_id_with_executor(&inserted.credit_id, &mut tx)
            .await?
            .ok_or_else(|| {
                AppError::WriteVerification(format!(
                    "credit {} not readable after insert",
                    inserted.credit_id
                ))
            })?;
        if verified_credit.amount_minor != cmd.amount_minor
            || verified_credit.balance_after != new_paid
        {
            return Err(AppError::WriteVerification(format!(
                "credit {} fields disagree with input",
                inserted.credit_id
            )));
        }

        tx.commit().await?;

        info!(
            "Credited account {} with {} ({}): paid {} -> {}",
            locked.account_id,
            cmd.amount_minor,
            cmd.transaction_type.as_str(),
            balance_before,
            new_paid
        );

        Ok(CreditOutcome {
            credit: verified_credit,
            account: verified_account,
            replayed: false,
        })
    }

    fn ensure_chargeable(&self, account: &Account) -> Result<(), AppError> {
        match account.status()? {
            AccountStatus::Active => Ok(()),
            AccountStatus::Suspended => Err(AppError::AccountSuspended(format!(
                "account {} is suspended",
                account.account_id
            ))),
            AccountStatus::Closed => Err(AppError::AccountClosed(format!(
                "account {} is closed",
                account.account_id
            ))),
        }
    }
}

fn validate_idempotency_key(key: Option<&str>) -> Result<(), AppError> {
    if let Some(key) = key {
        if key.is_empty() {
            return Err(AppError::Validation(
                "idempotency_key must not be empty".to_string(),
            ));
        }
        if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(AppError::Validation(format!(
                "idempotency_key exceeds {} bytes",
                MAX_IDEMPOTENCY_KEY_LEN
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_bounds() {
        assert!(validate_idempotency_key(None).is_ok());
        assert!(validate_idempotency_key(Some("c1")).is_ok());
        assert!(validate_idempotency_key(Some("")).is_err());
        let oversize = "k".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1);
        assert!(validate_idempotency_key(Some(&oversize)).is_err());
    }

    // Database-backed flows are exercised in the integration module below,
    // which only runs when DATABASE_URL points at a reachable Postgres.
    mod integration {
        use super::super::*;
        use crate::config::settings::{BillingConfig, DatabaseConfig};
        use crate::db::connection::{DatabasePools, create_pools};

        async fn pools() -> Option<DatabasePools> {
            let url = std::env::var("DATABASE_URL").ok()?;
            let config = DatabaseConfig {
                url,
                read_url: None,
            };
            let pools = create_pools(&config).await.ok()?;
            sqlx::migrate!("./migrations")
                .run(&pools.primary)
                .await
                .ok()?;
            Some(pools)
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

        fn fresh_identity() -> AccountIdentity {
            AccountIdentity::new("oauth:google", format!("it-{}", Uuid::new_v4()))
        }

        fn charge_cmd(identity: &AccountIdentity, amount: i64, key: &str) -> ChargeCommand {
            ChargeCommand {
                identity: identity.clone(),
                amount_minor: amount,
                currency: None,
                description: None,
                idempotency_key: Some(key.to_string()),
                metadata: None,
                product_type: None,
            }
        }

        fn credit_cmd(identity: &AccountIdentity, amount: i64, key: &str) -> CreditCommand {
            CreditCommand {
                identity: identity.clone(),
                amount_minor: amount,
                transaction_type: TransactionType::Grant,
                external_transaction_id: None,
                currency: None,
                description: None,
                idempotency_key: Some(key.to_string()),
                customer_email: None,
            }
        }

        #[tokio::test]
        async fn first_charge_consumes_a_free_use() {
            let Some(pools) = pools().await else { return };
            let ledger = LedgerService::new(pools.clone(), config());
            let accounts = AccountRepository::new(pools.primary.clone());
            let identity = fresh_identity();

            let seed = AccountSeed {
                free_uses_remaining: 3,
                currency: "USD".to_string(),
                plan_name: "free".to_string(),
                customer_email: None,
                marketing_opt_in: None,
                marketing_opt_in_source: None,
                user_role: None,
                agent_id: None,
            };
            accounts.upsert(&identity, &seed).await.unwrap();

            let outcome = ledger
                .charge(charge_cmd(&identity, 100, "c1"))
                .await
                .unwrap();
            assert!(!outcome.replayed);
            assert_eq!(outcome.account.free_uses_remaining, 2);
            assert_eq!(outcome.account.paid_credits, 0);
            assert_eq!(outcome.charge.balance_after, 0);
        }

        #[tokio::test]
        async fn charge_replay_returns_the_original_row() {
            let Some(pools) = pools().await else { return };
            let ledger = LedgerService::new(pools.clone(), config());
            let accounts = AccountRepository::new(pools.primary.clone());
            let identity = fresh_identity();

            let seed = AccountSeed {
                free_uses_remaining: 3,
                currency: "USD".to_string(),
                plan_name: "free".to_string(),
                customer_email: None,
                marketing_opt_in: None,
                marketing_opt_in_source: None,
                user_role: None,
                agent_id: None,
            };
            accounts.upsert(&identity, &seed).await.unwrap();

            let first = ledger
                .charge(charge_cmd(&identity, 100, "c1"))
                .await
                .unwrap();
            let second = ledger
                .charge(charge_cmd(&identity, 100, "c1"))
                .await
                .unwrap();
            assert!(second.replayed);
            assert_eq!(second.charge.charge_id, first.charge.charge_id);
            assert_eq!(second.account.free_uses_remaining, 2);
        }

        #[tokio::test]
        async fn credit_is_idempotent_per_key() {
            let Some(pools) = pools().await else { return };
            let ledger = LedgerService::new(pools.clone(), config());
            let identity = fresh_identity();

            let first = ledger.credit(credit_cmd(&identity, 50, "p1")).await.unwrap();
            let second = ledger.credit(credit_cmd(&identity, 50, "p1")).await.unwrap();
            assert!(!first.replayed);
            assert!(second.replayed);
            assert_eq!(second.credit.credit_id, first.credit.credit_id);
            assert_eq!(second.account.paid_credits, 50);
        }

        #[tokio::test]
        async fn suspended_account_refuses_charges_but_accepts_credits() {
            let Some(pools) = pools().await else { return };
            let ledger = LedgerService::new(pools.clone(), config());
            let accounts = AccountRepository::new(pools.primary.clone());
            let identity = fresh_identity();

            let created = ledger
                .credit(credit_cmd(&identity, 10, "seed"))
                .await
                .unwrap();
            accounts
                .set_status(&created.account.account_id, AccountStatus::Suspended)
                .await
                .unwrap();

            let charge = ledger.charge(charge_cmd(&identity, 1, "c1")).await;
            assert!(matches!(charge, Err(AppError::AccountSuspended(_))));

            let refund = ledger
                .credit(credit_cmd(&identity, 5, "refund-1"))
                .await
                .unwrap();
            assert_eq!(refund.account.paid_credits, 15);
        }

        #[tokio::test]
        async fn product_charge_falls_back_to_main_pool() {
            let Some(pools) = pools().await else { return };
            let ledger = LedgerService::new(pools.clone(), config());
            let identity = fresh_identity();

            ledger.credit(credit_cmd(&identity, 10, "seed")).await.unwrap();
            // Exhaust the free pool so the product fallback hits paid credits.
            for i in 0..3 {
                ledger
                    .charge(charge_cmd(&identity, 1, &format!("warm-{}", i)))
                    .await
                    .unwrap();
            }

            let mut cmd = charge_cmd(&identity, 1, "t1");
            cmd.product_type = Some("web_search".to_string());
            let outcome = ledger.charge(cmd.clone()).await.unwrap();
            assert_eq!(outcome.account.paid_credits, 9);

            let replay = ledger.charge(cmd).await.unwrap();
            assert!(replay.replayed);
            assert_eq!(replay.charge.charge_id, outcome.charge.charge_id);
        }

        #[tokio::test]
        async fn exhausted_account_is_denied_with_hint() {
            let Some(pools) = pools().await else { return };
            let ledger = LedgerService::new(pools.clone(), config());
            let identity = fresh_identity();

            ledger.credit(credit_cmd(&identity, 1, "seed")).await.unwrap();
            for i in 0..4 {
                ledger
                    .charge(charge_cmd(&identity, 1, &format!("use-{}", i)))
                    .await
                    .unwrap();
            }

            let denied = ledger.charge(charge_cmd(&identity, 1, "use-4")).await;
            match denied {
                Err(AppError::InsufficientCredits { hint, .. }) => {
                    let hint = hint.unwrap();
                    assert_eq!(hint.price_minor, 500);
                    assert_eq!(hint.uses, 50);
                }
                other => panic!("expected InsufficientCredits, got {:?}", other.err()),
            }
        }
    }
}
