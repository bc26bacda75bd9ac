//! Authorization and pool-selection decisions.
//!
//! Both decisions are pure functions over balance snapshots so the rules
//! can be tested without a database. The ledger engine calls
//! [`select_pool`] inside the charge transaction, on the row it has just
//! locked; [`authorize`] runs on the read path before any charge.

use crate::config::settings::BillingConfig;
use crate::db::repositories::{Account, ProductInventory};
use crate::error::AppError;
use crate::models::billing::PurchaseHint;
use crate::models::enums::{AccountStatus, CreditPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    AccountSuspended,
    AccountClosed,
    NoCreditsRemaining,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::AccountSuspended => "account_suspended",
            DenialReason::AccountClosed => "account_closed",
            DenialReason::NoCreditsRemaining => "no_credits_remaining",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreditDecision {
    pub allowed: bool,
    pub pool: CreditPool,
    pub denial_reason: Option<DenialReason>,
    pub purchase_hint: Option<PurchaseHint>,
}

/// May this principal be served at all?
pub fn authorize(
    account: &Account,
    product_free_available: bool,
    product_paid_available: bool,
    config: &BillingConfig,
) -> Result<CreditDecision, AppError> {
    let denial = |reason: DenialReason, hint: Option<PurchaseHint>| CreditDecision {
        allowed: false,
        pool: CreditPool::None,
        denial_reason: Some(reason),
        purchase_hint: hint,
    };

    match account.status()? {
        AccountStatus::Suspended => Ok(denial(DenialReason::AccountSuspended, None)),
        AccountStatus::Closed => Ok(denial(DenialReason::AccountClosed, None)),
        AccountStatus::Active => {
            let pool = if account.free_uses_remaining > 0 || product_free_available {
                Some(CreditPool::Free)
            } else if account.paid_credits > 0 || product_paid_available {
                Some(CreditPool::Paid)
            } else {
                None
            };
            match pool {
                Some(pool) => Ok(CreditDecision {
                    allowed: true,
                    pool,
                    denial_reason: None,
                    purchase_hint: None,
                }),
                None => Ok(denial(
                    DenialReason::NoCreditsRemaining,
                    Some(config.purchase_hint()),
                )),
            }
        }
    }
}

/// Pool chosen to absorb a charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSelection {
    /// One use from the account-wide free pool.
    FreeUse,
    /// `amount_minor` from the account-wide paid pool.
    MainPaid,
    /// One use from the product's free pool.
    ProductFree,
    /// One use from the product's paid pool.
    ProductPaid,
    /// Product pools exhausted; `amount_minor` from the main paid pool.
    MainFallback,
}

impl PoolSelection {
    /// Label written to the product usage log.
    pub fn usage_pool_str(&self) -> &'static str {
        match self {
            PoolSelection::FreeUse | PoolSelection::ProductFree => "free",
            PoolSelection::ProductPaid => "product_paid",
            PoolSelection::MainPaid | PoolSelection::MainFallback => "paid",
        }
    }
}

/// The balance mutations a selected pool implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancePlan {
    pub selection: PoolSelection,
    pub new_free_uses: i64,
    pub new_paid_credits: i64,
    pub new_product_free: Option<i64>,
    pub new_product_paid: Option<i64>,
}

/// Selects the pool for a charge against the locked balances, or `None`
/// when nothing can cover it.
///
/// Free pools are consumed one use per charge; paid pools are decremented
/// by the supplied amount. A product charge falls back to the main paid
/// pool when the product's own pools are empty, and the caller's amount
/// governs that fallback regardless of the product's configured price.
pub fn select_pool(
    account: &Account,
    inventory: Option<&ProductInventory>,
    amount_minor: i64,
) -> Option<BalancePlan> {
    match inventory {
        None => {
            if account.free_uses_remaining >= 1 {
                Some(BalancePlan {
                    selection: PoolSelection::FreeUse,
                    new_free_uses: account.free_uses_remaining - 1,
                    new_paid_credits: account.paid_credits,
                    new_product_free: None,
                    new_product_paid: None,
                })
            } else if account.paid_credits >= amount_minor {
                Some(BalancePlan {
                    selection: PoolSelection::MainPaid,
                    new_free_uses: account.free_uses_remaining,
                    new_paid_credits: account.paid_credits - amount_minor,
                    new_product_free: None,
                    new_product_paid: None,
                })
            } else {
                None
            }
        }
        Some(inventory) => {
            if inventory.free_remaining >= 1 {
                Some(BalancePlan {
                    selection: PoolSelection::ProductFree,
                    new_free_uses: account.free_uses_remaining,
                    new_paid_credits: account.paid_credits,
                    new_product_free: Some(inventory.free_remaining - 1),
                    new_product_paid: Some(inventory.paid_credits),
                })
            } else if inventory.paid_credits >= 1 {
                Some(BalancePlan {
                    selection: PoolSelection::ProductPaid,
                    new_free_uses: account.free_uses_remaining,
                    new_paid_credits: account.paid_credits,
                    new_product_free: Some(inventory.free_remaining),
                    new_product_paid: Some(inventory.paid_credits - 1),
                })
            } else if account.paid_credits >= amount_minor {
                Some(BalancePlan {
                    selection: PoolSelection::MainFallback,
                    new_free_uses: account.free_uses_remaining,
                    new_paid_credits: account.paid_credits - amount_minor,
                    new_product_free: Some(inventory.free_remaining),
                    new_product_paid: Some(inventory.paid_credits),
                })
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn account(free: i64, paid: i64, status: &str) -> Account {
        Account {
            account_id: Uuid::new_v4(),
            oauth_provider: "oauth:google".to_string(),
            external_id: "u1".to_string(),
            wa_id: None,
            tenant_id: None,
            paid_credits: paid,
            free_uses_remaining: free,
            balance_minor: 0,
            currency: "USD".to_string(),
            plan_name: "free".to_string(),
            status: status.to_string(),
            customer_email: None,
            marketing_opt_in: None,
            marketing_opt_in_at: None,
            marketing_opt_in_source: None,
            user_role: None,
            agent_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn inventory(free: i64, paid: i64) -> ProductInventory {
        ProductInventory {
            account_id: Uuid::new_v4(),
            product_type: "web_search".to_string(),
            free_remaining: free,
            paid_credits: paid,
            last_daily_refresh: None,
            total_uses: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
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

    #[test]
    fn fresh_account_is_allowed_via_free_pool() {
        let decision = authorize(&account(3, 0, "active"), false, false, &config()).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.pool, CreditPool::Free);
        assert_eq!(decision.purchase_hint, None);
    }

    #[test]
    fn exhausted_account_is_denied_with_purchase_hint() {
        let decision = authorize(&account(0, 0, "active"), false, false, &config()).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.pool, CreditPool::None);
        assert_eq!(
            decision.denial_reason,
            Some(DenialReason::NoCreditsRemaining)
        );
        assert_eq!(
            decision.purchase_hint,
            Some(PurchaseHint {
                price_minor: 500,
                uses: 50
            })
        );
    }

    #[test]
    fn suspended_account_is_denied_regardless_of_balance() {
        let decision = authorize(&account(3, 100, "suspended"), false, false, &config()).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.denial_reason, Some(DenialReason::AccountSuspended));
        assert_eq!(decision.purchase_hint, None);
    }

    #[test]
    fn closed_account_is_denied() {
        let decision = authorize(&account(0, 50, "closed"), false, false, &config()).unwrap();
        assert_eq!(decision.denial_reason, Some(DenialReason::AccountClosed));
    }

    #[test]
    fn product_pools_alone_authorize_an_exhausted_account() {
        let decision = authorize(&account(0, 0, "active"), false, true, &config()).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.pool, CreditPool::Paid);
    }

    #[test]
    fn unknown_status_is_a_data_integrity_error() {
        let result = authorize(&account(3, 0, "archived"), false, false, &config());
        assert!(matches!(result, Err(AppError::DataIntegrity(_))));
    }

    #[test]
    fn free_pool_consumes_one_use_and_leaves_paid_untouched() {
        let plan = select_pool(&account(3, 200, "active"), None, 100).unwrap();
        assert_eq!(plan.selection, PoolSelection::FreeUse);
        assert_eq!(plan.new_free_uses, 2);
        assert_eq!(plan.new_paid_credits, 200);
    }

    #[test]
    fn paid_pool_decrements_by_the_supplied_amount() {
        let plan = select_pool(&account(0, 200, "active"), None, 100).unwrap();
        assert_eq!(plan.selection, PoolSelection::MainPaid);
        assert_eq!(plan.new_paid_credits, 100);
    }

    #[test]
    fn charge_equal_to_balance_succeeds_and_one_more_denies() {
        let exact = select_pool(&account(0, 100, "active"), None, 100).unwrap();
        assert_eq!(exact.new_paid_credits, 0);

        assert_eq!(select_pool(&account(0, 100, "active"), None, 101), None);
    }

    #[test]
    fn product_free_pool_wins_over_product_paid() {
        let plan = select_pool(&account(0, 10, "active"), Some(&inventory(2, 5)), 1).unwrap();
        assert_eq!(plan.selection, PoolSelection::ProductFree);
        assert_eq!(plan.new_product_free, Some(1));
        assert_eq!(plan.new_product_paid, Some(5));
        assert_eq!(plan.new_paid_credits, 10);
    }

    #[test]
    fn product_paid_pool_consumes_one_unit() {
        let plan = select_pool(&account(0, 10, "active"), Some(&inventory(0, 5)), 1).unwrap();
        assert_eq!(plan.selection, PoolSelection::ProductPaid);
        assert_eq!(plan.new_product_paid, Some(4));
        assert_eq!(plan.new_paid_credits, 10);
    }

    #[test]
    fn empty_product_pools_fall_back_to_main_paid_by_amount() {
        let plan = select_pool(&account(0, 10, "active"), Some(&inventory(0, 0)), 1).unwrap();
        assert_eq!(plan.selection, PoolSelection::MainFallback);
        assert_eq!(plan.new_paid_credits, 9);
        assert_eq!(plan.new_product_free, Some(0));
        assert_eq!(plan.new_product_paid, Some(0));
    }

    #[test]
    fn everything_empty_denies_product_charge() {
        assert_eq!(
            select_pool(&account(0, 0, "active"), Some(&inventory(0, 0)), 1),
            None
        );
    }

    #[test]
    fn main_free_pool_is_not_consulted_for_product_charges() {
        // A product charge with empty product pools draws from main paid,
        // never from the account-wide free pool.
        let plan = select_pool(&account(3, 10, "active"), Some(&inventory(0, 0)), 1).unwrap();
        assert_eq!(plan.selection, PoolSelection::MainFallback);
        assert_eq!(plan.new_free_uses, 3);
    }

    proptest! {
        /// No selected plan may drive any pool negative, and paid-pool
        /// charges must conserve amount exactly.
        #[test]
        fn selected_plans_never_go_negative(
            free in 0i64..5,
            paid in 0i64..1_000,
            inv_free in proptest::option::of(0i64..5),
            inv_paid in 0i64..5,
            amount in 1i64..1_500,
        ) {
            let account = account(free, paid, "active");
            let inventory = inv_free.map(|f| inventory(f, inv_paid));
            if let Some(plan) = select_pool(&account, inventory.as_ref(), amount) {
                prop_assert!(plan.new_free_uses >= 0);
                prop_assert!(plan.new_paid_credits >= 0);
                prop_assert!(plan.new_product_free.unwrap_or(0) >= 0);
                prop_assert!(plan.new_product_paid.unwrap_or(0) >= 0);
                match plan.selection {
                    PoolSelection::MainPaid | PoolSelection::MainFallback => {
                        prop_assert_eq!(plan.new_paid_credits, account.paid_credits - amount);
                    }
                    PoolSelection::FreeUse => {
                        prop_assert_eq!(plan.new_free_uses, account.free_uses_remaining - 1);
                        prop_assert_eq!(plan.new_paid_credits, account.paid_credits);
                    }
                    PoolSelection::ProductFree | PoolSelection::ProductPaid => {
                        prop_assert_eq!(plan.new_paid_credits, account.paid_credits);
                    }
                }
            }
        }
    }
}
