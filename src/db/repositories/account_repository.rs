use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::enums::AccountStatus;
use crate::models::identity::AccountIdentity;

const ACCOUNT_COLUMNS: &str = "account_id, oauth_provider, external_id, wa_id, tenant_id, \
     paid_credits, free_uses_remaining, balance_minor, currency, plan_name, status, \
     customer_email, marketing_opt_in, marketing_opt_in_at, marketing_opt_in_source, \
     user_role, agent_id, created_at, updated_at";

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Account {
    pub account_id: Uuid,
    pub oauth_provider: String,
    pub external_id: String,
    pub wa_id: Option<String>,
    pub tenant_id: Option<String>,
    pub paid_credits: i64,
    pub free_uses_remaining: i64,
    pub balance_minor: i64,
    pub currency: String,
    pub plan_name: String,
    pub status: String,
    pub customer_email: Option<String>,
    pub marketing_opt_in: Option<bool>,
    pub marketing_opt_in_at: Option<DateTime<Utc>>,
    pub marketing_opt_in_source: Option<String>,
    pub user_role: Option<String>,
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn status(&self) -> Result<AccountStatus, AppError> {
        AccountStatus::parse(&self.status)
    }

    /// Balance shown to callers and recorded on charge rows.
    pub fn displayed_balance(&self) -> i64 {
        self.paid_credits + self.balance_minor
    }

    pub fn identity(&self) -> AccountIdentity {
        AccountIdentity {
            oauth_provider: self.oauth_provider.clone(),
            external_id: self.external_id.clone(),
            wa_id: self.wa_id.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }
}

/// Initial values applied when an identity is first observed. Existing
/// rows are never modified by an upsert.
#[derive(Debug, Clone)]
pub struct AccountSeed {
    pub free_uses_remaining: i64,
    pub currency: String,
    pub plan_name: String,
    pub customer_email: Option<String>,
    pub marketing_opt_in: Option<bool>,
    pub marketing_opt_in_source: Option<String>,
    pub user_role: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AccountRepository {
    pool: PgPool,
}

impl AccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn find_by_identity(
        &self,
        identity: &AccountIdentity,
    ) -> Result<Option<Account>, AppError> {
        let query = format!(
            "SELECT {} FROM accounts WHERE oauth_provider = $1 AND external_id = $2",
            ACCOUNT_COLUMNS
        );
        let result = sqlx::query_as::<_, Account>(&query)
            .bind(&identity.oauth_provider)
            .bind(&identity.external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to find account by identity: {}", e)))?;

        Ok(result)
    }

    pub async fn find_by_id(&self, account_id: &Uuid) -> Result<Option<Account>, AppError> {
        let query = format!(
            "SELECT {} FROM accounts WHERE account_id = $1",
            ACCOUNT_COLUMNS
        );
        let result = sqlx::query_as::<_, Account>(&query)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to find account by id: {}", e)))?;

        Ok(result)
    }

    pub async fn find_by_id_with_executor(
        &self,
        account_id: &Uuid,
        executor: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<Option<Account>, AppError> {
        let query = format!(
            "SELECT {} FROM accounts WHERE account_id = $1",
            ACCOUNT_COLUMNS
        );
        let result = sqlx::query_as::<_, Account>(&query)
            .bind(account_id)
            .fetch_optional(&mut **executor)
            .await
            .map_err(|e| AppError::Database(format!("Failed to find account by id: {}", e)))?;

        Ok(result)
    }

    /// Insert-if-absent on the identity key. A pre-existing row is returned
    /// untouched; the seed only applies to the inserted row.
    pub async fn upsert(
        &self,
        identity: &AccountIdentity,
        seed: &AccountSeed,
    ) -> Result<Account, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(format!("Failed to begin transaction: {}", e)))?;
        let result = self.upsert_with_executor(identity, seed, &mut tx).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::Database(format!("Failed to commit transaction: {}", e)))?;
        Ok(result)
    }

    pub async fn upsert_with_executor(
        &self,
        identity: &AccountIdentity,
        seed: &AccountSeed,
        executor: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<Account, AppError> {
        let query = format!(
            "INSERT INTO accounts (account_id, oauth_provider, external_id, wa_id, tenant_id, \
             paid_credits, free_uses_remaining, balance_minor, currency, plan_name, status, \
             customer_email, marketing_opt_in, marketing_opt_in_at, marketing_opt_in_source, \
             user_role, agent_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, 0, $6, 0, $7, $8, 'active', $9, $10, \
             CASE WHEN COALESCE($10, FALSE) THEN NOW() ELSE NULL END, $11, $12, $13, NOW(), NOW()) \
             ON CONFLICT (oauth_provider, external_id) DO NOTHING \
             RETURNING {}",
            ACCOUNT_COLUMNS
        );
        let inserted = sqlx::query_as::<_, Account>(&query)
            .bind(Uuid::new_v4())
            .bind(&identity.oauth_provider)
            .bind(&identity.external_id)
            .bind(&identity.wa_id)
            .bind(&identity.tenant_id)
            .bind(seed.free_uses_remaining)
            .bind(&seed.currency)
            .bind(&seed.plan_name)
            .bind(&seed.customer_email)
            .bind(seed.marketing_opt_in)
            .bind(&seed.marketing_opt_in_source)
            .bind(&seed.user_role)
            .bind(&seed.agent_id)
            .fetch_optional(&mut **executor)
            .await
            .map_err(|e| AppError::Database(format!("Failed to upsert account: {}", e)))?;

        if let Some(account) = inserted {
            return Ok(account);
        }

        // Conflict path: the identity already exists, return it as-is.
        let query = format!(
            "SELECT {} FROM accounts WHERE oauth_provider = $1 AND external_id = $2",
            ACCOUNT_COLUMNS
        );
        sqlx::query_as::<_, Account>(&query)
            .bind(&identity.oauth_provider)
            .bind(&identity.external_id)
            .fetch_optional(&mut **executor)
            .await
            .map_err(|e| AppError::Database(format!("Failed to load existing account: {}", e)))?
            .ok_or_else(|| {
                AppError::DataIntegrity(format!(
                    "account vanished between upsert and select: {}/{}",
                    identity.oauth_provider, identity.external_id
                ))
            })
    }

    /// Reads the account row while taking an exclusive row lock held until
    /// the enclosing transaction commits or rolls back.
    pub async fn lock_for_update(
        &self,
        account_id: &Uuid,
        executor: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<Option<Account>, AppError> {
        let query = format!(
            "SELECT {} FROM accounts WHERE account_id = $1 FOR UPDATE",
            ACCOUNT_COLUMNS
        );
        let result = sqlx::query_as::<_, Account>(&query)
            .bind(account_id)
            .fetch_optional(&mut **executor)
            .await
            .map_err(|e| AppError::Database(format!("Failed to lock account for update: {}", e)))?;

        Ok(result)
    }

    pub async fn update_balances_with_executor(
        &self,
        account_id: &Uuid,
        paid_credits: i64,
        free_uses_remaining: i64,
        balance_minor: i64,
        executor: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<Account, AppError> {
        let query = format!(
            "UPDATE accounts \
             SET paid_credits = $2, free_uses_remaining = $3, balance_minor = $4, updated_at = NOW() \
             WHERE account_id = $1 \
             RETURNING {}",
            ACCOUNT_COLUMNS
        );
        let result = sqlx::query_as::<_, Account>(&query)
            .bind(account_id)
            .bind(paid_credits)
            .bind(free_uses_remaining)
            .bind(balance_minor)
            .fetch_one(&mut **executor)
            .await
            .map_err(|e| AppError::Database(format!("Failed to update account balances: {}", e)))?;

        Ok(result)
    }

    pub async fn set_status(
        &self,
        account_id: &Uuid,
        status: AccountStatus,
    ) -> Result<Account, AppError> {
        let query = format!(
            "UPDATE accounts SET status = $2, updated_at = NOW() WHERE account_id = $1 RETURNING {}",
            ACCOUNT_COLUMNS
        );
        let result = sqlx::query_as::<_, Account>(&query)
            .bind(account_id)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to set account status: {}", e)))?;

        Ok(result)
    }
}
