use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::AppError;

const INVENTORY_COLUMNS: &str = "account_id, product_type, free_remaining, paid_credits, \
     last_daily_refresh, total_uses, created_at, updated_at";

/// Per-account, per-product sub-ledger. Rows come into existence the
/// first time a product is charged for an account.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProductInventory {
    pub account_id: Uuid,
    pub product_type: String,
    pub free_remaining: i64,
    pub paid_credits: i64,
    pub last_daily_refresh: Option<DateTime<Utc>>,
    pub total_uses: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit of product charges.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProductUsage {
    pub usage_id: Uuid,
    pub account_id: Uuid,
    pub product_type: String,
    pub amount_minor: i64,
    pub pool: String,
    pub idempotency_key: Option<String>,
    pub metadata: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProductInventoryRepository {
    pool: PgPool,
}

impl ProductInventoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find(
        &self,
        account_id: &Uuid,
        product_type: &str,
    ) -> Result<Option<ProductInventory>, AppError> {
        let query = format!(
            "SELECT {} FROM product_inventory WHERE account_id = $1 AND product_type = $2",
            INVENTORY_COLUMNS
        );
        let result = sqlx::query_as::<_, ProductInventory>(&query)
            .bind(account_id)
            .bind(product_type)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::Database(format!("Failed to find product inventory: {}", e))
            })?;

        Ok(result)
    }

    /// Whether any product pool for the account still has free or paid
    /// units, for the authorization decision.
    pub async fn pool_summary(&self, account_id: &Uuid) -> Result<(bool, bool), AppError> {
        let row: (bool, bool) = sqlx::query_as(
            "SELECT COALESCE(BOOL_OR(free_remaining > 0), FALSE), \
             COALESCE(BOOL_OR(paid_credits > 0), FALSE) \
             FROM product_inventory WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::Database(format!("Failed to summarise product inventory: {}", e))
        })?;

        Ok(row)
    }

    /// Seeds an empty inventory row for the product if none exists yet.
    pub async fn upsert_with_executor(
        &self,
        account_id: &Uuid,
        product_type: &str,
        executor: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO product_inventory (account_id, product_type, free_remaining, \
             paid_credits, total_uses, created_at, updated_at) \
             VALUES ($1, $2, 0, 0, 0, NOW(), NOW()) \
             ON CONFLICT (account_id, product_type) DO NOTHING",
        )
        .bind(account_id)
        .bind(product_type)
        .execute(&mut **executor)
        .await
        .map_err(|e| AppError::Database(format!("Failed to upsert product inventory: {}", e)))?;

        Ok(())
    }

    pub async fn lock_for_update(
        &self,
        account_id: &Uuid,
        product_type: &str,
        executor: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<Option<ProductInventory>, AppError> {
        let query = format!(
            "SELECT {} FROM product_inventory WHERE account_id = $1 AND product_type = $2 FOR UPDATE",
            INVENTORY_COLUMNS
        );
        let result = sqlx::query_as::<_, ProductInventory>(&query)
            .bind(account_id)
            .bind(product_type)
            .fetch_optional(&mut **executor)
            .await
            .map_err(|e| {
                AppError::Database(format!("Failed to lock product inventory: {}", e))
            })?;

        Ok(result)
    }

    pub async fn update_pools_with_executor(
        &self,
        account_id: &Uuid,
        product_type: &str,
        free_remaining: i64,
        paid_credits: i64,
        executor: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<ProductInventory, AppError> {
        let query = format!(
            "UPDATE product_inventory \
             SET free_remaining = $3, paid_credits = $4, total_uses = total_uses + 1, \
             updated_at = NOW() \
             WHERE account_id = $1 AND product_type = $2 \
             RETURNING {}",
            INVENTORY_COLUMNS
        );
        let result = sqlx::query_as::<_, ProductInventory>(&query)
            .bind(account_id)
            .bind(product_type)
            .bind(free_remaining)
            .bind(paid_credits)
            .fetch_one(&mut **executor)
            .await
            .map_err(|e| {
                AppError::Database(format!("Failed to update product inventory pools: {}", e))
            })?;

        Ok(result)
    }

    pub async fn insert_usage_with_executor(
        &self,
        usage: &ProductUsage,
        executor: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<ProductUsage, AppError> {
        let query = "INSERT INTO product_usage_log (usage_id, account_id, product_type, \
             amount_minor, pool, idempotency_key, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, NOW()) \
             RETURNING usage_id, account_id, product_type, amount_minor, pool, \
             idempotency_key, metadata, created_at";
        let result = sqlx::query_as::<_, ProductUsage>(query)
            .bind(usage.usage_id)
            .bind(usage.account_id)
            .bind(&usage.product_type)
            .bind(usage.amount_minor)
            .bind(&usage.pool)
            .bind(&usage.idempotency_key)
            .bind(&usage.metadata)
            .fetch_one(&mut **executor)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    AppError::IdempotencyConflict(format!(
                        "product usage idempotency key already recorded: {}",
                        db.message()
                    ))
                }
                _ => AppError::Database(format!("Failed to insert product usage: {}", e)),
            })?;

        Ok(result)
    }
}
