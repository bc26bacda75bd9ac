use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::AppError;

const CHARGE_COLUMNS: &str = "charge_id, account_id, amount_minor, currency, description, \
     idempotency_key, metadata, balance_before, balance_after, created_at";

/// Immutable record of a usage deduction. Rows are append-only; there is
/// no update or delete path.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Charge {
    pub charge_id: Uuid,
    pub account_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
    pub metadata: Option<JsonValue>,
    pub balance_before: i64,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChargeRepository {
    pool: PgPool,
}

impl ChargeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert_with_executor(
        &self,
        charge: &Charge,
        executor: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<Charge, AppError> {
        let query = format!(
            "INSERT INTO charges (charge_id, account_id, amount_minor, currency, description, \
             idempotency_key, metadata, balance_before, balance_after, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW()) \
             RETURNING {}",
            CHARGE_COLUMNS
        );
        let result = sqlx::query_as::<_, Charge>(&query)
            .bind(charge.charge_id)
            .bind(charge.account_id)
            .bind(charge.amount_minor)
            .bind(&charge.currency)
            .bind(&charge.description)
            .bind(&charge.idempotency_key)
            .bind(&charge.metadata)
            .bind(charge.balance_before)
            .bind(charge.balance_after)
            .fetch_one(&mut **executor)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    AppError::IdempotencyConflict(format!(
                        "charge idempotency key already recorded: {}",
                        db.message()
                    ))
                }
                _ => AppError::Database(format!("Failed to insert charge: {}", e)),
            })?;

        Ok(result)
    }

    pub async fn find_by_idempotency_key(
        &self,
        account_id: &Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Charge>, AppError> {
        let query = format!(
            "SELECT {} FROM charges WHERE account_id = $1 AND idempotency_key = $2",
            CHARGE_COLUMNS
        );
        let result = sqlx::query_as::<_, Charge>(&query)
            .bind(account_id)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::Database(format!("Failed to find charge by idempotency key: {}", e))
            })?;

        Ok(result)
    }

    pub async fn find_by_id_with_executor(
        &self,
        charge_id: &Uuid,
        executor: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<Option<Charge>, AppError> {
        let query = format!("SELECT {} FROM charges WHERE charge_id = $1", CHARGE_COLUMNS);
        let result = sqlx::query_as::<_, Charge>(&query)
            .bind(charge_id)
            .fetch_optional(&mut **executor)
            .await
            .map_err(|e| AppError::Database(format!("Failed to find charge by id: {}", e)))?;

        Ok(result)
    }

    pub async fn count_for_account(&self, account_id: &Uuid) -> Result<i64, AppError> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM charges WHERE account_id = $1")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::Database(format!("Failed to count charges: {}", e)))?;

        Ok(count.0)
    }
}
