use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::enums::TransactionType;

const CREDIT_COLUMNS: &str = "credit_id, account_id, amount_minor, currency, description, \
     transaction_type, external_transaction_id, idempotency_key, balance_before, \
     balance_after, created_at";

/// Immutable record of a balance addition.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Credit {
    pub credit_id: Uuid,
    pub account_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub description: Option<String>,
    pub transaction_type: String,
    pub external_transaction_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub balance_before: i64,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

impl Credit {
    pub fn transaction_type(&self) -> Result<TransactionType, AppError> {
        TransactionType::parse(&self.transaction_type)
    }
}

#[derive(Debug, Clone)]
pub struct CreditRepository {
    pool: PgPool,
}

impl CreditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert_with_executor(
        &self,
        credit: &Credit,
        executor: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<Credit, AppError> {
        let query = format!(
            "INSERT INTO credits (credit_id, account_id, amount_minor, currency, description, \
             transaction_type, external_transaction_id, idempotency_key, balance_before, \
             balance_after, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW()) \
             RETURNING {}",
            CREDIT_COLUMNS
        );
        let result = sqlx::query_as::<_, Credit>(&query)
            .bind(credit.credit_id)
            .bind(credit.account_id)
            .bind(credit.amount_minor)
            .bind(&credit.currency)
            .bind(&credit.description)
            .bind(&credit.transaction_type)
            .bind(&credit.external_transaction_id)
            .bind(&credit.idempotency_key)
            .bind(credit.balance_before)
            .bind(credit.balance_after)
            .fetch_one(&mut **executor)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    AppError::IdempotencyConflict(format!(
                        "credit idempotency key already recorded: {}",
                        db.message()
                    ))
                }
                _ => AppError::Database(format!("Failed to insert credit: {}", e)),
            })?;

        Ok(result)
    }

    pub async fn find_by_idempotency_key(
        &self,
        account_id: &Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Credit>, AppError> {
        let query = format!(
            "SELECT {} FROM credits WHERE account_id = $1 AND idempotency_key = $2",
            CREDIT_COLUMNS
        );
        let result = sqlx::query_as::<_, Credit>(&query)
            .bind(account_id)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::Database(format!("Failed to find credit by idempotency key: {}", e))
            })?;

        Ok(result)
    }

    pub async fn find_by_external_transaction_id(
        &self,
        external_transaction_id: &str,
    ) -> Result<Option<Credit>, AppError> {
        let query = format!(
            "SELECT {} FROM credits WHERE external_transaction_id = $1",
            CREDIT_COLUMNS
        );
        let result = sqlx::query_as::<_, Credit>(&query)
            .bind(external_transaction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::Database(format!(
                    "Failed to find credit by external transaction id: {}",
                    e
                ))
            })?;

        Ok(result)
    }

    pub async fn find_by_id_with_executor(
        &self,
        credit_id: &Uuid,
        executor: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<Option<Credit>, AppError> {
        let query = format!("SELECT {} FROM credits WHERE credit_id = $1", CREDIT_COLUMNS);
        let result = sqlx::query_as::<_, Credit>(&query)
            .bind(credit_id)
            .fetch_optional(&mut **executor)
            .await
            .map_err(|e| AppError::Database(format!("Failed to find credit by id: {}", e)))?;

        Ok(result)
    }
}
