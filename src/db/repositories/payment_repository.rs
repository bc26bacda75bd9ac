use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::enums::PaymentStatus;

const PAYMENT_COLUMNS: &str = "payment_id, provider, external_transaction_id, account_id, \
     amount_minor, currency, uses_purchased, status, client_secret, failure_reason, \
     fulfilled_by_credit_id, created_at, updated_at";

/// Provider-side payment state mirrored per external transaction id.
/// The unique index on (provider, external_transaction_id) is what makes
/// double fulfilment impossible.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: Uuid,
    pub provider: String,
    pub external_transaction_id: String,
    pub account_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub uses_purchased: i64,
    pub status: String,
    pub client_secret: Option<String>,
    pub failure_reason: Option<String>,
    pub fulfilled_by_credit_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn status(&self) -> Result<PaymentStatus, AppError> {
        PaymentStatus::parse(&self.status)
    }

    pub fn is_fulfilled(&self) -> bool {
        self.fulfilled_by_credit_id.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: &PaymentRecord) -> Result<PaymentRecord, AppError> {
        let query = format!(
            "INSERT INTO payments (payment_id, provider, external_transaction_id, account_id, \
             amount_minor, currency, uses_purchased, status, client_secret, failure_reason, \
             fulfilled_by_credit_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW()) \
             RETURNING {}",
            PAYMENT_COLUMNS
        );
        let result = sqlx::query_as::<_, PaymentRecord>(&query)
            .bind(record.payment_id)
            .bind(&record.provider)
            .bind(&record.external_transaction_id)
            .bind(record.account_id)
            .bind(record.amount_minor)
            .bind(&record.currency)
            .bind(record.uses_purchased)
            .bind(&record.status)
            .bind(&record.client_secret)
            .bind(&record.failure_reason)
            .bind(record.fulfilled_by_credit_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    AppError::IdempotencyConflict(format!(
                        "payment already recorded for this external transaction: {}",
                        db.message()
                    ))
                }
                _ => AppError::Database(format!("Failed to insert payment: {}", e)),
            })?;

        Ok(result)
    }

    pub async fn find_by_external_id(
        &self,
        provider: &str,
        external_transaction_id: &str,
    ) -> Result<Option<PaymentRecord>, AppError> {
        let query = format!(
            "SELECT {} FROM payments WHERE provider = $1 AND external_transaction_id = $2",
            PAYMENT_COLUMNS
        );
        let result = sqlx::query_as::<_, PaymentRecord>(&query)
            .bind(provider)
            .bind(external_transaction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::Database(format!("Failed to find payment by external id: {}", e))
            })?;

        Ok(result)
    }

    pub async fn find_by_payment_id(
        &self,
        payment_id: &Uuid,
    ) -> Result<Option<PaymentRecord>, AppError> {
        let query = format!(
            "SELECT {} FROM payments WHERE payment_id = $1",
            PAYMENT_COLUMNS
        );
        let result = sqlx::query_as::<_, PaymentRecord>(&query)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to find payment: {}", e)))?;

        Ok(result)
    }

    pub async fn update_status(
        &self,
        payment_id: &Uuid,
        status: PaymentStatus,
    ) -> Result<PaymentRecord, AppError> {
        let query = format!(
            "UPDATE payments SET status = $2, updated_at = NOW() WHERE payment_id = $1 \
             RETURNING {}",
            PAYMENT_COLUMNS
        );
        let result = sqlx::query_as::<_, PaymentRecord>(&query)
            .bind(payment_id)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to update payment status: {}", e)))?;

        Ok(result)
    }

    /// Marks the payment fulfilled by linking the credit row that recorded
    /// it. The WHERE guard keeps an already-fulfilled record untouched.
    pub async fn mark_succeeded(
        &self,
        provider: &str,
        external_transaction_id: &str,
        credit_id: &Uuid,
    ) -> Result<Option<PaymentRecord>, AppError> {
        let query = format!(
            "UPDATE payments \
             SET status = 'succeeded', fulfilled_by_credit_id = $3, updated_at = NOW() \
             WHERE provider = $1 AND external_transaction_id = $2 \
             AND fulfilled_by_credit_id IS NULL \
             RETURNING {}",
            PAYMENT_COLUMNS
        );
        let result = sqlx::query_as::<_, PaymentRecord>(&query)
            .bind(provider)
            .bind(external_transaction_id)
            .bind(credit_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::Database(format!("Failed to mark payment succeeded: {}", e))
            })?;

        Ok(result)
    }

    pub async fn mark_failed(
        &self,
        provider: &str,
        external_transaction_id: &str,
        reason: Option<&str>,
    ) -> Result<Option<PaymentRecord>, AppError> {
        let query = format!(
            "UPDATE payments \
             SET status = 'failed', failure_reason = $3, updated_at = NOW() \
             WHERE provider = $1 AND external_transaction_id = $2 \
             AND fulfilled_by_credit_id IS NULL \
             RETURNING {}",
            PAYMENT_COLUMNS
        );
        let result = sqlx::query_as::<_, PaymentRecord>(&query)
            .bind(provider)
            .bind(external_transaction_id)
            .bind(reason)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to mark payment failed: {}", e)))?;

        Ok(result)
    }
}
