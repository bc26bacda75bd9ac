use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::AppError;

/// One authorization decision. `account_id` is null when the identity had
/// no account at decision time; the identity columns still tag the entry.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CreditCheck {
    pub check_id: Uuid,
    pub account_id: Option<Uuid>,
    pub oauth_provider: String,
    pub external_id: String,
    pub wa_id: Option<String>,
    pub tenant_id: Option<String>,
    pub allowed: bool,
    pub pool: Option<String>,
    pub denial_reason: Option<String>,
    pub agent_id: Option<String>,
    pub channel_id: Option<String>,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreditCheckRepository {
    pool: PgPool,
}

impl CreditCheckRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, check: &CreditCheck) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO credit_checks (check_id, account_id, oauth_provider, external_id, \
             wa_id, tenant_id, allowed, pool, denial_reason, agent_id, channel_id, \
             request_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())",
        )
        .bind(check.check_id)
        .bind(check.account_id)
        .bind(&check.oauth_provider)
        .bind(&check.external_id)
        .bind(&check.wa_id)
        .bind(&check.tenant_id)
        .bind(check.allowed)
        .bind(&check.pool)
        .bind(&check.denial_reason)
        .bind(&check.agent_id)
        .bind(&check.channel_id)
        .bind(&check.request_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to insert credit check: {}", e)))?;

        Ok(())
    }
}
