use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::identity::AccountIdentity;

/// What it would cost to buy more uses, attached to denial responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseHint {
    pub price_minor: i64,
    pub uses: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreditCheckRequest {
    #[serde(flatten)]
    pub identity: AccountIdentity,
    pub customer_email: Option<String>,
    pub agent_id: Option<String>,
    pub channel_id: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditCheckResponse {
    pub has_credit: bool,
    pub credits_remaining: i64,
    pub free_uses_remaining: i64,
    pub total_uses: i64,
    pub plan_name: String,
    pub purchase_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_price_minor: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_uses: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargeRequest {
    #[serde(flatten)]
    pub identity: AccountIdentity,
    pub amount_minor: i64,
    pub currency: Option<String>,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
    pub metadata: Option<JsonValue>,
}

/// Product-scoped charge accepted on the tools surface.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolChargeRequest {
    #[serde(flatten)]
    pub identity: AccountIdentity,
    pub product_type: String,
    pub amount_minor: i64,
    pub currency: Option<String>,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargeResponse {
    pub charge_id: Uuid,
    pub account_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
    pub balance_before: i64,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreditRequest {
    #[serde(flatten)]
    pub identity: AccountIdentity,
    pub amount_minor: i64,
    pub transaction_type: Option<String>,
    pub external_transaction_id: Option<String>,
    pub currency: Option<String>,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditResponse {
    pub credit_id: Uuid,
    pub account_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub transaction_type: String,
    pub external_transaction_id: Option<String>,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
    pub balance_before: i64,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountUpsertRequest {
    #[serde(flatten)]
    pub identity: AccountIdentity,
    pub currency: Option<String>,
    pub plan_name: Option<String>,
    pub customer_email: Option<String>,
    pub marketing_opt_in: Option<bool>,
    pub marketing_opt_in_source: Option<String>,
    pub user_role: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountResponse {
    pub account_id: Uuid,
    pub oauth_provider: String,
    pub external_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wa_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub paid_credits: i64,
    pub free_uses_remaining: i64,
    pub balance_minor: i64,
    pub currency: String,
    pub plan_name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseRequest {
    #[serde(flatten)]
    pub identity: AccountIdentity,
    pub customer_email: Option<String>,
    pub return_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseResponse {
    pub payment_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    pub uses_purchased: i64,
    pub status: String,
}

impl From<crate::db::repositories::Charge> for ChargeResponse {
    fn from(charge: crate::db::repositories::Charge) -> Self {
        Self {
            charge_id: charge.charge_id,
            account_id: charge.account_id,
            amount_minor: charge.amount_minor,
            currency: charge.currency,
            description: charge.description,
            idempotency_key: charge.idempotency_key,
            balance_before: charge.balance_before,
            balance_after: charge.balance_after,
            created_at: charge.created_at,
        }
    }
}

impl From<crate::db::repositories::Credit> for CreditResponse {
    fn from(credit: crate::db::repositories::Credit) -> Self {
        Self {
            credit_id: credit.credit_id,
            account_id: credit.account_id,
            amount_minor: credit.amount_minor,
            currency: credit.currency,
            transaction_type: credit.transaction_type,
            external_transaction_id: credit.external_transaction_id,
            description: credit.description,
            idempotency_key: credit.idempotency_key,
            balance_before: credit.balance_before,
            balance_after: credit.balance_after,
            created_at: credit.created_at,
        }
    }
}

impl From<crate::db::repositories::Account> for AccountResponse {
    fn from(account: crate::db::repositories::Account) -> Self {
        Self {
            account_id: account.account_id,
            oauth_provider: account.oauth_provider,
            external_id: account.external_id,
            wa_id: account.wa_id,
            tenant_id: account.tenant_id,
            paid_credits: account.paid_credits,
            free_uses_remaining: account.free_uses_remaining,
            balance_minor: account.balance_minor,
            currency: account.currency,
            plan_name: account.plan_name,
            status: account.status,
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}

impl From<crate::db::repositories::PaymentRecord> for PurchaseResponse {
    fn from(record: crate::db::repositories::PaymentRecord) -> Self {
        Self {
            payment_id: record.payment_id,
            client_secret: record.client_secret,
            amount_minor: record.amount_minor,
            currency: record.currency,
            uses_purchased: record.uses_purchased,
            status: record.status,
        }
    }
}
