use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Lifecycle state of an account. Persisted as text with a matching CHECK
/// constraint; non-active accounts are refused service on the charge path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Suspended,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "active" => Ok(AccountStatus::Active),
            "suspended" => Ok(AccountStatus::Suspended),
            "closed" => Ok(AccountStatus::Closed),
            other => Err(AppError::DataIntegrity(format!(
                "unknown account status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Purchase,
    Refund,
    Grant,
    Transfer,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Purchase => "purchase",
            TransactionType::Refund => "refund",
            TransactionType::Grant => "grant",
            TransactionType::Transfer => "transfer",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "purchase" => Ok(TransactionType::Purchase),
            "refund" => Ok(TransactionType::Refund),
            "grant" => Ok(TransactionType::Grant),
            "transfer" => Ok(TransactionType::Transfer),
            other => Err(AppError::Validation(format!(
                "unknown transaction type: {}",
                other
            ))),
        }
    }
}

/// External payment lifecycle, mirrored from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    RequiresPaymentMethod,
    Processing,
    Succeeded,
    Canceled,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::RequiresPaymentMethod => "requires_payment_method",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "requires_payment_method" => Ok(PaymentStatus::RequiresPaymentMethod),
            "processing" => Ok(PaymentStatus::Processing),
            "succeeded" => Ok(PaymentStatus::Succeeded),
            "canceled" => Ok(PaymentStatus::Canceled),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(AppError::DataIntegrity(format!(
                "unknown payment status: {}",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Succeeded | PaymentStatus::Canceled | PaymentStatus::Failed
        )
    }
}

/// Pool recorded on an authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditPool {
    Free,
    Paid,
    None,
}

impl CreditPool {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditPool::Free => "free",
            CreditPool::Paid => "paid",
            CreditPool::None => "none",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_roundtrips_through_strings() {
        for status in [
            AccountStatus::Active,
            AccountStatus::Suspended,
            AccountStatus::Closed,
        ] {
            assert_eq!(AccountStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(AccountStatus::parse("deleted").is_err());
    }

    #[test]
    fn transaction_type_rejects_unknown_values() {
        assert!(TransactionType::parse("chargeback").is_err());
        assert_eq!(
            TransactionType::parse("purchase").unwrap(),
            TransactionType::Purchase
        );
    }

    #[test]
    fn payment_status_terminal_states() {
        assert!(PaymentStatus::Succeeded.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(!PaymentStatus::Processing.is_terminal());
        assert!(!PaymentStatus::RequiresPaymentMethod.is_terminal());
    }
}
