pub mod account_service;
pub mod audit_service;
pub mod billing_service;
pub mod credit_policy;
pub mod ledger_service;
pub mod payment;
pub mod purchase_service;
pub mod webhook_service;

pub use account_service::{AccountProfile, AccountService};
pub use audit_service::AuditService;
pub use billing_service::BillingService;
pub use ledger_service::{
    ChargeCommand, ChargeOutcome, CreditCommand, CreditOutcome, LedgerService,
};
pub use purchase_service::PurchaseService;
pub use webhook_service::{WebhookDisposition, WebhookService};
