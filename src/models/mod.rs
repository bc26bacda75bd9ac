pub mod billing;
pub mod enums;
pub mod identity;

pub use enums::{AccountStatus, CreditPool, PaymentStatus, TransactionType};
pub use identity::AccountIdentity;
