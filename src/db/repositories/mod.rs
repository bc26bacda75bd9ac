pub mod account_repository;
pub mod charge_repository;
pub mod credit_check_repository;
pub mod credit_repository;
pub mod payment_repository;
pub mod product_inventory_repository;

pub use account_repository::{Account, AccountRepository, AccountSeed};
pub use charge_repository::{Charge, ChargeRepository};
pub use credit_check_repository::{CreditCheck, CreditCheckRepository};
pub use credit_repository::{Credit, CreditRepository};
pub use payment_repository::{PaymentRecord, PaymentRepository};
pub use product_inventory_repository::{
    ProductInventory, ProductInventoryRepository, ProductUsage,
};
