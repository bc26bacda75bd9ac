use std::sync::Arc;

use log::warn;

use crate::db::connection::DatabasePools;
use crate::db::repositories::{CreditCheck, CreditCheckRepository};

/// Fire-and-forget writer for the credit-check audit log.
///
/// The log is never read by the engine; a failed write must not fail the
/// authorization decision that produced it.
#[derive(Debug, Clone)]
pub struct AuditService {
    checks: Arc<CreditCheckRepository>,
}

impl AuditService {
    pub fn new(pools: DatabasePools) -> Self {
        Self {
            checks: Arc::new(CreditCheckRepository::new(pools.primary.clone())),
        }
    }

    /// Appends the decision on a detached task, ordered after the decision
    /// itself but with no real-time bound.
    pub fn record_decision(&self, check: CreditCheck) {
        let checks = self.checks.clone();
        tokio::spawn(async move {
            if let Err(e) = checks.insert(&check).await {
                warn!(
                    "Failed to append credit check audit entry for {}/{}: {}",
                    check.oauth_provider, check.external_id, e
                );
            }
        });
    }
}
