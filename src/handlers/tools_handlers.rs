use actix_web::{HttpResponse, post, web};

use crate::error::AppError;
use crate::handlers::billing_handlers::charge_response;
use crate::models::billing::ToolChargeRequest;
use crate::services::ledger_service::{ChargeCommand, LedgerService};

/// Product-scoped charge. Draws from the product's pools first and falls
/// back to the account's main paid pool.
#[post("/charge")]
pub async fn tool_charge(
    payload: web::Json<ToolChargeRequest>,
    ledger: web::Data<LedgerService>,
) -> Result<HttpResponse, AppError> {
    let request = payload.into_inner();
    let outcome = ledger
        .charge(ChargeCommand {
            identity: request.identity,
            amount_minor: request.amount_minor,
            currency: request.currency,
            description: request.description,
            idempotency_key: request.idempotency_key,
            metadata: request.metadata,
            product_type: Some(request.product_type),
        })
        .await?;
    Ok(charge_response(outcome))
}
