use actix_web::{HttpResponse, get, post, web};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::billing::{
    AccountResponse, AccountUpsertRequest, ChargeRequest, ChargeResponse, CreditCheckRequest,
    CreditRequest, CreditResponse, PurchaseRequest, PurchaseResponse,
};
use crate::models::enums::TransactionType;
use crate::services::billing_service::BillingService;
use crate::services::ledger_service::{
    ChargeCommand, ChargeOutcome, CreditCommand, CreditOutcome, LedgerService,
};
use crate::services::purchase_service::PurchaseService;

/// Authorization decision for the identity in the body.
#[post("/credits/check")]
pub async fn check_credits(
    payload: web::Json<CreditCheckRequest>,
    billing: web::Data<BillingService>,
) -> Result<HttpResponse, AppError> {
    let response = billing.check_credits(payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[post("/charges")]
pub async fn create_charge(
    payload: web::Json<ChargeRequest>,
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
            product_type: None,
        })
        .await?;
    Ok(charge_response(outcome))
}

/// Renders a charge outcome: 201 for a fresh charge, 409 with the
/// existing row's id when an idempotency key replayed.
pub(crate) fn charge_response(outcome: ChargeOutcome) -> HttpResponse {
    let body = ChargeResponse::from(outcome.charge);
    if outcome.replayed {
        HttpResponse::Conflict()
            .insert_header(("X-Existing-Charge-ID", body.charge_id.to_string()))
            .json(body)
    } else {
        HttpResponse::Created().json(body)
    }
}

fn credit_response(outcome: CreditOutcome) -> HttpResponse {
    let body = CreditResponse::from(outcome.credit);
    if outcome.replayed {
        HttpResponse::Conflict()
            .insert_header(("X-Existing-Credit-ID", body.credit_id.to_string()))
            .json(body)
    } else {
        HttpResponse::Created().json(body)
    }
}

/// Administrative / internal credit addition.
#[post("/credits")]
pub async fn create_credit(
    payload: web::Json<CreditRequest>,
    ledger: web::Data<LedgerService>,
) -> Result<HttpResponse, AppError> {
    let request = payload.into_inner();
    let transaction_type = match &request.transaction_type {
        Some(value) => TransactionType::parse(value)?,
        None => TransactionType::Grant,
    };
    let outcome = ledger
        .credit(CreditCommand {
            identity: request.identity,
            amount_minor: request.amount_minor,
            transaction_type,
            external_transaction_id: request.external_transaction_id,
            currency: request.currency,
            description: request.description,
            idempotency_key: request.idempotency_key,
            customer_email: request.customer_email,
        })
        .await?;
    Ok(credit_response(outcome))
}

#[post("/accounts")]
pub async fn upsert_account(
    payload: web::Json<AccountUpsertRequest>,
    billing: web::Data<BillingService>,
) -> Result<HttpResponse, AppError> {
    let account = billing.upsert_account(payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(AccountResponse::from(account)))
}

#[get("/accounts/{provider}/{external_id}")]
pub async fn get_account(
    path: web::Path<(String, String)>,
    billing: web::Data<BillingService>,
) -> Result<HttpResponse, AppError> {
    let (provider, external_id) = path.into_inner();
    let account = billing.get_account(&provider, &external_id).await?;
    Ok(HttpResponse::Ok().json(AccountResponse::from(account)))
}

/// Creates a payment intent with the configured provider.
#[post("/purchases")]
pub async fn create_purchase(
    payload: web::Json<PurchaseRequest>,
    purchases: web::Data<PurchaseService>,
) -> Result<HttpResponse, AppError> {
    let record = purchases.create_purchase(payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(PurchaseResponse::from(record)))
}

#[get("/purchases/{payment_id}")]
pub async fn get_purchase(
    path: web::Path<Uuid>,
    purchases: web::Data<PurchaseService>,
) -> Result<HttpResponse, AppError> {
    let record = purchases.get_purchase(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(PurchaseResponse::from(record)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use crate::db::repositories::{Account, Charge, Credit};

    fn account() -> Account {
        Account {
            account_id: Uuid::new_v4(),
            oauth_provider: "oauth:google".to_string(),
            external_id: "u1".to_string(),
            wa_id: None,
            tenant_id: None,
            paid_credits: 0,
            free_uses_remaining: 2,
            balance_minor: 0,
            currency: "USD".to_string(),
            plan_name: "free".to_string(),
            status: "active".to_string(),
            customer_email: None,
            marketing_opt_in: None,
            marketing_opt_in_at: None,
            marketing_opt_in_source: None,
            user_role: None,
            agent_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn charge(charge_id: Uuid) -> Charge {
        Charge {
            charge_id,
            account_id: Uuid::new_v4(),
            amount_minor: 100,
            currency: "USD".to_string(),
            description: None,
            idempotency_key: Some("c1".to_string()),
            metadata: None,
            balance_before: 0,
            balance_after: 0,
            created_at: Utc::now(),
        }
    }

    fn credit(credit_id: Uuid) -> Credit {
        Credit {
            credit_id,
            account_id: Uuid::new_v4(),
            amount_minor: 50,
            currency: "USD".to_string(),
            description: None,
            transaction_type: "purchase".to_string(),
            external_transaction_id: Some("pi_X".to_string()),
            idempotency_key: Some("pi_X".to_string()),
            balance_before: 0,
            balance_after: 50,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn fresh_charge_renders_201_without_replay_header() {
        let response = charge_response(ChargeOutcome {
            charge: charge(Uuid::new_v4()),
            account: account(),
            replayed: false,
        });
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get("X-Existing-Charge-ID").is_none());
    }

    #[test]
    fn replayed_charge_renders_409_with_existing_id_header() {
        let charge_id = Uuid::new_v4();
        let response = charge_response(ChargeOutcome {
            charge: charge(charge_id),
            account: account(),
            replayed: true,
        });
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let header = response
            .headers()
            .get("X-Existing-Charge-ID")
            .expect("replay header");
        assert_eq!(header.to_str().unwrap(), charge_id.to_string());
    }

    #[test]
    fn replayed_credit_renders_409_with_existing_id_header() {
        let credit_id = Uuid::new_v4();
        let response = credit_response(CreditOutcome {
            credit: credit(credit_id),
            account: account(),
            replayed: true,
        });
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let header = response
            .headers()
            .get("X-Existing-Credit-ID")
            .expect("replay header");
        assert_eq!(header.to_str().unwrap(), credit_id.to_string());
    }
}
