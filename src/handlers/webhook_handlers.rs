use actix_web::{HttpRequest, HttpResponse, post, web};
use log::info;

use crate::error::AppError;
use crate::services::webhook_service::WebhookService;

/// Provider-signed event ingress. Authenticates by signature only; a
/// verified event is acknowledged with 2xx even when it is ignored.
#[post("/webhooks/{provider}")]
pub async fn provider_webhook(
    req: HttpRequest,
    body: web::Bytes,
    path: web::Path<String>,
    webhooks: web::Data<WebhookService>,
) -> Result<HttpResponse, AppError> {
    let provider = path.into_inner();
    let header_name = webhooks.signature_header();
    let signature = req
        .headers()
        .get(header_name)
        .ok_or_else(|| AppError::SignatureInvalid(format!("Missing {} header", header_name)))?
        .to_str()
        .map_err(|_| AppError::SignatureInvalid(format!("Invalid {} header", header_name)))?;

    let disposition = webhooks.process(&provider, &body, signature).await?;
    info!("Webhook from {} processed: {}", provider, disposition.as_str());

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "received": true,
        "result": disposition.as_str(),
    })))
}
