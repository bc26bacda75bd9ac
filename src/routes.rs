use actix_web::web;

use crate::handlers;

/// Configures the agent-facing billing surface under /v1.
///
/// Webhook routes authenticate by provider signature; API-key checks for
/// the other endpoints are performed by a preceding component.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/v1/billing")
            .service(handlers::billing_handlers::check_credits)
            .service(handlers::billing_handlers::create_charge)
            .service(handlers::billing_handlers::create_credit)
            .service(handlers::billing_handlers::upsert_account)
            .service(handlers::billing_handlers::get_account)
            .service(handlers::billing_handlers::create_purchase)
            .service(handlers::billing_handlers::get_purchase)
            .service(handlers::webhook_handlers::provider_webhook),
    );
    cfg.service(web::scope("/v1/tools").service(handlers::tools_handlers::tool_charge));
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, http::StatusCode, test};

    #[actix_web::test]
    async fn routes_mount_and_unknown_paths_fall_through() {
        let app = test::init_service(App::new().configure(configure_routes)).await;
        let req = test::TestRequest::get()
            .uri("/v1/billing/unknown")
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
