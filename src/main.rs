use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware::Logger, web};
use dotenv::dotenv;
use std::net::TcpListener;

mod config;
mod db;
mod error;
mod handlers;
mod models;
mod routes;
mod services;

use crate::config::AppSettings;
use crate::db::connection::{create_pools, verify_connection};
use crate::error::AppError;
use crate::routes::configure_routes;
use crate::services::billing_service::BillingService;
use crate::services::ledger_service::LedgerService;
use crate::services::payment::create_gateway;
use crate::services::purchase_service::PurchaseService;
use crate::services::webhook_service::WebhookService;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    // Load application settings from environment
    let app_settings = match AppSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Failed to load application settings from environment: {}", e);
            log::error!("Cannot start server without valid settings");
            std::process::exit(1);
        }
    };

    // Database connection setup
    let pools = match create_pools(&app_settings.database).await {
        Ok(pools) => {
            if let Err(e) = verify_connection(&pools.primary).await {
                log::error!("Database connection verification failed: {}", e);
                log::error!("Cannot start server without a working database connection");
                std::process::exit(1);
            }
            log::info!("Database connection established successfully");
            pools
        }
        Err(e) => {
            log::error!("Failed to create database connection pools: {}", e);
            log::error!("Cannot start server without a working database connection");
            std::process::exit(1);
        }
    };

    // Apply schema migrations embedded in the binary
    if let Err(e) = sqlx::migrate!("./migrations").run(&pools.primary).await {
        log::error!("Failed to run database migrations: {}", e);
        std::process::exit(1);
    }
    log::info!("Database migrations applied");

    // Select the payment gateway once for the process lifetime
    let gateway = match create_gateway(&app_settings) {
        Ok(gateway) => {
            log::info!(
                "Payment gateway initialized: {}",
                app_settings.payment.provider
            );
            gateway
        }
        Err(e) => {
            log::error!("Failed to initialize payment gateway: {}", e);
            std::process::exit(1);
        }
    };

    let host = &app_settings.server.host;
    let port = app_settings.server.port;
    log::info!("Starting server at http://{}:{}", host, port);

    let listener = TcpListener::bind(format!("{}:{}", host, port))?;

    HttpServer::new(move || {
        // Initialize services
        let billing_service = BillingService::new(pools.clone(), app_settings.clone());
        let ledger_service = LedgerService::new(pools.clone(), app_settings.billing.clone());
        let purchase_service = PurchaseService::new(
            pools.clone(),
            app_settings.billing.clone(),
            gateway.clone(),
        );
        let webhook_service = WebhookService::new(
            pools.clone(),
            app_settings.billing.clone(),
            gateway.clone(),
        );

        // Configure CORS using actix-cors
        let mut cors = Cors::default();
        if app_settings.server.cors_origins.contains(&"*".to_string()) {
            cors = cors.allow_any_origin();
        } else {
            for origin in &app_settings.server.cors_origins {
                cors = cors.allowed_origin(origin);
            }
        }
        cors = cors.allow_any_method().allow_any_header();

        App::new()
            .wrap(Logger::default())
            .wrap(cors)
            // Malformed bodies surface as 422 validation errors
            .app_data(web::JsonConfig::default().error_handler(|err, _req| {
                AppError::Validation(err.to_string()).into()
            }))
            .app_data(web::Data::new(pools.clone()))
            .app_data(web::Data::new(billing_service))
            .app_data(web::Data::new(ledger_service))
            .app_data(web::Data::new(purchase_service))
            .app_data(web::Data::new(webhook_service))
            // Health check endpoint without auth
            .service(
                web::resource("/health").route(web::get().to(handlers::health::health_check)),
            )
            .configure(configure_routes)
    })
    .listen(listener)?
    .run()
    .await
}
