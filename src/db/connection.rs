use std::env;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::settings::DatabaseConfig;
use crate::error::AppError;

/// Connection pools for the two logical database endpoints.
#[derive(Debug, Clone)]
pub struct DatabasePools {
    /// Primary endpoint. Every mutation and every read that feeds a
    /// mutation decision goes here.
    pub primary: PgPool,
    /// Optional read replica for authorization-decision reads.
    pub replica: Option<PgPool>,
}

impl DatabasePools {
    /// Pool for reads that do not participate in a transaction. Falls back
    /// to the primary when no replica is configured.
    pub fn read_pool(&self) -> &PgPool {
        self.replica.as_ref().unwrap_or(&self.primary)
    }
}

/// Creates the primary pool and, when configured, the read-replica pool.
///
/// A replica that cannot be reached at startup is logged and skipped so
/// that policy reads fall back to the primary instead of blocking boot.
pub async fn create_pools(config: &DatabaseConfig) -> Result<DatabasePools, AppError> {
    let primary = create_pool(&config.url, "primary").await?;
    verify_connection(&primary).await?;

    let replica = match &config.read_url {
        Some(read_url) => match create_pool(read_url, "replica").await {
            Ok(pool) => match verify_connection(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    log::warn!(
                        "Read replica unreachable, policy reads will use the primary: {}",
                        e
                    );
                    None
                }
            },
            Err(e) => {
                log::warn!(
                    "Failed to create read replica pool, policy reads will use the primary: {}",
                    e
                );
                None
            }
        },
        None => None,
    };

    Ok(DatabasePools { primary, replica })
}

async fn create_pool(database_url: &str, pool_type: &str) -> Result<PgPool, AppError> {
    let max_connections = env::var("DB_POOL_MAX")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(20);

    let min_connections = env::var("DB_POOL_MIN")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(2);

    let acquire_timeout_ms = env::var("DB_POOL_ACQUIRE_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(2000);

    let idle_timeout_secs = env::var("DB_POOL_IDLE_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(60);

    let max_lifetime_secs = env::var("DB_POOL_MAX_LIFETIME_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(1800);

    let statement_timeout_ms = env::var("DB_STATEMENT_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(8000);

    // Try to connect with retries
    let max_retries = 3;
    let mut last_error = None;

    for attempt in 1..=max_retries {
        log::info!(
            "Database {} pool connection attempt {} of {}",
            pool_type,
            attempt,
            max_retries
        );

        match PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_millis(acquire_timeout_ms))
            .idle_timeout(Duration::from_secs(idle_timeout_secs))
            .max_lifetime(Duration::from_secs(max_lifetime_secs))
            .test_before_acquire(true)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET TIME ZONE 'UTC'")
                        .execute(&mut *conn)
                        .await?;
                    if let Err(err) =
                        sqlx::query(&format!("SET statement_timeout TO '{}ms'", statement_timeout_ms))
                            .execute(&mut *conn)
                            .await
                    {
                        log::warn!("Unable to set statement_timeout: {}", err);
                    }
                    Ok(())
                })
            })
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                log::info!(
                    "{} pool connected - max: {}, min: {}, acquire_timeout: {}ms",
                    pool_type,
                    max_connections,
                    min_connections,
                    acquire_timeout_ms
                );
                return Ok(pool);
            }
            Err(e) => {
                log::warn!(
                    "Database {} pool connection attempt {} failed: {}",
                    pool_type,
                    attempt,
                    e
                );

                if e.to_string().contains("authentication failed") {
                    log::error!(
                        "Database authentication failed for {} pool. Please check the connection URL credentials.",
                        pool_type
                    );
                    return Err(AppError::Database(e.to_string()));
                }

                last_error = Some(e);

                if attempt < max_retries {
                    let delay = Duration::from_secs(2 * attempt as u64);
                    log::info!(
                        "Retrying {} pool in {} seconds...",
                        pool_type,
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    let error = last_error.unwrap_or_else(|| {
        sqlx::Error::Configuration(
            format!("Unknown database connection error for {} pool", pool_type).into(),
        )
    });

    log::error!(
        "All database {} pool connection attempts failed: {}",
        pool_type,
        error
    );

    Err(AppError::Database(error.to_string()))
}

/// Verifies the database connection by executing a simple query.
/// This is useful for health checks and ensuring the database is accessible.
pub async fn verify_connection(pool: &PgPool) -> Result<(), AppError> {
    // Using a raw query instead of the macro to avoid compile-time database checks
    sqlx::query_as::<_, (i32,)>("SELECT 1 as result")
        .fetch_optional(pool)
        .await
        .map(|_| {
            log::debug!("Database connection verified");
        })
        .map_err(|e| {
            log::error!("Database connection verification failed: {}", e);
            AppError::Database(e.to_string())
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_verify_connection() {
        // This test will only run if DATABASE_URL is set in the environment
        if let Ok(url) = env::var("DATABASE_URL") {
            let config = DatabaseConfig {
                url,
                read_url: None,
            };
            if let Ok(pools) = create_pools(&config).await {
                let _result = verify_connection(&pools.primary).await;
                // We don't assert result.is_ok() because it depends on the database being available
            }
        }
    }
}
