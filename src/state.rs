use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::{
    config::AppConfig,
    db::create_pool,
    error::AppError,
    services::{rent_store::PgRentStore, stripe::StripeGateway},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let db_pool = create_pool(&config)?;
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.processor_timeout_seconds.max(1)))
            .user_agent(format!("{}/{}", config.app_name, env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            config: Arc::new(config),
            db_pool,
            http_client,
        })
    }

    pub fn db_pool(&self) -> Result<&PgPool, AppError> {
        self.db_pool.as_ref().ok_or_else(|| {
            AppError::Dependency(
                "Supabase database is not configured. Set SUPABASE_DB_URL or DATABASE_URL."
                    .to_string(),
            )
        })
    }

    pub fn rent_store(&self) -> Result<PgRentStore, AppError> {
        Ok(PgRentStore::new(self.db_pool()?.clone()))
    }

    pub fn payment_gateway(&self) -> StripeGateway {
        StripeGateway::new(self.http_client.clone(), &self.config)
    }
}
