use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::AppConfig;

/// Build a lazily-connecting pool so the API boots even when the database
/// is briefly unreachable; the health route reports the real state.
pub fn create_pool(config: &AppConfig) -> Result<Option<PgPool>, sqlx::Error> {
    let Some(url) = config.supabase_db_url.as_deref() else {
        tracing::warn!("No database URL configured; persistence routes will return 502");
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_max_connections.max(1))
        .min_connections(config.db_pool_min_connections)
        .acquire_timeout(Duration::from_secs(config.db_pool_acquire_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.db_pool_idle_timeout_seconds))
        .connect_lazy(url)?;

    Ok(Some(pool))
}
