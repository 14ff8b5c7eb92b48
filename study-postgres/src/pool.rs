use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use study_core::ConnectionConfig;

use crate::error::connectivity_error;

/// Sizing of the physical pool opened per registered tenant.
#[derive(Debug, Clone)]
pub struct PgPoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub idle_timeout: Option<Duration>,
}

impl Default for PgPoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 0,
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Connect options for a validated config; the search path travels as a
/// startup parameter so every pooled connection starts in the right schema.
pub fn connect_options(config: &ConnectionConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.database)
        .options([("search_path", config.search_path.join(","))])
}

fn pool_options(config: &ConnectionConfig, settings: &PgPoolSettings) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .idle_timeout(settings.idle_timeout)
        .acquire_timeout(config.connect_timeout)
}

/// Pool that connects on first use.
pub fn lazy_pool(config: &ConnectionConfig, settings: &PgPoolSettings) -> PgPool {
    pool_options(config, settings).connect_lazy_with(connect_options(config))
}

pub async fn open_pool(config: &ConnectionConfig, settings: &PgPoolSettings) -> study_core::TenancyResult<PgPool> {
    pool_options(config, settings)
        .connect_with(connect_options(config))
        .await
        .map_err(|err| connectivity_error(config.label(), err))
}
