use std::sync::Arc;

use anyhow::{Context, Result};
use study_axum::{
    trusted_header_principal, GateSettings, MemorySessionStore, TenancyApp, TenancyState,
};
use study_core::{
    manifest_from_settings, ConnectionConfig, ConnectionRegistry, ConnectionSettings,
    DiscoverySettings, PoolSettings, RoleCatalog, StudyConfigSnapshot, TenantDiscovery,
};
use study_postgres::{open_pool, PgBackend, PgCatalog, PgPoolSettings, PgProbe};
use tracing::info;

use crate::routes::selection_router;

/// Postgres-backed registry, used by both the server and `provision`.
pub struct Collaborators {
    pub catalog: Arc<PgCatalog>,
    pub probe: Arc<PgProbe>,
    pub backend: Arc<PgBackend>,
    pub registry: Arc<ConnectionRegistry>,
}

/// Physical pool sizing; an out-of-range `pg.pool_size` is an error.
pub fn pg_pool_settings(config: &StudyConfigSnapshot) -> Result<PgPoolSettings> {
    let defaults = PgPoolSettings::default();
    let max_connections = match config.get_usize("pg.pool_size") {
        Some(size) => u32::try_from(size).context("pg.pool_size is out of range")?,
        None => defaults.max_connections,
    };
    Ok(PgPoolSettings {
        max_connections,
        ..defaults
    })
}

pub async fn collaborators(config: &StudyConfigSnapshot) -> Result<Collaborators> {
    let settings = ConnectionSettings::from_snapshot(config);
    let pool = PoolSettings::from_snapshot(config);
    let pg_pool = pg_pool_settings(config)?;

    let catalog_config = ConnectionConfig::catalog(&settings).context("invalid catalog database name")?;
    let catalog_pool = open_pool(&catalog_config, &pg_pool)
        .await
        .context("cannot reach the catalog database")?;
    info!(database = %catalog_config.database, "catalog connected");

    let backend = Arc::new(PgBackend::new(catalog_pool.clone(), pg_pool));
    let registry = Arc::new(ConnectionRegistry::new(settings, pool, backend.clone())?);

    Ok(Collaborators {
        catalog: Arc::new(PgCatalog::new(catalog_pool.clone())),
        probe: Arc::new(PgProbe::new(catalog_pool)),
        backend,
        registry,
    })
}

pub async fn build(config: &StudyConfigSnapshot) -> Result<TenancyApp> {
    let parts = collaborators(config).await?;

    let manifest = manifest_from_settings(&DiscoverySettings::from_snapshot(config));
    let discovery = Arc::new(TenantDiscovery::new(
        manifest,
        parts.catalog.clone(),
        parts.probe.clone(),
    ));
    let loadable = discovery.loadable_tenants().await;
    info!(loadable = loadable.len(), "tenant discovery warmed up");

    let state = TenancyState::new(
        GateSettings::from_snapshot(config),
        parts.catalog.clone(),
        discovery,
        parts.registry.clone(),
        RoleCatalog::seeded(),
        Arc::new(MemorySessionStore::new()),
    );

    Ok(TenancyApp::new(state.clone())
        .use_router("/", selection_router(state))
        .with_principal(trusted_header_principal))
}
