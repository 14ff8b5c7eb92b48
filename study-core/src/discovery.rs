//! Tenant discovery.
//!
//! A study may be activated only when three independent sources agree:
//!
//! 1. a deployable module for it exists in the running build,
//! 2. its catalog record is `planning` or `active`,
//! 3. its physical database exists on the server.
//!
//! The result is computed once and cached until [`TenantDiscovery::invalidate`].
//! Builds are single-flight, and a build that overlaps an invalidation is
//! returned to its caller but never cached.
//! Being present in only two sources is the normal "not ready yet"
//! state and is not logged as an error.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::catalog::{DatabaseProbe, TenantCatalog};
use crate::config::DiscoverySettings;
use crate::errors::TenancyResult;
use crate::tenant::{Tenant, TenantAlias, TenantId};

/// Source of the "module present in this build" set.
pub trait ModuleManifest: Send + Sync {
    fn modules(&self) -> BTreeSet<String>;
}

/// Manifest generated at build time or listed in configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticManifest {
    modules: BTreeSet<String>,
}

impl StaticManifest {
    pub fn new<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let modules = modules
            .into_iter()
            .map(Into::into)
            .filter(|code: &String| match TenantAlias::parse(code) {
                Ok(_) => true,
                Err(err) => {
                    warn!(module = %code, %err, "skipping manifest entry");
                    false
                }
            })
            .collect();
        Self { modules }
    }
}

impl ModuleManifest for StaticManifest {
    fn modules(&self) -> BTreeSet<String> {
        self.modules.clone()
    }
}

/// Fallback for dynamic deployments: each sub-directory is a module.
#[derive(Debug, Clone)]
pub struct DirectoryManifest {
    root: PathBuf,
}

impl DirectoryManifest {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ModuleManifest for DirectoryManifest {
    fn modules(&self) -> BTreeSet<String> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(root = %self.root.display(), %err, "cannot scan modules directory");
                return BTreeSet::new();
            }
        };

        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| TenantAlias::parse(name).is_ok())
            .collect()
    }
}

/// Static list when configured, directory scan otherwise.
pub fn manifest_from_settings(settings: &DiscoverySettings) -> Arc<dyn ModuleManifest> {
    match (&settings.modules, &settings.modules_dir) {
        (modules, _) if !modules.is_empty() => Arc::new(StaticManifest::new(modules.clone())),
        (_, Some(dir)) => Arc::new(DirectoryManifest::new(dir.clone())),
        _ => {
            warn!("no study modules configured; no tenant will be loadable");
            Arc::new(StaticManifest::default())
        }
    }
}

/// Cached result of one discovery pass.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoverySnapshot {
    /// Codes with a deployable module.
    pub modules: BTreeSet<String>,
    /// Codes whose catalog status is planning or active.
    pub catalog: BTreeSet<String>,
    /// Candidate codes whose physical database exists.
    pub databases: BTreeSet<String>,
    /// The intersection of all three.
    pub loadable: BTreeSet<String>,
    pub built_at: DateTime<Utc>,
    #[serde(skip)]
    tenants: HashMap<TenantId, Tenant>,
}

impl Default for DiscoverySnapshot {
    fn default() -> Self {
        Self {
            modules: BTreeSet::new(),
            catalog: BTreeSet::new(),
            databases: BTreeSet::new(),
            loadable: BTreeSet::new(),
            built_at: Utc::now(),
            tenants: HashMap::new(),
        }
    }
}

impl DiscoverySnapshot {
    pub fn tenant(&self, id: TenantId) -> Option<&Tenant> {
        self.tenants.get(&id)
    }

    /// Catalog records of the loadable tenants.
    pub fn tenants(&self) -> impl Iterator<Item = &Tenant> {
        self.tenants.values()
    }

    pub fn is_loadable(&self, code: &str) -> bool {
        self.loadable.contains(code)
    }
}

pub struct TenantDiscovery {
    manifest: Arc<dyn ModuleManifest>,
    catalog: Arc<dyn TenantCatalog>,
    probe: Arc<dyn DatabaseProbe>,
    cached: RwLock<Option<Arc<DiscoverySnapshot>>>,
    generation: AtomicU64,
    building: tokio::sync::Mutex<()>,
    builds: AtomicU64,
}

impl TenantDiscovery {
    pub fn new(
        manifest: Arc<dyn ModuleManifest>,
        catalog: Arc<dyn TenantCatalog>,
        probe: Arc<dyn DatabaseProbe>,
    ) -> Self {
        Self {
            manifest,
            catalog,
            probe,
            cached: RwLock::new(None),
            generation: AtomicU64::new(0),
            building: tokio::sync::Mutex::new(()),
            builds: AtomicU64::new(0),
        }
    }

    /// Codes of every tenant that is safe to activate.
    ///
    /// Fails closed: if the catalog or the probe is unreachable the
    /// result is empty.
    pub async fn loadable_tenants(&self) -> BTreeSet<String> {
        self.snapshot().await.loadable.clone()
    }

    /// The catalog record of a loadable tenant.
    pub async fn loadable_tenant(&self, id: TenantId) -> Option<Tenant> {
        self.snapshot().await.tenant(id).cloned()
    }

    pub async fn snapshot(&self) -> Arc<DiscoverySnapshot> {
        if let Some(snapshot) = self.cached() {
            return snapshot;
        }

        let _building = self.building.lock().await;
        // built by the caller we waited for
        if let Some(snapshot) = self.cached() {
            return snapshot;
        }

        let generation = self.generation.load(Ordering::SeqCst);
        match self.build().await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                let mut slot = self.cached.write();
                if self.generation.load(Ordering::SeqCst) == generation {
                    *slot = Some(Arc::clone(&snapshot));
                } else {
                    debug!("tenant discovery invalidated during build, result not cached");
                }
                info!(loadable = snapshot.loadable.len(), "tenant discovery complete");
                snapshot
            }
            Err(err) => {
                // not cached: the next call tries again
                error!(%err, "tenant discovery failed, no tenant will be activated");
                Arc::new(DiscoverySnapshot::default())
            }
        }
    }

    /// Drop the cached snapshot; the next read rebuilds it.
    pub fn invalidate(&self) {
        let mut slot = self.cached.write();
        self.generation.fetch_add(1, Ordering::SeqCst);
        slot.take();
        debug!("tenant discovery cache invalidated");
    }

    fn cached(&self) -> Option<Arc<DiscoverySnapshot>> {
        self.cached.read().clone()
    }

    /// Number of completed or attempted builds since creation.
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    async fn build(&self) -> TenancyResult<DiscoverySnapshot> {
        self.builds.fetch_add(1, Ordering::Relaxed);

        let modules = self.manifest.modules();

        let records: Vec<Tenant> = self
            .catalog
            .activatable_tenants()
            .await?
            .into_iter()
            .filter(|t| t.status.is_activatable())
            .collect();
        let catalog: BTreeSet<String> = records.iter().map(|t| t.code.clone()).collect();

        // only candidates present in both of the cheap sources are probed
        let candidates: Vec<&Tenant> = records
            .iter()
            .filter(|t| modules.contains(&t.code))
            .filter(|t| match (t.alias(), TenantAlias::parse(&t.database_name)) {
                (Ok(_), Ok(_)) => true,
                _ => {
                    warn!(tenant = %t.code, database = %t.database_name, "tenant has an invalid identifier");
                    false
                }
            })
            .collect();

        let names: Vec<String> = candidates
            .iter()
            .map(|t| t.database_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let existing = if names.is_empty() {
            BTreeSet::new()
        } else {
            self.probe.existing_databases(&names).await?
        };

        let databases: BTreeSet<String> = candidates
            .iter()
            .filter(|t| existing.contains(&t.database_name))
            .map(|t| t.code.clone())
            .collect();

        let loadable: BTreeSet<String> = modules
            .iter()
            .filter(|code| catalog.contains(*code) && databases.contains(*code))
            .cloned()
            .collect();

        for code in catalog.difference(&loadable) {
            debug!(tenant = %code, "tenant not ready");
        }

        let tenants = candidates
            .into_iter()
            .filter(|t| loadable.contains(&t.code))
            .map(|t| (t.id, t.clone()))
            .collect();

        Ok(DiscoverySnapshot {
            modules,
            catalog,
            databases,
            loadable,
            built_at: Utc::now(),
            tenants,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_manifest_skips_invalid_codes() {
        let manifest = StaticManifest::new(["cardio_01", "bad-code", "onco_02"]);
        let modules = manifest.modules();
        assert_eq!(modules.len(), 2);
        assert!(!modules.contains("bad-code"));
    }

    #[test]
    fn directory_manifest_lists_valid_subdirectories() {
        let root = std::env::temp_dir().join(format!("study-modules-{}", std::process::id()));
        std::fs::create_dir_all(root.join("cardio_01")).unwrap();
        std::fs::create_dir_all(root.join("not valid")).unwrap();
        std::fs::write(root.join("onco_02"), b"file, not a module").unwrap();

        let modules = DirectoryManifest::new(&root).modules();
        std::fs::remove_dir_all(&root).unwrap();

        assert_eq!(modules, BTreeSet::from(["cardio_01".to_string()]));
    }

    #[test]
    fn missing_directory_yields_no_modules() {
        let manifest = DirectoryManifest::new("/definitely/not/here");
        assert!(manifest.modules().is_empty());
    }

    #[test]
    fn settings_prefer_static_list() {
        let settings = DiscoverySettings {
            modules: vec!["cardio_01".into()],
            modules_dir: Some("/definitely/not/here".into()),
        };
        let manifest = manifest_from_settings(&settings);
        assert_eq!(manifest.modules().len(), 1);
    }
}
