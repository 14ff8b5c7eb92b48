//! study-core: framework-agnostic multi-study tenancy.
//!
//! Decides which studies may be activated ([`discovery`]), keeps a bounded
//! table of per-study connections ([`registry`]), and carries the
//! request's route to the data-access layer ([`routing`]). Storage is
//! reached only through the traits in [`catalog`].

pub mod catalog;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod errors;
pub mod membership;
pub mod memory;
pub mod registry;
pub mod roles;
pub mod routing;
pub mod tenant;

pub use catalog::{ConnectionBackend, DatabaseProbe, TenantCatalog};
pub use config::{
    ConnectionSettings, DiscoverySettings, PoolSettings, StudyConfig, StudyConfigSnapshot,
    TenantOverrides,
};
pub use connection::ConnectionConfig;
pub use discovery::{
    manifest_from_settings, DirectoryManifest, DiscoverySnapshot, ModuleManifest, StaticManifest,
    TenantDiscovery,
};
pub use errors::{ErrorKind, TenancyError, TenancyResult};
pub use membership::{MembershipCache, MembershipValidator};
pub use memory::{MemoryCatalog, MemoryServer};
pub use registry::{ConnectionLease, ConnectionRegistry, RegistryStats};
pub use roles::RoleCatalog;
pub use routing::{Route, RouteGuard, RoutingContext};
pub use tenant::{Membership, SiteScope, Tenant, TenantAlias, TenantId, TenantStatus};
