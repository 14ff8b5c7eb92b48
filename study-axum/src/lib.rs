//! study-axum: axum integration for study-core.
//!
//! Provides the tenant access gate middleware, the session collaborator,
//! health routes and a small router builder.

pub mod app;
pub mod error;
pub mod gate;
pub mod health;
pub mod session;
pub mod state;

pub use app::{trusted_header_principal, TenancyApp};
pub use error::GateError;
pub use gate::{select_tenant, tenant_gate, GateSettings, Principal, TenantAccess};
pub use session::{MemorySessionStore, SessionKey, SessionStore};
pub use state::TenancyState;
