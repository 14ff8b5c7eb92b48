//! PostgreSQL collaborators for study-core.

pub mod backend;
pub mod catalog;
pub mod error;
pub mod pool;
pub mod routed;
pub mod sql;

pub use backend::PgBackend;
pub use catalog::{PgCatalog, PgProbe};
pub use pool::{connect_options, lazy_pool, open_pool, PgPoolSettings};
pub use routed::{PgState, RoutedPool};
