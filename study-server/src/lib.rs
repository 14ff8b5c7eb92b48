pub mod app;
pub mod config;
pub mod routes;

pub use app::{build, collaborators, Collaborators};
