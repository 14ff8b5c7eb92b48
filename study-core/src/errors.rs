//! # Errors
//!
//! Every failure the tenancy core can produce falls into one of a small
//! number of kinds. Each kind decides how the request layer reacts:
//!
//! - `Validation`   → fatal, rejected before any side effect, never retried
//! - `NotFound`     → recovered by the gate as a redirect
//! - `Capacity`     → retryable backpressure (pool full, nothing idle)
//! - `Connectivity` → surfaced as service unavailable, never cached
//! - `RaceLoss`     → transient miss on a non-blocking membership check
//! - `Catalog`      → the catalog store itself failed
//!
//! Transports decide how to serialize; `ErrorKind` carries the
//! Feathers-ish `name` / `className` / status code triple.

use std::error::Error as StdError;

use thiserror::Error;

/// Boxed source error carried by the wrapping variants.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Result type for tenancy operations.
pub type TenancyResult<T> = std::result::Result<T, TenancyError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,   // 400
    NotFound,     // 404
    Capacity,     // 503, retryable
    Connectivity, // 503
    RaceLoss,     // 409, transient
    Catalog,      // 503
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Capacity => 503,
            ErrorKind::Connectivity => 503,
            ErrorKind::RaceLoss => 409,
            ErrorKind::Catalog => 503,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Capacity => "Capacity",
            ErrorKind::Connectivity => "Connectivity",
            ErrorKind::RaceLoss => "RaceLoss",
            ErrorKind::Catalog => "CatalogUnavailable",
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation-error",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Capacity => "capacity",
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::RaceLoss => "race-loss",
            ErrorKind::Catalog => "catalog-unavailable",
        }
    }
}

#[derive(Error, Debug)]
pub enum TenancyError {
    #[error("Invalid tenant identifier {value:?}: {reason}")]
    Validation { value: String, reason: &'static str },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("Connection pool at capacity: {max} registrations, none idle")]
    Capacity { max: usize },

    #[error("Tenant database {alias} unreachable: {source}")]
    Connectivity {
        alias: String,
        #[source]
        source: BoxError,
    },

    #[error("Membership check for user {user_id} in tenant {tenant_id} lost contention")]
    RaceLoss { user_id: i64, tenant_id: i64 },

    #[error("Catalog store error: {source}")]
    Catalog {
        #[source]
        source: BoxError,
    },
}

impl TenancyError {
    pub fn validation(value: impl Into<String>, reason: &'static str) -> Self {
        Self::Validation {
            value: value.into(),
            reason,
        }
    }

    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            what,
            id: id.to_string(),
        }
    }

    pub fn capacity(max: usize) -> Self {
        Self::Capacity { max }
    }

    pub fn connectivity<E>(alias: impl Into<String>, error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Connectivity {
            alias: alias.into(),
            source: error.into(),
        }
    }

    pub fn race_loss(user_id: i64, tenant_id: i64) -> Self {
        Self::RaceLoss { user_id, tenant_id }
    }

    pub fn catalog<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Catalog {
            source: error.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Capacity { .. } => ErrorKind::Capacity,
            Self::Connectivity { .. } => ErrorKind::Connectivity,
            Self::RaceLoss { .. } => ErrorKind::RaceLoss,
            Self::Catalog { .. } => ErrorKind::Catalog,
        }
    }

    /// Whether the same call may succeed if simply attempted again later.
    ///
    /// Validation failures fail closed and are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Capacity { .. } | Self::Connectivity { .. } | Self::RaceLoss { .. } | Self::Catalog { .. }
        )
    }

    /// Message safe to show a client: no source chain, no credentials.
    pub fn client_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "The requested study identifier is not valid",
            ErrorKind::NotFound => "The requested study is not available",
            ErrorKind::Capacity => "The service is busy, please retry shortly",
            ErrorKind::Connectivity | ErrorKind::Catalog => "The service is temporarily unavailable",
            ErrorKind::RaceLoss => "Please retry the request",
        }
    }

    /// Feathers-ish JSON payload without the source chain.
    pub fn to_json(&self) -> serde_json::Value {
        let kind = self.kind();
        serde_json::json!({
            "name": kind.name(),
            "message": self.client_message(),
            "code": kind.status_code(),
            "className": kind.class_name(),
        })
    }
}
