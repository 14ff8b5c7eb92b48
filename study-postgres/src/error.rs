use study_core::TenancyError;
use tracing::error;

/// SQLSTATE `lock_not_available`, raised by `NOWAIT`.
pub const LOCK_NOT_AVAILABLE: &str = "55P03";

pub(crate) fn is_lock_not_available(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE);
    }
    false
}

pub(crate) fn catalog_error(err: sqlx::Error) -> TenancyError {
    error!(error = %err, "catalog query failed");
    TenancyError::catalog(err)
}

pub(crate) fn connectivity_error(label: &str, err: sqlx::Error) -> TenancyError {
    match &err {
        sqlx::Error::PoolTimedOut => error!(alias = label, "connection pool timed out"),
        _ => error!(alias = label, error = %err, "database unreachable"),
    }
    TenancyError::connectivity(label, err)
}
