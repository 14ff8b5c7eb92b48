//! Core multi-tenant types.
//!
//! A tenant is one research study with its own physical database.
//! Anything that can end up inside a SQL identifier goes through
//! [`TenantAlias::parse`] first.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{TenancyError, TenancyResult};

/// PostgreSQL truncates identifiers longer than this.
pub const MAX_ALIAS_LEN: usize = 63;

static ALIAS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_]+$").expect("static alias pattern compiles")
});

/// Catalog primary key of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub i64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A validated tenant identifier: letters, digits and underscore only.
///
/// This is the only type that may be interpolated into schema or
/// database creation statements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TenantAlias(String);

impl TenantAlias {
    pub fn parse(raw: &str) -> TenancyResult<Self> {
        if raw.is_empty() {
            return Err(TenancyError::validation(raw, "identifier is empty"));
        }
        if raw.len() > MAX_ALIAS_LEN {
            return Err(TenancyError::validation(raw, "identifier exceeds 63 bytes"));
        }
        if !ALIAS_PATTERN.is_match(raw) {
            return Err(TenancyError::validation(
                raw,
                "only letters, digits and underscore are allowed",
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TenantAlias {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        TenantAlias::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Planning,
    Active,
    Archived,
}

impl TenantStatus {
    /// Planning and active studies may be activated; archived ones may not.
    pub fn is_activatable(&self) -> bool {
        matches!(self, TenantStatus::Planning | TenantStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Planning => "planning",
            TenantStatus::Active => "active",
            TenantStatus::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "planning" => Some(TenantStatus::Planning),
            "active" => Some(TenantStatus::Active),
            "archived" => Some(TenantStatus::Archived),
            _ => None,
        }
    }
}

/// Catalog record of one study.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    /// Immutable study code, also used as the connection alias.
    pub code: String,
    pub database_name: String,
    pub status: TenantStatus,
}

impl Tenant {
    pub fn alias(&self) -> TenancyResult<TenantAlias> {
        TenantAlias::parse(&self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "sites", rename_all = "snake_case")]
pub enum SiteScope {
    AllSites,
    Sites(BTreeSet<String>),
}

/// A user's right to act within one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: i64,
    pub tenant_id: TenantId,
    pub role: String,
    pub site_scope: SiteScope,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Membership {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |exp| exp > now)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}
