//! Resolved per-tenant connection configuration.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::config::ConnectionSettings;
use crate::errors::{TenancyError, TenancyResult};
use crate::tenant::TenantAlias;

/// Everything needed to open a connection to one physical database.
///
/// Database and schema names are validated identifiers, so backends may
/// quote and interpolate them into DDL.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionConfig {
    /// `None` for the catalog connection.
    pub alias: Option<TenantAlias>,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub database: String,
    pub search_path: Vec<String>,
    #[serde(skip_serializing)]
    pub connect_timeout: Duration,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("alias", &self.alias)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("search_path", &self.search_path)
            .finish()
    }
}

impl ConnectionConfig {
    /// The management connection used when no tenant is routed.
    pub fn catalog(settings: &ConnectionSettings) -> TenancyResult<Self> {
        Ok(Self {
            alias: None,
            host: settings.host.clone(),
            port: settings.port,
            user: settings.user.clone(),
            password: settings.password.clone(),
            database: validated_identifier(&settings.catalog_database)?,
            search_path: parse_search_path("public")?,
            connect_timeout: settings.connect_timeout,
        })
    }

    /// Base settings plus the tenant's overrides.
    ///
    /// The physical database name comes from, in order: a configured
    /// override, the catalog's `database_hint`, `{prefix}{alias}`.
    pub fn for_tenant(
        settings: &ConnectionSettings,
        alias: &TenantAlias,
        database_hint: Option<&str>,
    ) -> TenancyResult<Self> {
        let overrides = settings.overrides.get(alias).cloned().unwrap_or_default();

        let database = match (overrides.database, database_hint) {
            (Some(name), _) => name,
            (None, Some(hint)) => hint.to_string(),
            (None, None) => format!("{}{}", settings.database_prefix, alias),
        };
        let search_path = overrides
            .search_path
            .unwrap_or_else(|| settings.search_path.clone());

        Ok(Self {
            alias: Some(alias.clone()),
            host: overrides.host.unwrap_or_else(|| settings.host.clone()),
            port: overrides.port.unwrap_or(settings.port),
            user: overrides.user.unwrap_or_else(|| settings.user.clone()),
            password: overrides.password.unwrap_or_else(|| settings.password.clone()),
            database: validated_identifier(&database)?,
            search_path: parse_search_path(&search_path)?,
            connect_timeout: settings.connect_timeout,
        })
    }

    /// Schema that holds the tenant's data: the first search path entry.
    pub fn data_schema(&self) -> &str {
        self.search_path.first().map(String::as_str).unwrap_or("public")
    }

    pub fn label(&self) -> &str {
        self.alias.as_ref().map(TenantAlias::as_str).unwrap_or("catalog")
    }
}

fn validated_identifier(raw: &str) -> TenancyResult<String> {
    TenantAlias::parse(raw).map(|id| id.as_str().to_string())
}

fn parse_search_path(raw: &str) -> TenancyResult<Vec<String>> {
    let schemas = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(validated_identifier)
        .collect::<TenancyResult<Vec<_>>>()?;
    if schemas.is_empty() {
        return Err(TenancyError::validation(raw, "search path is empty"));
    }
    Ok(schemas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantOverrides;

    #[test]
    fn tenant_config_applies_overrides() {
        let alias = TenantAlias::parse("onco_02").unwrap();
        let settings = ConnectionSettings::default().with_override(
            alias.clone(),
            TenantOverrides {
                host: Some("db-eu".into()),
                search_path: Some("crf, public".into()),
                ..TenantOverrides::default()
            },
        );

        let config = ConnectionConfig::for_tenant(&settings, &alias, None).unwrap();
        assert_eq!(config.host, "db-eu");
        assert_eq!(config.port, 5432);
        assert_eq!(config.database, "study_onco_02");
        assert_eq!(config.search_path, vec!["crf", "public"]);
        assert_eq!(config.data_schema(), "crf");
    }

    #[test]
    fn catalog_hint_names_the_database() {
        let alias = TenantAlias::parse("onco_02").unwrap();
        let settings = ConnectionSettings::default();
        let config = ConnectionConfig::for_tenant(&settings, &alias, Some("legacy_onco")).unwrap();
        assert_eq!(config.database, "legacy_onco");
        assert!(ConnectionConfig::for_tenant(&settings, &alias, Some("bad name")).is_err());
    }

    #[test]
    fn hostile_override_database_is_rejected() {
        let alias = TenantAlias::parse("onco_02").unwrap();
        let settings = ConnectionSettings::default().with_override(
            alias.clone(),
            TenantOverrides {
                database: Some("x\"; DROP DATABASE y; --".into()),
                ..TenantOverrides::default()
            },
        );
        assert!(matches!(
            ConnectionConfig::for_tenant(&settings, &alias, Some("study_onco_02")),
            Err(TenancyError::Validation { .. })
        ));
    }

    #[test]
    fn hostile_search_path_is_rejected() {
        let settings = ConnectionSettings {
            search_path: "data; DROP SCHEMA data".into(),
            ..ConnectionSettings::default()
        };
        let alias = TenantAlias::parse("a").unwrap();
        assert!(ConnectionConfig::for_tenant(&settings, &alias, None).is_err());
    }

    #[test]
    fn serialized_config_omits_password() {
        let settings = ConnectionSettings {
            password: "hunter2".into(),
            ..ConnectionSettings::default()
        };
        let config = ConnectionConfig::catalog(&settings).unwrap();
        assert!(!serde_json::to_string(&config).unwrap().contains("hunter2"));
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
