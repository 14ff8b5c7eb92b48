//! # Configuration
//!
//! A minimal string key/value store. Defaults are set in code, then
//! environment variables with a prefix override them:
//!
//! ```rust
//! use study_core::config::StudyConfig;
//!
//! let mut config = StudyConfig::with_defaults();
//! config.set("pool.max_connections", "8");
//!
//! let snapshot = config.snapshot();
//! assert_eq!(snapshot.get_usize("pool.max_connections"), Some(8));
//! ```
//!
//! `STUDY__POOL__MAX_CONNECTIONS=25` becomes `pool.max_connections = 25`
//! after [`StudyConfig::load_env`] with prefix `STUDY__`.
//!
//! Typed views ([`PoolSettings`], [`ConnectionSettings`],
//! [`DiscoverySettings`]) are built from a snapshot so the rest of the
//! crate never parses strings.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use crate::tenant::TenantAlias;

#[derive(Debug, Default)]
pub struct StudyConfig {
    values: HashMap<String, String>,
}

impl StudyConfig {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// A store pre-filled with the documented defaults.
    pub fn with_defaults() -> Self {
        let mut config = Self::new();
        config.set("pool.max_connections", "20");
        config.set("pool.config_ttl", "5m");
        config.set("db.host", "127.0.0.1");
        config.set("db.port", "5432");
        config.set("db.user", "study");
        config.set("db.password", "");
        config.set("db.catalog", "study_catalog");
        config.set("db.prefix", "study_");
        config.set("db.search_path", "data,public");
        config.set("db.connect_timeout", "5s");
        config
    }

    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Apply `PREFIX` + `SECTION__KEY` environment variables.
    pub fn load_env(&mut self, prefix: &str) {
        self.load_vars(prefix, std::env::vars());
    }

    /// Same as [`StudyConfig::load_env`] over an explicit variable list.
    pub fn load_vars<I>(&mut self, prefix: &str, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(prefix) {
                let normalized = stripped.to_lowercase().replace("__", ".");
                self.set(normalized, value);
            }
        }
    }

    pub fn snapshot(&self) -> StudyConfigSnapshot {
        StudyConfigSnapshot::new(self.values.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StudyConfigSnapshot {
    map: HashMap<String, String>,
}

impl StudyConfigSnapshot {
    pub(crate) fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
    }

    pub fn get_u16(&self, key: &str) -> Option<u16> {
        self.get(key).and_then(|v| v.trim().parse::<u16>().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.trim().parse::<bool>().ok())
    }

    /// Human durations: `30s`, `5m`, `1h 30m`.
    pub fn get_duration(&self, key: &str) -> Option<Duration> {
        self.get(key)
            .and_then(|v| humantime::parse_duration(v.trim()).ok())
    }

    /// Comma separated list, blanks dropped.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entries under `prefix.`, with the prefix stripped, sorted by key.
    pub fn section(&self, prefix: &str) -> BTreeMap<String, String> {
        let dotted = format!("{prefix}.");
        self.map
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&dotted).map(|rest| (rest.to_string(), v.clone())))
            .collect()
    }
}

/// Bounds of the connection registry.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: usize,
    /// How long a built connection config may be reused before rebuilding.
    pub config_ttl: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 20,
            config_ttl: Duration::from_secs(300),
        }
    }
}

impl PoolSettings {
    pub fn from_snapshot(snapshot: &StudyConfigSnapshot) -> Self {
        let defaults = Self::default();
        Self {
            max_connections: snapshot
                .get_usize("pool.max_connections")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_connections),
            config_ttl: snapshot
                .get_duration("pool.config_ttl")
                .unwrap_or(defaults.config_ttl),
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_config_ttl(mut self, ttl: Duration) -> Self {
        self.config_ttl = ttl;
        self
    }
}

/// Tenant specific connection overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub search_path: Option<String>,
}

/// Base settings every tenant connection starts from.
#[derive(Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// The catalog / management database.
    pub catalog_database: String,
    /// Physical database name is `{database_prefix}{alias}` unless overridden.
    pub database_prefix: String,
    pub search_path: String,
    pub connect_timeout: Duration,
    pub overrides: HashMap<TenantAlias, TenantOverrides>,
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("catalog_database", &self.catalog_database)
            .field("database_prefix", &self.database_prefix)
            .field("search_path", &self.search_path)
            .field("connect_timeout", &self.connect_timeout)
            .field("overrides", &self.overrides.len())
            .finish()
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            user: "study".to_string(),
            password: String::new(),
            catalog_database: "study_catalog".to_string(),
            database_prefix: "study_".to_string(),
            search_path: "data,public".to_string(),
            connect_timeout: Duration::from_secs(5),
            overrides: HashMap::new(),
        }
    }
}

impl ConnectionSettings {
    /// Reads `db.*` keys and `tenants.<alias>.<field>` overrides.
    ///
    /// Override sections whose alias is not a valid identifier are skipped.
    pub fn from_snapshot(snapshot: &StudyConfigSnapshot) -> Self {
        let defaults = Self::default();
        let mut overrides: HashMap<TenantAlias, TenantOverrides> = HashMap::new();

        for (key, value) in snapshot.section("tenants") {
            let Some((raw_alias, field)) = key.split_once('.') else {
                continue;
            };
            let Ok(alias) = TenantAlias::parse(raw_alias) else {
                tracing::warn!(alias = raw_alias, "ignoring overrides for invalid tenant identifier");
                continue;
            };
            let entry = overrides.entry(alias).or_default();
            match field {
                "host" => entry.host = Some(value),
                "port" => entry.port = value.trim().parse().ok(),
                "user" => entry.user = Some(value),
                "password" => entry.password = Some(value),
                "database" => entry.database = Some(value),
                "search_path" => entry.search_path = Some(value),
                other => tracing::warn!(alias = raw_alias, field = other, "unknown tenant override"),
            }
        }

        Self {
            host: snapshot.get_string("db.host").unwrap_or(defaults.host),
            port: snapshot.get_u16("db.port").unwrap_or(defaults.port),
            user: snapshot.get_string("db.user").unwrap_or(defaults.user),
            password: snapshot.get_string("db.password").unwrap_or(defaults.password),
            catalog_database: snapshot
                .get_string("db.catalog")
                .unwrap_or(defaults.catalog_database),
            database_prefix: snapshot
                .get_string("db.prefix")
                .unwrap_or(defaults.database_prefix),
            search_path: snapshot
                .get_string("db.search_path")
                .unwrap_or(defaults.search_path),
            connect_timeout: snapshot
                .get_duration("db.connect_timeout")
                .unwrap_or(defaults.connect_timeout),
            overrides,
        }
    }

    pub fn with_override(mut self, alias: TenantAlias, overrides: TenantOverrides) -> Self {
        self.overrides.insert(alias, overrides);
        self
    }
}

/// Where the "module present" source set comes from.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySettings {
    /// Compiled-in / configured list of deployable study modules.
    pub modules: Vec<String>,
    /// Optional directory scanned when the static list is empty.
    pub modules_dir: Option<PathBuf>,
}

impl DiscoverySettings {
    pub fn from_snapshot(snapshot: &StudyConfigSnapshot) -> Self {
        Self {
            modules: snapshot.get_list("discovery.modules"),
            modules_dir: snapshot.get_string("discovery.modules_dir").map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn env_overrides_defaults() {
        let mut config = StudyConfig::with_defaults();
        config.load_vars(
            "STUDY__",
            vars(&[
                ("STUDY__POOL__MAX_CONNECTIONS", "3"),
                ("STUDY__POOL__CONFIG_TTL", "45s"),
                ("OTHER__POOL__MAX_CONNECTIONS", "99"),
            ]),
        );
        let pool = PoolSettings::from_snapshot(&config.snapshot());
        assert_eq!(pool.max_connections, 3);
        assert_eq!(pool.config_ttl, Duration::from_secs(45));
    }

    #[test]
    fn zero_capacity_falls_back_to_default() {
        let mut config = StudyConfig::new();
        config.set("pool.max_connections", "0");
        assert_eq!(PoolSettings::from_snapshot(&config.snapshot()).max_connections, 20);
    }

    #[test]
    fn tenant_overrides_are_parsed_and_validated() {
        let mut config = StudyConfig::with_defaults();
        config.set("tenants.cardio_01.host", "10.0.0.7");
        config.set("tenants.cardio_01.port", "6432");
        config.set("tenants.cardio_01.search_path", "crf");
        config.set("tenants.bad-alias.host", "evil");

        let settings = ConnectionSettings::from_snapshot(&config.snapshot());
        let alias = TenantAlias::parse("cardio_01").unwrap();
        let o = &settings.overrides[&alias];
        assert_eq!(o.host.as_deref(), Some("10.0.0.7"));
        assert_eq!(o.port, Some(6432));
        assert_eq!(o.search_path.as_deref(), Some("crf"));
        assert_eq!(settings.overrides.len(), 1);
    }

    #[test]
    fn debug_redacts_password() {
        let settings = ConnectionSettings {
            password: "hunter2".into(),
            ..ConnectionSettings::default()
        };
        assert!(!format!("{settings:?}").contains("hunter2"));
    }

    #[test]
    fn discovery_list_parsing() {
        let mut config = StudyConfig::new();
        config.set("discovery.modules", "cardio_01, onco_02 ,,");
        let d = DiscoverySettings::from_snapshot(&config.snapshot());
        assert_eq!(d.modules, vec!["cardio_01", "onco_02"]);
        assert!(d.modules_dir.is_none());
    }
}
