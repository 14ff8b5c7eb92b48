//! Static role → permission catalog.

use std::collections::{BTreeSet, HashMap};

/// Named bundles of permission codes, seeded once at startup.
#[derive(Debug, Clone, Default)]
pub struct RoleCatalog {
    roles: HashMap<String, Vec<String>>,
}

impl RoleCatalog {
    pub fn new() -> Self {
        Self {
            roles: HashMap::new(),
        }
    }

    /// The built-in study roles.
    pub fn seeded() -> Self {
        let mut catalog = Self::new();
        catalog.define(
            "data_manager",
            [
                "crf.view",
                "crf.edit",
                "crf.lock",
                "query.raise",
                "query.close",
                "subject.enrol",
                "export.run",
            ],
        );
        catalog.define(
            "investigator",
            ["crf.view", "crf.edit", "crf.sign", "query.respond", "subject.enrol"],
        );
        catalog.define(
            "site_coordinator",
            ["crf.view", "crf.edit", "query.respond", "subject.enrol"],
        );
        catalog.define("monitor", ["crf.view", "crf.verify", "query.raise"]);
        catalog.define("viewer", ["crf.view"]);
        catalog
    }

    /// Define or replace a role. Order is preserved, duplicates dropped.
    pub fn define<I, S>(&mut self, role: impl Into<String>, permissions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = BTreeSet::new();
        let ordered = permissions
            .into_iter()
            .map(Into::into)
            .filter(|p: &String| seen.insert(p.clone()))
            .collect();
        self.roles.insert(role.into(), ordered);
    }

    /// Permission codes for a role, in declaration order.
    pub fn permissions(&self, role: &str) -> &[String] {
        self.roles.get(role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Permission set for a role. Unknown roles grant nothing.
    pub fn permission_set(&self, role: &str) -> BTreeSet<String> {
        self.permissions(role).iter().cloned().collect()
    }

    pub fn contains(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }
}
