//! SQL text: catalog queries and DDL builders.
//!
//! DDL cannot take bind parameters for identifiers, so every identifier
//! is quoted here. Callers only ever pass names that already went through
//! `TenantAlias::parse`; quoting is a second barrier, not the first.

use study_core::TenantAlias;

pub const ACTIVATABLE_TENANTS: &str = "\
SELECT id, code, database_name, status \
FROM study_tenants \
WHERE status IN ('planning', 'active') \
ORDER BY id";

pub const TENANT_BY_ID: &str = "\
SELECT id, code, database_name, status \
FROM study_tenants \
WHERE id = $1";

pub const MEMBERSHIP_FOR_UPDATE_NOWAIT: &str = "\
SELECT user_id, tenant_id, role, all_sites, is_active, expires_at \
FROM study_memberships \
WHERE user_id = $1 AND tenant_id = $2 \
FOR UPDATE NOWAIT";

pub const MEMBERSHIP: &str = "\
SELECT user_id, tenant_id, role, all_sites, is_active, expires_at \
FROM study_memberships \
WHERE user_id = $1 AND tenant_id = $2";

pub const MEMBERSHIP_SITES: &str = "\
SELECT site_code \
FROM study_membership_sites \
WHERE user_id = $1 AND tenant_id = $2 \
ORDER BY site_code";

pub const ACTIVE_MEMBERSHIP_COUNT: &str = "\
SELECT COUNT(*) \
FROM study_memberships \
WHERE user_id = $1 AND is_active AND (expires_at IS NULL OR expires_at > now())";

pub const TENANT_SITES: &str = "\
SELECT code FROM study_sites WHERE tenant_id = $1 ORDER BY code";

pub const EXISTING_DATABASES: &str = "\
SELECT datname FROM pg_database WHERE datname = ANY($1)";

pub const DATABASE_EXISTS: &str = "\
SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)";

/// `"name"`, with embedded quotes doubled.
pub fn quote_ident(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for c in name.chars() {
        if c == '"' {
            quoted.push('"');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

pub fn create_schema(schema: &TenantAlias) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema.as_str()))
}

/// Grants the application role may need on a tenant schema.
pub fn grant_schema(schema: &TenantAlias, role: &str) -> Vec<String> {
    let schema = quote_ident(schema.as_str());
    let role = quote_ident(role);
    vec![
        format!("GRANT USAGE, CREATE ON SCHEMA {schema} TO {role}"),
        format!("GRANT SELECT, INSERT, UPDATE, DELETE ON ALL TABLES IN SCHEMA {schema} TO {role}"),
        format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {schema} \
             GRANT SELECT, INSERT, UPDATE, DELETE ON TABLES TO {role}"
        ),
    ]
}

pub fn create_database(database: &TenantAlias, owner: &str) -> String {
    format!(
        "CREATE DATABASE {} OWNER {}",
        quote_ident(database.as_str()),
        quote_ident(owner)
    )
}
