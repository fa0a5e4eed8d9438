use std::sync::OnceLock;

use tracing::debug;

use super::descriptor::DialectDescriptor;
use super::{Dbms, DbmsType};
use crate::error::{Result, StreamError};

/// All registered engines, keyed by descriptor name.
#[derive(Debug)]
pub struct DbmsRegistry {
    types: Vec<DbmsType>,
}

impl DbmsRegistry {
    /// Build a registry, rejecting two engines registered under the same
    /// name (compared case-insensitively).
    pub fn new(types: Vec<DbmsType>) -> Result<Self> {
        for (i, t) in types.iter().enumerate() {
            if types[..i]
                .iter()
                .any(|other| other.name().eq_ignore_ascii_case(t.name()))
            {
                return Err(StreamError::configuration(
                    "registry",
                    format!("duplicate dbms name `{}`", t.name()),
                ));
            }
        }
        Ok(Self { types })
    }

    pub fn builtin() -> Result<Self> {
        Self::new(vec![
            DbmsType::new(Dbms::MySql, mysql()?),
            DbmsType::new(Dbms::PostgreSql, postgresql()?),
            DbmsType::new(Dbms::Sqlite, sqlite()?),
            DbmsType::new(Dbms::Memory, memory()?),
        ])
    }

    /// Case-insensitive lookup by engine name.
    pub fn lookup(&self, name: &str) -> Result<&DbmsType> {
        self.types
            .iter()
            .find(|t| t.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| StreamError::UnknownDbms(name.to_string()))
    }

    pub fn get(&self, dbms: Dbms) -> Option<&DbmsType> {
        self.types.iter().find(|t| t.dbms() == dbms)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DbmsType> {
        self.types.iter()
    }
}

static REGISTRY: OnceLock<std::result::Result<DbmsRegistry, StreamError>> = OnceLock::new();

/// The process-wide registry of built-in engines, initialized on first use.
pub fn registry() -> Result<&'static DbmsRegistry> {
    let slot = REGISTRY.get_or_init(|| {
        debug!("initializing dbms registry");
        DbmsRegistry::builtin()
    });
    match slot {
        Ok(registry) => Ok(registry),
        Err(e) => Err(StreamError::configuration("registry", e.to_string())),
    }
}

fn mysql() -> Result<DialectDescriptor> {
    DialectDescriptor::builder("MySQL")
        .default_port(3306)
        .url_scheme("mysql")
        .named_schemas(false)
        .identifier_quote('`', '`')
        .string_quote('\'', '\'')
        .exclude_schemas(["information_schema"])
        .driver_name("mysql")
        .initial_query("select version() as `MySQL version`")
        .offset_without_limit("18446744073709551615")
        .build()
}

fn postgresql() -> Result<DialectDescriptor> {
    DialectDescriptor::builder("PostgreSQL")
        .default_port(5432)
        .url_scheme("postgresql")
        .named_schemas(true)
        .identifier_quote('"', '"')
        .string_quote('\'', '\'')
        .exclude_schemas(["information_schema", "pg_catalog", "pg_toast"])
        .driver_name("tokio-postgres")
        .initial_query("select version() as \"PostgreSQL version\"")
        .nulls_sort_low(false)
        .build()
}

fn sqlite() -> Result<DialectDescriptor> {
    DialectDescriptor::builder("SQLite")
        .url_scheme("sqlite")
        .named_schemas(false)
        .identifier_quote('"', '"')
        .string_quote('\'', '\'')
        .driver_name("sqlite")
        .initial_query("select sqlite_version() as \"SQLite version\"")
        .offset_without_limit("-1")
        .build()
}

fn memory() -> Result<DialectDescriptor> {
    DialectDescriptor::builder("Memory")
        .url_scheme("memory")
        .named_schemas(false)
        .identifier_quote('"', '"')
        .string_quote('\'', '\'')
        .driver_name("sqlstream-memory")
        .initial_query("select 1")
        .build()
}
