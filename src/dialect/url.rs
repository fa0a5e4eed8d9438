//! Connection URL construction.

use tracing::warn;

use super::descriptor::DialectDescriptor;
use super::Dbms;

/// Oldest MySQL driver generation the URL options are written for.
pub const OLDEST_MYSQL_DRIVER: u32 = 5;

/// Reports the major version of the client driver in use, when known.
pub trait DriverVersionProvider {
    fn driver_major_version(&self) -> Option<u32>;
}

/// A fixed version, typically read from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticVersion(pub Option<u32>);

impl DriverVersionProvider for StaticVersion {
    fn driver_major_version(&self) -> Option<u32> {
        self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: Option<u16>,
    pub database: Option<String>,
    /// Extra `key=value` options, appended after the engine's own.
    pub options: Vec<(String, String)>,
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }
}

pub(crate) fn build(
    dbms: Dbms,
    descriptor: &DialectDescriptor,
    params: &ConnectionParams,
    versions: &dyn DriverVersionProvider,
) -> String {
    let scheme = descriptor.url_scheme();
    let options = match dbms {
        Dbms::MySql => mysql_options(params, versions),
        _ => params.options.clone(),
    };
    match dbms {
        Dbms::Sqlite | Dbms::Memory => {
            format!("{scheme}:{}{}", params.host, query_string(&options))
        }
        Dbms::MySql | Dbms::PostgreSql => {
            let mut url = format!("{scheme}://{}", authority(params));
            // Without named schemas the database becomes the default schema.
            if descriptor.has_named_schemas() {
                if let Some(database) = &params.database {
                    url.push('/');
                    url.push_str(database);
                }
            }
            url.push_str(&query_string(&options));
            url
        }
    }
}

fn mysql_options(
    params: &ConnectionParams,
    versions: &dyn DriverVersionProvider,
) -> Vec<(String, String)> {
    let version = versions.driver_major_version().unwrap_or_else(|| {
        warn!(
            fallback = OLDEST_MYSQL_DRIVER,
            "mysql driver version unknown, using oldest supported options"
        );
        OLDEST_MYSQL_DRIVER
    });
    let mut options: Vec<(String, String)> = vec![
        ("useUnicode".into(), "true".into()),
        ("characterEncoding".into(), "UTF-8".into()),
        ("useServerPrepStmts".into(), "true".into()),
        (
            "zeroDateTimeBehavior".into(),
            if version >= 8 { "CONVERT_TO_NULL" } else { "convertToNull" }.into(),
        ),
        ("nullNamePatternMatchesAll".into(), "true".into()),
        ("useLegacyDatetimeCode".into(), "true".into()),
    ];
    if version <= 5 {
        options.push(("useSSL".into(), "false".into()));
    } else {
        options.push(("serverTimezone".into(), "UTC".into()));
    }
    options.extend(params.options.iter().cloned());
    options
}

fn authority(params: &ConnectionParams) -> String {
    match params.port {
        Some(port) => format!("{}:{}", params.host, port),
        None => params.host.clone(),
    }
}

fn query_string(options: &[(String, String)]) -> String {
    if options.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = options.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("?{}", pairs.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::registry;

    fn url(dbms: Dbms, params: &ConnectionParams, version: Option<u32>) -> String {
        registry()
            .unwrap()
            .get(dbms)
            .unwrap()
            .connection_url(params, &StaticVersion(version))
    }

    #[test]
    fn test_mysql_db_local_version_8() {
        let params = ConnectionParams::new("db.local").database("shop");
        let url = url(Dbms::MySql, &params, Some(8));
        assert_eq!(
            url,
            "mysql://db.local?useUnicode=true&characterEncoding=UTF-8&useServerPrepStmts=true\
             &zeroDateTimeBehavior=CONVERT_TO_NULL&nullNamePatternMatchesAll=true\
             &useLegacyDatetimeCode=true&serverTimezone=UTC"
        );
        assert!(!url.contains("shop"));
        assert!(!url.contains("convertToNull"));
    }

    #[test]
    fn test_mysql_legacy_driver() {
        let params = ConnectionParams::new("h").port(3307);
        let url = url(Dbms::MySql, &params, Some(5));
        assert!(url.starts_with("mysql://h:3307?"));
        assert!(url.contains("zeroDateTimeBehavior=convertToNull"));
        assert!(url.ends_with("&useSSL=false"));
    }

    #[test]
    fn test_mysql_unknown_version_uses_oldest() {
        let params = ConnectionParams::new("h");
        assert_eq!(url(Dbms::MySql, &params, None), url(Dbms::MySql, &params, Some(5)));
    }

    #[test]
    fn test_mysql_version_only_changes_conditional_options() {
        let params = ConnectionParams::new("h");
        let v6 = url(Dbms::MySql, &params, Some(6));
        let v8 = url(Dbms::MySql, &params, Some(8));
        assert_eq!(
            v6.replace("convertToNull", "CONVERT_TO_NULL"),
            v8
        );
    }

    #[test]
    fn test_extra_options_follow_engine_options_in_order() {
        let params = ConnectionParams::new("h").option("b", "2").option("a", "1");
        assert!(url(Dbms::MySql, &params, Some(8)).ends_with("serverTimezone=UTC&b=2&a=1"));
        assert_eq!(
            url(Dbms::PostgreSql, &params.clone().database("app"), None),
            "postgresql://h/app?b=2&a=1"
        );
    }

    #[test]
    fn test_postgres_sqlite_memory() {
        let params = ConnectionParams::new("localhost").port(5433).database("app");
        assert_eq!(
            url(Dbms::PostgreSql, &params, None),
            "postgresql://localhost:5433/app"
        );
        assert_eq!(
            url(Dbms::Sqlite, &ConnectionParams::new("/tmp/app.db"), None),
            "sqlite:/tmp/app.db"
        );
        assert_eq!(
            url(Dbms::Memory, &ConnectionParams::new("demo").option("seed", "1"), None),
            "memory:demo?seed=1"
        );
    }

    #[test]
    fn test_database_segment_follows_named_schemas() {
        let params = ConnectionParams::new("h").database("app");
        let flat = DialectDescriptor::builder("Flat")
            .url_scheme("postgresql")
            .named_schemas(false)
            .identifier_quote('"', '"')
            .string_quote('\'', '\'')
            .driver_name("test")
            .build()
            .unwrap();
        assert_eq!(
            build(Dbms::PostgreSql, &flat, &params, &StaticVersion(None)),
            "postgresql://h"
        );
        let schemas = DialectDescriptor::builder("Schemas")
            .url_scheme("mysql")
            .named_schemas(true)
            .identifier_quote('"', '"')
            .string_quote('\'', '\'')
            .driver_name("test")
            .build()
            .unwrap();
        assert!(build(Dbms::MySql, &schemas, &params, &StaticVersion(Some(8)))
            .starts_with("mysql://h/app?useUnicode=true"));
    }

    #[test]
    fn test_url_is_deterministic() {
        let params = ConnectionParams::new("h").port(1).option("x", "y");
        for dbms in Dbms::ALL {
            assert_eq!(url(dbms, &params, Some(8)), url(dbms, &params, Some(8)));
        }
    }
}
