//! Saved connections.
//!
//! Stored as TOML under `<config_dir>/sqlstream/connections.toml`. Passwords
//! are never written; they come from the environment or a prompt.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::dialect::{registry, ConnectionParams, DbmsType, StaticVersion};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    pub name: String,
    /// Registered engine name, matched case-insensitively.
    #[serde(default = "default_dbms")]
    pub dbms: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Skip certificate verification in Prefer/Require modes.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// PEM bundle of extra trusted roots.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    /// Major version of the client driver, when the URL options depend on it.
    #[serde(default)]
    pub driver_version: Option<u32>,
    /// Extra URL options, appended in order.
    #[serde(default)]
    pub options: Vec<(String, String)>,
}

/// SSL/TLS connection modes, as in the PostgreSQL `sslmode` parameter.
///
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

fn default_dbms() -> String {
    "PostgreSQL".to_string()
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>, dbms: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dbms: dbms.into(),
            host: host.into(),
            port: None,
            database: None,
            username: String::new(),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            driver_version: None,
            options: Vec::new(),
        }
    }

    pub fn dbms_type(&self) -> Result<&'static DbmsType> {
        let dbms = registry()?
            .lookup(&self.dbms)
            .with_context(|| format!("connection `{}`", self.name))?;
        Ok(dbms)
    }

    pub fn params(&self) -> ConnectionParams {
        ConnectionParams {
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            options: self.options.clone(),
        }
    }

    pub fn version(&self) -> StaticVersion {
        StaticVersion(self.driver_version)
    }

    pub fn url(&self) -> Result<String> {
        Ok(self.dbms_type()?.connection_url(&self.params(), &self.version()))
    }

    /// Port to connect to: the configured one or the engine's default.
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| {
            self.dbms_type()
                .ok()
                .and_then(|d| d.descriptor().default_port())
        })
    }

    pub fn display_string(&self) -> String {
        let mut s = String::new();
        if !self.username.is_empty() {
            s.push_str(&self.username);
            s.push('@');
        }
        s.push_str(&self.host);
        if let Some(port) = self.effective_port() {
            s.push_str(&format!(":{}", port));
        }
        if let Some(db) = &self.database {
            s.push('/');
            s.push_str(db);
        }
        s
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SavedConnections {
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl SavedConnections {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sqlstream")
            .join("connections.toml")
    }

    /// Load from the default location; a missing file is an empty set.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize connections")?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn find(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.iter().find(|c| c.name == name)
    }

    /// Add or replace the connection with the same name.
    pub fn upsert(&mut self, config: ConnectionConfig) {
        match self.connections.iter_mut().find(|c| c.name == config.name) {
            Some(slot) => *slot = config,
            None => self.connections.push(config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mysql() -> ConnectionConfig {
        let mut c = ConnectionConfig::new("legacy", "mysql", "db.local");
        c.database = Some("shop".into());
        c.username = "app".into();
        c.password = "hunter2".into();
        c.driver_version = Some(8);
        c
    }

    #[test]
    fn test_url_from_config() {
        let url = mysql().url().unwrap();
        assert!(url.starts_with("mysql://db.local?useUnicode=true"));
        assert!(url.contains("zeroDateTimeBehavior=CONVERT_TO_NULL"));
        assert!(url.ends_with("serverTimezone=UTC"));
    }

    #[test]
    fn test_unknown_dbms() {
        let c = ConnectionConfig::new("x", "oracle", "h");
        let err = c.url().unwrap_err();
        assert!(format!("{:#}", err).contains("oracle"));
    }

    #[test]
    fn test_display_uses_default_port() {
        assert_eq!(mysql().display_string(), "app@db.local:3306/shop");
        let sqlite = ConnectionConfig::new("file", "SQLite", "/tmp/app.db");
        assert_eq!(sqlite.display_string(), "/tmp/app.db");
    }

    #[test]
    fn test_toml_round_trip_drops_password() {
        let mut saved = SavedConnections::default();
        saved.upsert(mysql());
        let mut pg = ConnectionConfig::new("main", "PostgreSQL", "localhost");
        pg.options.push(("application_name".into(), "sqlstream".into()));
        pg.ssl_mode = SslMode::VerifyFull;
        saved.upsert(pg);

        let path = std::env::temp_dir()
            .join(format!("sqlstream-config-{}", std::process::id()))
            .join("connections.toml");
        saved.save_to(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("hunter2"));

        let loaded = SavedConnections::load_from(&path).unwrap();
        assert_eq!(loaded.connections.len(), 2);
        let legacy = loaded.find("legacy").unwrap();
        assert_eq!(legacy.password, "");
        assert_eq!(legacy.driver_version, Some(8));
        assert_eq!(loaded.find("main").unwrap().ssl_mode, SslMode::VerifyFull);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_defaults_when_fields_missing() {
        let loaded: SavedConnections = toml::from_str(
            r#"
            [[connections]]
            name = "bare"
            host = "localhost"
            "#,
        )
        .unwrap();
        let bare = &loaded.connections[0];
        assert_eq!(bare.dbms, "PostgreSQL");
        assert_eq!(bare.ssl_mode, SslMode::Prefer);
        assert_eq!(bare.effective_port(), Some(5432));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let path = std::env::temp_dir().join("sqlstream-does-not-exist.toml");
        assert!(SavedConnections::load_from(&path).unwrap().connections.is_empty());
    }
}
