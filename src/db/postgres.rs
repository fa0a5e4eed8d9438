//! PostgreSQL driver over tokio-postgres.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use postgres_native_tls::MakeTlsConnector;
use std::time::Duration;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls, Statement};
use tracing::{debug, error};

use super::driver::{Driver, RowStream};
use super::query::{decode_value, ErrorCategory, StructuredError};
use crate::config::{ConnectionConfig, SslMode};
use crate::dialect::{number_placeholders, Dbms, DriverVersionProvider};
use crate::stream::Value;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

type Param = Box<dyn ToSql + Sync + Send>;

pub struct PostgresDriver {
    client: Client,
}

impl PostgresDriver {
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the URL the PostgreSQL descriptor builds for `config`.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let dbms = config.dbms_type()?;
        if dbms.dbms() != Dbms::PostgreSql {
            bail!(
                "connection `{}` is for {}, not PostgreSQL",
                config.name,
                dbms.name()
            );
        }
        let url = config.url()?;
        let mut pg: tokio_postgres::Config = url
            .parse()
            .with_context(|| format!("Invalid connection URL {}", url))?;
        if !config.username.is_empty() {
            pg.user(&config.username);
        }
        if !config.password.is_empty() {
            pg.password(&config.password);
        }
        pg.connect_timeout(Duration::from_secs(10));
        pg.ssl_mode(match config.ssl_mode {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
                tokio_postgres::config::SslMode::Require
            }
        });
        debug!(server = %config.display_string(), ssl = ?config.ssl_mode, "connecting");

        let client = match config.ssl_mode {
            SslMode::Disable => {
                let (client, connection) = tokio::time::timeout(CONNECT_TIMEOUT, pg.connect(NoTls))
                    .await
                    .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                    .context("Failed to connect to PostgreSQL")?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        error!(error = %e, "connection error");
                    }
                });
                client
            }
            mode => {
                let strict = matches!(mode, SslMode::VerifyCa | SslMode::VerifyFull);
                let tls = build_tls_connector(config, strict)?;
                let (client, connection) = tokio::time::timeout(CONNECT_TIMEOUT, pg.connect(tls))
                    .await
                    .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                    .context("Failed to connect to PostgreSQL")?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        error!(error = %e, "connection error");
                    }
                });
                client
            }
        };

        Ok(Self { client })
    }

    async fn prepare(&self, sql: &str) -> std::result::Result<(String, Statement), StructuredError> {
        let numbered = number_placeholders(sql);
        let statement = self
            .client
            .prepare(&numbered)
            .await
            .map_err(|e| StructuredError::from_pg_error(&e, &numbered))?;
        Ok((numbered, statement))
    }
}

impl DriverVersionProvider for PostgresDriver {
    fn driver_major_version(&self) -> Option<u32> {
        None
    }
}

impl Driver for PostgresDriver {
    async fn execute(
        &self,
        sql: &str,
        params: &[Value],
    ) -> std::result::Result<RowStream, StructuredError> {
        let (numbered, statement) = self.prepare(sql).await?;
        let bound = bind(&statement, params)?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = self
            .client
            .query(&statement, &refs)
            .await
            .map_err(|e| StructuredError::from_pg_error(&e, &numbered))?;

        let mut out = RowStream::new(
            statement
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        );
        for row in &rows {
            let values = row
                .columns()
                .iter()
                .enumerate()
                .map(|(i, col)| decode_value(row, i, col.type_()))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| StructuredError::from_pg_error(&e, &numbered))?;
            out.rows.push(values);
        }
        Ok(out)
    }

    async fn execute_update(
        &self,
        sql: &str,
        params: &[Value],
    ) -> std::result::Result<u64, StructuredError> {
        let (numbered, statement) = self.prepare(sql).await?;
        let bound = bind(&statement, params)?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        self.client
            .execute(&statement, &refs)
            .await
            .map_err(|e| StructuredError::from_pg_error(&e, &numbered))
    }
}

/// Convert values to the parameter types the server inferred for the
/// prepared statement.
fn bind(statement: &Statement, params: &[Value]) -> std::result::Result<Vec<Param>, StructuredError> {
    let types = statement.params();
    if types.len() != params.len() {
        return Err(StructuredError::new(
            ErrorCategory::Execution,
            format!(
                "statement expects {} parameters, {} given",
                types.len(),
                params.len()
            ),
        )
        .with_code("08P01"));
    }
    types.iter().zip(params).map(|(ty, v)| encode(v, ty)).collect()
}

fn encode(value: &Value, ty: &Type) -> std::result::Result<Param, StructuredError> {
    let out_of_range = || {
        StructuredError::new(
            ErrorCategory::Execution,
            format!("{} is out of range for type {}", value, ty),
        )
        .with_code("22003")
    };
    let param: Param = match value {
        Value::Null => typed_null(ty),
        Value::Bool(b) => Box::new(*b),
        Value::Int(i) => match *ty {
            Type::INT2 => Box::new(i16::try_from(*i).map_err(|_| out_of_range())?),
            Type::INT4 => Box::new(i32::try_from(*i).map_err(|_| out_of_range())?),
            Type::FLOAT4 => Box::new(*i as f32),
            Type::FLOAT8 => Box::new(*i as f64),
            _ => Box::new(*i),
        },
        Value::Float(f) => match *ty {
            Type::FLOAT4 => Box::new(*f as f32),
            _ => Box::new(*f),
        },
        Value::Text(s) => Box::new(s.clone()),
        Value::Date(d) => Box::new(*d),
        Value::Timestamp(ts) => match *ty {
            Type::TIMESTAMPTZ => Box::new(ts.and_utc()),
            _ => Box::new(*ts),
        },
    };
    Ok(param)
}

/// A `NULL` of a Rust type the server's parameter type accepts.
fn typed_null(ty: &Type) -> Param {
    match *ty {
        Type::BOOL => Box::new(None::<bool>),
        Type::INT2 => Box::new(None::<i16>),
        Type::INT4 => Box::new(None::<i32>),
        Type::INT8 => Box::new(None::<i64>),
        Type::FLOAT4 => Box::new(None::<f32>),
        Type::FLOAT8 => Box::new(None::<f64>),
        Type::DATE => Box::new(None::<NaiveDate>),
        Type::TIMESTAMP => Box::new(None::<NaiveDateTime>),
        Type::TIMESTAMPTZ => Box::new(None::<DateTime<Utc>>),
        _ => Box::new(None::<String>),
    }
}

/// Build a TLS connector. `strict_verify` is set for verify-ca/verify-full
/// and ignores `accept_invalid_certs`.
fn build_tls_connector(config: &ConnectionConfig, strict_verify: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let pem = std::fs::read_to_string(ca_path)
            .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
        let blocks = pem_blocks(&pem);
        if blocks.is_empty() {
            bail!("No certificates found in {}", ca_path);
        }
        for block in blocks {
            let cert = native_tls::Certificate::from_pem(block.as_bytes())
                .context("Failed to parse certificate")?;
            builder.add_root_certificate(cert);
        }
    }

    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into its individual certificate blocks.
fn pem_blocks(pem: &str) -> Vec<&str> {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";
    let mut blocks = Vec::new();
    let mut rest = pem;
    while let Some(start) = rest.find(BEGIN) {
        let Some(len) = rest[start..].find(END) else {
            break;
        };
        let end = start + len + END.len();
        blocks.push(&rest[start..end]);
        rest = &rest[end..];
    }
    blocks
}
