//! INSERT and UPDATE of single entity records.
//!
//! Which columns appear is decided by the engine's [`ColumnPolicy`]
//! (`crate::dialect::ColumnPolicy`); the primary key never appears in an
//! UPDATE SET list and always forms its WHERE.

use tracing::debug;

use super::driver::Driver;
use crate::ast::{self, Assignment, BinaryOperator, Expression, InsertQuery, Query, TableRef, UpdateQuery};
use crate::dialect::{DbmsType, SqlFragment};
use crate::error::{Result, StreamError};
use crate::stream::{EntityDef, Record};

pub struct Persister<'a, D> {
    dbms: &'a DbmsType,
    driver: &'a D,
}

impl<'a, D: Driver> Persister<'a, D> {
    pub fn new(dbms: &'a DbmsType, driver: &'a D) -> Self {
        Self { dbms, driver }
    }

    pub fn insert_statement(&self, entity: &EntityDef, record: &Record) -> Result<SqlFragment> {
        let policy = self.dbms.column_policy();
        let mut columns = Vec::new();
        let mut values = Vec::new();
        let mut parameters = Vec::new();
        for field in entity.fields() {
            if policy.excluded_from_insert(field) {
                continue;
            }
            columns.push(field.column.clone());
            parameters.push(record.value(&field.name).clone());
            values.push(Expression::Parameter(parameters.len()));
        }

        let query = Query::Insert(InsertQuery {
            table: table_ref(entity),
            columns,
            values: if values.is_empty() { Vec::new() } else { vec![values] },
        });
        let fragment = SqlFragment::new(ast::compile(&query, self.dbms.descriptor()), parameters);
        fragment.check_alignment()?;
        Ok(fragment)
    }

    /// `None` when the policy leaves no column to assign.
    pub fn update_statement(
        &self,
        entity: &EntityDef,
        record: &Record,
    ) -> Result<Option<SqlFragment>> {
        let policy = self.dbms.column_policy();
        let pk = entity.primary_key();
        let key = record.value(&pk.name);
        if key.is_null() {
            return Err(StreamError::Mapping {
                entity: entity.name().to_string(),
                reason: format!("cannot update without a value for primary key `{}`", pk.name),
            });
        }

        let mut assignments = Vec::new();
        let mut parameters = Vec::new();
        for field in entity.fields() {
            if field.name == pk.name || policy.excluded_from_update(field) {
                continue;
            }
            parameters.push(record.value(&field.name).clone());
            assignments.push(Assignment {
                column: field.column.clone(),
                value: Expression::Parameter(parameters.len()),
            });
        }
        if assignments.is_empty() {
            return Ok(None);
        }
        parameters.push(key.clone());

        let query = Query::Update(UpdateQuery {
            table: table_ref(entity),
            assignments,
            filter: Some(Expression::BinaryOp {
                left: Box::new(Expression::column(&pk.column)),
                op: BinaryOperator::Eq,
                right: Box::new(Expression::Parameter(parameters.len())),
            }),
        });
        let fragment = SqlFragment::new(ast::compile(&query, self.dbms.descriptor()), parameters);
        fragment.check_alignment()?;
        Ok(Some(fragment))
    }

    /// Insert `record`; returns the affected row count.
    pub async fn insert(&self, entity: &EntityDef, record: &Record) -> Result<u64> {
        let statement = self.insert_statement(entity, record)?;
        self.run(&statement).await
    }

    pub async fn update(&self, entity: &EntityDef, record: &Record) -> Result<u64> {
        match self.update_statement(entity, record)? {
            Some(statement) => self.run(&statement).await,
            None => {
                debug!(entity = entity.name(), "no updatable columns");
                Ok(0)
            }
        }
    }

    async fn run(&self, statement: &SqlFragment) -> Result<u64> {
        debug!(dbms = self.dbms.name(), sql = %statement.text, "executing update");
        self.driver
            .execute_update(&statement.text, &statement.parameters)
            .await
            .map_err(|cause| StreamError::Execution {
                sql: statement.text.clone(),
                parameters: statement.parameters.clone(),
                cause,
            })
    }
}

fn table_ref(entity: &EntityDef) -> TableRef {
    TableRef::Table {
        schema: entity.schema().map(String::from),
        name: entity.table().to_string(),
        alias: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDriver;
    use crate::dialect::{registry, Dbms};
    use crate::stream::{FieldDef, FieldKind, Value};

    fn dbms(d: Dbms) -> &'static DbmsType {
        registry().unwrap().get(d).unwrap()
    }

    fn accounts() -> EntityDef {
        EntityDef::builder("account", "accounts")
            .schema("bank")
            .field(FieldDef::new("id", FieldKind::Int).auto_increment())
            .field(FieldDef::new("owner", FieldKind::Text))
            .field(FieldDef::new("balance", FieldKind::Float))
            .field(FieldDef::new("label", FieldKind::Text).generated().nullable())
            .primary_key("id")
            .build()
            .unwrap()
    }

    fn record() -> Record {
        Record::new()
            .with("id", 7)
            .with("owner", "ann")
            .with("balance", 10.5)
            .with("label", Value::Null)
    }

    #[test]
    fn test_mysql_writes_every_column() {
        let driver = MemoryDriver::new();
        let p = Persister::new(dbms(Dbms::MySql), &driver);
        let insert = p.insert_statement(&accounts(), &record()).unwrap();
        assert_eq!(
            insert.text,
            "INSERT INTO `accounts` (`id`, `owner`, `balance`, `label`) VALUES (?, ?, ?, ?)"
        );
        let update = p.update_statement(&accounts(), &record()).unwrap().unwrap();
        assert_eq!(
            update.text,
            "UPDATE `accounts` SET `owner` = ?, `balance` = ?, `label` = ? WHERE `id` = ?"
        );
        assert_eq!(update.parameters.last(), Some(&Value::Int(7)));
    }

    #[test]
    fn test_postgres_skips_identity_and_generated() {
        let driver = MemoryDriver::new();
        let p = Persister::new(dbms(Dbms::PostgreSql), &driver);
        let insert = p.insert_statement(&accounts(), &record()).unwrap();
        assert_eq!(
            insert.text,
            "INSERT INTO \"bank\".\"accounts\" (\"owner\", \"balance\") VALUES (?, ?)"
        );
        assert_eq!(insert.parameters, vec![Value::from("ann"), Value::Float(10.5)]);
        let update = p.update_statement(&accounts(), &record()).unwrap().unwrap();
        assert_eq!(
            update.text,
            "UPDATE \"bank\".\"accounts\" SET \"owner\" = ?, \"balance\" = ? WHERE \"id\" = ?"
        );
    }

    #[test]
    fn test_update_requires_primary_key() {
        let driver = MemoryDriver::new();
        let p = Persister::new(dbms(Dbms::Sqlite), &driver);
        let err = p
            .update_statement(&accounts(), &record().with("id", Value::Null))
            .unwrap_err();
        assert!(matches!(err, StreamError::Mapping { .. }));
    }

    #[test]
    fn test_nothing_to_update() {
        let entity = EntityDef::builder("tag", "tags")
            .field(FieldDef::new("id", FieldKind::Int))
            .primary_key("id")
            .build()
            .unwrap();
        let driver = MemoryDriver::new();
        let p = Persister::new(dbms(Dbms::PostgreSql), &driver);
        assert!(p
            .update_statement(&entity, &Record::new().with("id", 1))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_round_trip_through_memory_engine() {
        let entity = accounts();
        let driver = MemoryDriver::new();
        driver.create_table(&entity);
        let p = Persister::new(dbms(Dbms::Memory), &driver);

        assert_eq!(p.insert(&entity, &record()).await.unwrap(), 1);
        assert_eq!(p.insert(&entity, &record()).await.unwrap(), 1);
        let table = driver.dump("accounts").unwrap();
        assert_eq!(table.rows[0][0], Value::Int(1));
        assert_eq!(table.rows[1][0], Value::Int(2));

        let changed = record().with("id", 2).with("owner", "bo");
        assert_eq!(p.update(&entity, &changed).await.unwrap(), 1);
        let table = driver.dump("accounts").unwrap();
        assert_eq!(table.rows[1][1], Value::from("bo"));
        assert_eq!(table.rows[0][1], Value::from("ann"));
    }

    #[tokio::test]
    async fn test_engine_failure_is_execution_error() {
        let driver = MemoryDriver::new();
        let p = Persister::new(dbms(Dbms::Memory), &driver);
        let err = p.insert(&accounts(), &record()).await.unwrap_err();
        assert!(err.is_execution());
    }
}
