//! The seam between compiled statements and an engine.

use std::future::Future;

use super::query::StructuredError;
use crate::dialect::DriverVersionProvider;
use crate::error::{Result, StreamError};
use crate::stream::{EntityDef, Record, Value};

/// Rows returned by one statement, fully fetched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowStream {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowStream {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Position of `column`. Exact match first, then ASCII case-insensitive
    /// for engines that fold unquoted names.
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c == column)
            .or_else(|| self.columns.iter().position(|c| c.eq_ignore_ascii_case(column)))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Executes SQL with `?` placeholders and positional parameters.
pub trait Driver: DriverVersionProvider + Send + Sync {
    fn execute(
        &self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = std::result::Result<RowStream, StructuredError>> + Send;

    /// Run a statement that returns no rows; yields the affected row count.
    fn execute_update(
        &self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = std::result::Result<u64, StructuredError>> + Send;
}

/// Turns one fetched row into a record of the entity.
pub trait EntityMapper: Send + Sync {
    fn row_to_entity(&self, entity: &EntityDef, rows: &RowStream, row: &[Value]) -> Result<Record>;
}

/// Maps each entity field from the column of the same name.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnMapper;

impl EntityMapper for ColumnMapper {
    fn row_to_entity(&self, entity: &EntityDef, rows: &RowStream, row: &[Value]) -> Result<Record> {
        let mut record = Record::new();
        for field in entity.fields() {
            let value = rows
                .column_index(&field.column)
                .and_then(|idx| row.get(idx))
                .ok_or_else(|| StreamError::Mapping {
                    entity: entity.name().to_string(),
                    reason: format!("result has no column `{}`", field.column),
                })?;
            if !field.kind.accepts(value) {
                return Err(StreamError::Mapping {
                    entity: entity.name().to_string(),
                    reason: format!(
                        "column `{}` holds {} where {:?} was expected",
                        field.column, value, field.kind
                    ),
                });
            }
            record.set(field.name.clone(), value.clone());
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{FieldDef, FieldKind};

    fn entity() -> EntityDef {
        EntityDef::builder("person", "people")
            .field(FieldDef::new("id", FieldKind::Int))
            .field(FieldDef::new("name", FieldKind::Text).column("full_name"))
            .primary_key("id")
            .build()
            .unwrap()
    }

    #[test]
    fn test_column_mapper_uses_column_names() {
        let rows = RowStream {
            columns: vec!["FULL_NAME".into(), "id".into()],
            rows: vec![vec![Value::from("Ada"), Value::Int(1)]],
        };
        let record = ColumnMapper
            .row_to_entity(&entity(), &rows, &rows.rows[0])
            .unwrap();
        assert_eq!(record, Record::new().with("id", 1).with("name", "Ada"));
    }

    #[test]
    fn test_missing_column_is_mapping_error() {
        let rows = RowStream {
            columns: vec!["id".into()],
            rows: vec![vec![Value::Int(1)]],
        };
        let err = ColumnMapper
            .row_to_entity(&entity(), &rows, &rows.rows[0])
            .unwrap_err();
        assert!(matches!(err, StreamError::Mapping { .. }));
    }

    #[test]
    fn test_kind_mismatch_is_mapping_error() {
        let rows = RowStream {
            columns: vec!["id".into(), "full_name".into()],
            rows: vec![vec![Value::from("x"), Value::from("Ada")]],
        };
        let err = ColumnMapper
            .row_to_entity(&entity(), &rows, &rows.rows[0])
            .unwrap_err();
        assert!(err.to_string().contains("`id`"));
    }
}
