//! Entity metadata: the fields a pipeline may reference and the columns
//! they live in.

use serde::{Deserialize, Serialize};

use super::value::Value;
use crate::error::{Result, StreamError};

/// Storage kind of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Text,
    Date,
    Timestamp,
}

impl FieldKind {
    /// Whether `value` can be compared against a column of this kind
    /// without the engine applying an implicit conversion. `NULL` is
    /// accepted everywhere; integers are accepted by float columns.
    pub fn accepts(&self, value: &Value) -> bool {
        match value.kind() {
            None => true,
            Some(kind) => kind == *self || (*self == FieldKind::Float && kind == FieldKind::Int),
        }
    }
}

/// One field of an entity or projection.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub column: String,
    pub kind: FieldKind,
    pub nullable: bool,
    /// Value assigned by the engine on insert (identity / serial / AUTO_INCREMENT).
    pub auto_increment: bool,
    /// Computed by the engine from other columns; never written.
    pub generated: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            kind,
            nullable: false,
            auto_increment: false,
            generated: false,
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }
}

/// A table-backed entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDef {
    name: String,
    schema: Option<String>,
    table: String,
    fields: Vec<FieldDef>,
    primary_key: usize,
}

impl EntityDef {
    pub fn builder(name: impl Into<String>, table: impl Into<String>) -> EntityBuilder {
        EntityBuilder {
            name: name.into(),
            schema: None,
            table: table.into(),
            fields: Vec::new(),
            primary_key: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_key(&self) -> &FieldDef {
        &self.fields[self.primary_key]
    }
}

pub struct EntityBuilder {
    name: String,
    schema: Option<String>,
    table: String,
    fields: Vec<FieldDef>,
    primary_key: Option<String>,
}

impl EntityBuilder {
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = Some(field.into());
        self
    }

    pub fn build(self) -> Result<EntityDef> {
        if self.table.is_empty() {
            return Err(StreamError::configuration(&self.name, "empty table name"));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(StreamError::configuration(
                    &self.name,
                    format!("duplicate field `{}`", field.name),
                ));
            }
        }
        let pk_name = self
            .primary_key
            .ok_or_else(|| StreamError::configuration(&self.name, "no primary key declared"))?;
        let primary_key = self
            .fields
            .iter()
            .position(|f| f.name == pk_name)
            .ok_or_else(|| StreamError::invalid_reference(&self.name, &pk_name))?;
        Ok(EntityDef {
            name: self.name,
            schema: self.schema,
            table: self.table,
            fields: self.fields,
            primary_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_entity() {
        let entity = EntityDef::builder("person", "people")
            .schema("app")
            .field(FieldDef::new("id", FieldKind::Int).auto_increment())
            .field(FieldDef::new("name", FieldKind::Text).column("full_name"))
            .primary_key("id")
            .build()
            .unwrap();
        assert_eq!(entity.primary_key().name, "id");
        assert_eq!(entity.field("name").unwrap().column, "full_name");
        assert_eq!(entity.schema(), Some("app"));
    }

    #[test]
    fn test_missing_primary_key_field() {
        let err = EntityDef::builder("person", "people")
            .field(FieldDef::new("id", FieldKind::Int))
            .primary_key("uuid")
            .build()
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidReference { .. }));
    }

    #[test]
    fn test_duplicate_field() {
        let err = EntityDef::builder("person", "people")
            .field(FieldDef::new("id", FieldKind::Int))
            .field(FieldDef::new("id", FieldKind::Text))
            .primary_key("id")
            .build()
            .unwrap_err();
        assert!(matches!(err, StreamError::Configuration { .. }));
    }

    #[test]
    fn test_kind_accepts() {
        assert!(FieldKind::Float.accepts(&Value::Int(1)));
        assert!(!FieldKind::Int.accepts(&Value::Float(1.0)));
        assert!(FieldKind::Text.accepts(&Value::Null));
        assert!(!FieldKind::Text.accepts(&Value::Int(1)));
    }
}
