use super::Dbms;
use crate::stream::FieldDef;

/// Which columns an engine wants left out of INSERT and UPDATE bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnPolicy {
    dbms: Dbms,
}

impl ColumnPolicy {
    pub fn new(dbms: Dbms) -> Self {
        Self { dbms }
    }

    pub fn excluded_from_insert(&self, field: &FieldDef) -> bool {
        match self.dbms {
            // MySQL takes every column, auto-increment ones included.
            Dbms::MySql => false,
            Dbms::PostgreSql | Dbms::Sqlite | Dbms::Memory => {
                field.auto_increment || field.generated
            }
        }
    }

    pub fn excluded_from_update(&self, field: &FieldDef) -> bool {
        match self.dbms {
            Dbms::MySql => false,
            Dbms::PostgreSql | Dbms::Sqlite | Dbms::Memory => field.generated,
        }
    }
}
