//! Engine dialects.
//!
//! Each supported engine is a [`Dbms`] variant. A [`DbmsType`] pairs the
//! variant with its [`DialectDescriptor`] and hands out the per-engine
//! [`PredicateView`] and [`ColumnPolicy`]. Instances live in the process-wide
//! registry and are looked up by name.

pub mod column;
pub mod descriptor;
pub mod fragment;
pub mod predicate;
pub mod registry;
pub mod url;

use std::fmt;

pub use column::ColumnPolicy;
pub use descriptor::{DescriptorBuilder, DialectDescriptor};
pub use fragment::{number_placeholders, placeholder_offsets, SqlFragment};
pub use predicate::{PredicateView, Translation};
pub use registry::{registry, DbmsRegistry};
pub use url::{ConnectionParams, DriverVersionProvider, StaticVersion};

/// The closed set of supported engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dbms {
    MySql,
    PostgreSql,
    Sqlite,
    Memory,
}

impl Dbms {
    pub const ALL: [Dbms; 4] = [Dbms::MySql, Dbms::PostgreSql, Dbms::Sqlite, Dbms::Memory];
}

impl fmt::Display for Dbms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dbms::MySql => write!(f, "MySQL"),
            Dbms::PostgreSql => write!(f, "PostgreSQL"),
            Dbms::Sqlite => write!(f, "SQLite"),
            Dbms::Memory => write!(f, "Memory"),
        }
    }
}

/// A registered engine: its variant plus the descriptor built for it.
#[derive(Debug, Clone, PartialEq)]
pub struct DbmsType {
    dbms: Dbms,
    descriptor: DialectDescriptor,
}

impl DbmsType {
    pub fn new(dbms: Dbms, descriptor: DialectDescriptor) -> Self {
        Self { dbms, descriptor }
    }

    pub fn dbms(&self) -> Dbms {
        self.dbms
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &DialectDescriptor {
        &self.descriptor
    }

    pub fn predicate_view(&self) -> PredicateView<'_> {
        PredicateView::new(self.dbms, &self.descriptor)
    }

    pub fn column_policy(&self) -> ColumnPolicy {
        ColumnPolicy::new(self.dbms)
    }

    /// Build the connection URL for this engine. Never fails: an unknown
    /// driver version falls back to the oldest supported one.
    pub fn connection_url(
        &self,
        params: &ConnectionParams,
        versions: &dyn DriverVersionProvider,
    ) -> String {
        url::build(self.dbms, &self.descriptor, params, versions)
    }
}
