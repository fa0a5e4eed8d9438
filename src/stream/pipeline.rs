//! Immutable operation pipelines.
//!
//! Every append returns a new [`Pipeline`]; the receiver is left untouched
//! and can be extended in other directions.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use super::entity::{EntityDef, FieldDef};
use super::predicate::PredicateSpec;
use super::value::Record;
use crate::error::{Result, StreamError};

pub type FilterFn = Arc<dyn Fn(&Record) -> bool + Send + Sync>;
pub type CompareFn = Arc<dyn Fn(&Record, &Record) -> Ordering + Send + Sync>;
pub type MapFn = Arc<dyn Fn(&Record) -> Record + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }

    /// Compare two records on this key. `NULL` sorts low in both directions
    /// of the underlying order, so it comes last when descending.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let ord = a.value(&self.field).order_cmp(b.value(&self.field));
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }
}

/// A MAP step: the new shape and the function producing it.
#[derive(Clone)]
pub struct Projection {
    name: String,
    fields: Vec<FieldDef>,
    f: MapFn,
}

impl Projection {
    pub fn new(
        name: impl Into<String>,
        fields: Vec<FieldDef>,
        f: impl Fn(&Record) -> Record + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            fields,
            f: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn apply(&self, record: &Record) -> Record {
        (self.f)(record)
    }
}

impl fmt::Debug for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projection")
            .field("name", &self.name)
            .field("fields", &self.fields.iter().map(|d| &d.name).collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Clone)]
pub enum Op {
    Filter(PredicateSpec),
    FilterWith(FilterFn),
    Sort(SortKey),
    SortWith(CompareFn),
    Skip(u64),
    Limit(u64),
    Map(Projection),
}

impl Op {
    /// Short label used in plan output and logs.
    pub fn describe(&self) -> String {
        match self {
            Op::Filter(spec) => {
                let values: Vec<String> =
                    spec.operand_values().iter().map(|v| v.to_string()).collect();
                if values.is_empty() {
                    format!("filter({} {})", spec.field(), spec.operator().symbol())
                } else {
                    format!(
                        "filter({} {} {})",
                        spec.field(),
                        spec.operator().symbol(),
                        values.join(", ")
                    )
                }
            }
            Op::FilterWith(_) => "filter(<closure>)".to_string(),
            Op::Sort(key) => format!(
                "sort({} {})",
                key.field,
                if key.descending { "desc" } else { "asc" }
            ),
            Op::SortWith(_) => "sort(<comparator>)".to_string(),
            Op::Skip(n) => format!("skip({n})"),
            Op::Limit(n) => format!("limit({n})"),
            Op::Map(p) => format!("map({})", p.name()),
        }
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// The record shape at some point of a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl Shape {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    entity: Arc<EntityDef>,
    shape: Shape,
    ops: Vec<Op>,
}

impl Pipeline {
    /// A pipeline over all rows of `entity`, in primary-key order.
    pub fn new(entity: Arc<EntityDef>) -> Self {
        let shape = Shape {
            name: entity.name().to_string(),
            fields: entity.fields().to_vec(),
        };
        Self {
            entity,
            shape,
            ops: Vec::new(),
        }
    }

    pub fn entity(&self) -> &Arc<EntityDef> {
        &self.entity
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    fn push(&self, op: Op) -> Self {
        let mut next = self.clone();
        next.ops.push(op);
        next
    }

    fn require_field(&self, field: &str) -> Result<()> {
        match self.shape.field(field) {
            Some(_) => Ok(()),
            None => Err(StreamError::invalid_reference(&self.shape.name, field)),
        }
    }

    pub fn filter(&self, spec: PredicateSpec) -> Result<Self> {
        self.require_field(spec.field())?;
        Ok(self.push(Op::Filter(spec)))
    }

    /// Filter with an arbitrary closure. Never pushed to the engine.
    pub fn filter_with(&self, f: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Self {
        self.push(Op::FilterWith(Arc::new(f)))
    }

    pub fn sorted(&self, key: SortKey) -> Result<Self> {
        self.require_field(&key.field)?;
        Ok(self.push(Op::Sort(key)))
    }

    /// Stable sort with an arbitrary comparator. Never pushed to the engine.
    pub fn sorted_with(
        &self,
        cmp: impl Fn(&Record, &Record) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        self.push(Op::SortWith(Arc::new(cmp)))
    }

    pub fn skip(&self, n: u64) -> Self {
        self.push(Op::Skip(n))
    }

    pub fn limit(&self, n: u64) -> Self {
        self.push(Op::Limit(n))
    }

    pub fn map(&self, projection: Projection) -> Self {
        let mut next = self.push(Op::Map(projection.clone()));
        next.shape = Shape {
            name: projection.name,
            fields: projection.fields,
        };
        next
    }

    /// MAP to a subset of the current fields, in the given order.
    pub fn select(&self, name: impl Into<String>, fields: &[&str]) -> Result<Self> {
        let mut defs = Vec::with_capacity(fields.len());
        for field in fields {
            let def = self
                .shape
                .field(field)
                .ok_or_else(|| StreamError::invalid_reference(&self.shape.name, *field))?;
            defs.push(def.clone());
        }
        let names: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        Ok(self.map(Projection::new(name, defs, move |record: &Record| {
            names
                .iter()
                .map(|n| (n.clone(), record.value(n).clone()))
                .collect()
        })))
    }
}
