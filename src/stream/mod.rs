//! Declarative stream pipelines over entities.
//!
//! A [`Pipeline`] is built from filters, sorts, paging and projections. At
//! the terminal operation the [`Terminator`] compiles the longest pushable
//! prefix into one SQL statement (see [`planner`]) and replays the rest on
//! the fetched records.

pub mod entity;
pub mod pipeline;
pub mod planner;
pub mod predicate;
pub mod terminator;
pub mod value;

pub use entity::{EntityBuilder, EntityDef, FieldDef, FieldKind};
pub use pipeline::{CompareFn, FilterFn, MapFn, Op, Pipeline, Projection, Shape, SortKey};
pub use planner::{plan, PushdownPlan, PushedState};
pub use predicate::{like_match, Operand, Operator, PredicateSpec};
pub use terminator::{TerminalAction, TerminalResult, Terminator};
pub use value::{Record, Value};
