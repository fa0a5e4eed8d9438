//! Pushdown planning.
//!
//! [`plan`] scans a pipeline left to right and folds the longest prefix the
//! engine can evaluate exactly into a [`PushedState`]. The scan stops at the
//! first operation that is
//!
//! * a closure filter or comparator,
//! * a MAP (later operations see a projection, not table columns),
//! * a filter the dialect cannot translate,
//! * a filter or sort following a pushed skip/limit (SQL applies WHERE and
//!   ORDER BY before OFFSET/LIMIT, so pushing it would reorder the pipeline).
//!
//! Nothing after the stop point is pushed. The folded state then compiles to
//! a single SELECT through the [`crate::ast`] compiler.

use tracing::debug;

use super::entity::EntityDef;
use super::pipeline::{Op, Pipeline, SortKey};
use super::predicate::PredicateSpec;
use super::value::Value;
use crate::ast::{self, Expression, OrderByExpr, Query, SelectItem, SelectQuery, TableRef};
use crate::dialect::{DbmsType, SqlFragment, Translation};
use crate::error::{Result, StreamError};

/// Alias of the derived table a paged COUNT selects from.
const COUNT_ALIAS: &str = "counted";

/// Pipeline operations folded into one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushedState {
    pub filters: Vec<PredicateSpec>,
    /// Most significant key first. The primary key is appended at compile
    /// time and never stored here.
    pub order: Vec<SortKey>,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl PushedState {
    /// A later sort becomes the primary key of the ordering; earlier sorts
    /// on other fields remain as tie-breakers.
    pub fn push_sort(&mut self, key: SortKey) {
        self.order.retain(|k| k.field != key.field);
        self.order.insert(0, key);
    }

    pub fn push_skip(&mut self, n: u64) {
        self.offset = self.offset.saturating_add(n);
        self.limit = self.limit.map(|l| l.saturating_sub(n));
    }

    pub fn push_limit(&mut self, n: u64) {
        self.limit = Some(self.limit.map_or(n, |l| l.min(n)));
    }

    pub fn is_paged(&self) -> bool {
        self.offset > 0 || self.limit.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct PushdownPlan {
    /// The compiled SELECT, `None` when nothing was pushed.
    pub fragment: Option<SqlFragment>,
    pub pushed_prefix_len: usize,
    pub remaining: Vec<Op>,
    pub pushed: PushedState,
}

impl PushdownPlan {
    /// A plan that pushes nothing: the whole pipeline replays in memory.
    pub fn in_memory(pipeline: &Pipeline) -> Self {
        Self {
            fragment: None,
            pushed_prefix_len: 0,
            remaining: pipeline.ops().to_vec(),
            pushed: PushedState::default(),
        }
    }
}

/// What the compiled SELECT returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectShape {
    /// Every entity column.
    Rows,
    /// A single `COUNT(*)`.
    Count,
}

pub fn plan(pipeline: &Pipeline, dbms: &DbmsType) -> Result<PushdownPlan> {
    let entity = pipeline.entity();
    let view = dbms.predicate_view();
    let mut pushed = PushedState::default();
    let mut paged = false;
    let mut prefix_len = 0;

    for op in pipeline.ops() {
        match op {
            Op::Filter(spec) if !paged => {
                let Some(field) = entity.field(spec.field()) else {
                    break;
                };
                match view.translate(spec, field) {
                    Translation::Expressible(_) => pushed.filters.push(spec.clone()),
                    Translation::NotExpressible(reason) => {
                        debug!(dbms = dbms.name(), op = %op.describe(), reason, "stopping pushdown");
                        break;
                    }
                }
            }
            Op::Sort(key) if !paged => pushed.push_sort(key.clone()),
            Op::Skip(n) => {
                paged = true;
                pushed.push_skip(*n);
            }
            Op::Limit(n) => {
                paged = true;
                pushed.push_limit(*n);
            }
            _ => break,
        }
        prefix_len += 1;
    }

    let fragment = if prefix_len > 0 {
        Some(compile_select(entity, dbms, &pushed, SelectShape::Rows)?)
    } else {
        None
    };
    let remaining = pipeline.ops()[prefix_len..].to_vec();
    debug!(
        dbms = dbms.name(),
        pushed = prefix_len,
        remaining = remaining.len(),
        sql = fragment.as_ref().map(|f| f.text.as_str()).unwrap_or(""),
        "planned pipeline"
    );

    Ok(PushdownPlan {
        fragment,
        pushed_prefix_len: prefix_len,
        remaining,
        pushed,
    })
}

/// Compile a folded state into one SELECT over `entity`'s table.
///
/// Rows come back ordered by the pushed sort keys and then by primary key,
/// so unpushed operations see the same order an in-memory evaluation over
/// primary-key-ordered rows would produce.
pub fn compile_select(
    entity: &EntityDef,
    dbms: &DbmsType,
    pushed: &PushedState,
    shape: SelectShape,
) -> Result<SqlFragment> {
    let view = dbms.predicate_view();
    let mut parameters = Vec::new();

    let mut terms = Vec::with_capacity(pushed.filters.len());
    for spec in &pushed.filters {
        let field = entity.field(spec.field()).ok_or_else(|| {
            StreamError::TranslationInvariant(format!(
                "pushed filter references unknown field `{}`",
                spec.field()
            ))
        })?;
        match view.translate(spec, field) {
            Translation::Expressible(fragment) => {
                terms.push(Expression::Nested(Box::new(Expression::Fragment(fragment.text))));
                parameters.extend(fragment.parameters);
            }
            Translation::NotExpressible(reason) => {
                return Err(StreamError::TranslationInvariant(format!(
                    "pushed filter on `{}` no longer translates: {}",
                    spec.field(),
                    reason
                )));
            }
        }
    }

    let from = TableRef::Table {
        schema: entity.schema().map(String::from),
        name: entity.table().to_string(),
        alias: None,
    };
    let filter = Expression::conjoin(terms);

    let query = match shape {
        SelectShape::Count if !pushed.is_paged() => SelectQuery {
            projections: vec![count_star()],
            from: vec![from],
            filter,
            ..Default::default()
        },
        SelectShape::Count => {
            let pk = entity.primary_key();
            let mut inner = rows_select(entity, dbms, pushed, from, filter, &mut parameters)?;
            inner.projections = vec![SelectItem::Expression {
                expr: Expression::column(&pk.column),
                alias: None,
            }];
            SelectQuery {
                projections: vec![count_star()],
                from: vec![TableRef::Subquery {
                    query: Box::new(Query::Select(Box::new(inner))),
                    alias: COUNT_ALIAS.to_string(),
                }],
                ..Default::default()
            }
        }
        SelectShape::Rows => rows_select(entity, dbms, pushed, from, filter, &mut parameters)?,
    };

    let fragment = SqlFragment::new(
        ast::compile(&Query::Select(Box::new(query)), dbms.descriptor()),
        parameters,
    );
    fragment.check_alignment()?;
    Ok(fragment)
}

fn rows_select(
    entity: &EntityDef,
    dbms: &DbmsType,
    pushed: &PushedState,
    from: TableRef,
    filter: Option<Expression>,
    parameters: &mut Vec<Value>,
) -> Result<SelectQuery> {
    let view = dbms.predicate_view();
    let pk = entity.primary_key();

    let mut order_by = Vec::with_capacity(pushed.order.len() + 1);
    for key in &pushed.order {
        let field = entity.field(&key.field).ok_or_else(|| {
            StreamError::TranslationInvariant(format!(
                "pushed sort references unknown field `{}`",
                key.field
            ))
        })?;
        order_by.push(fragment_order(view.order_term(key, field)));
    }
    if !pushed.order.iter().any(|k| k.field == pk.name) {
        order_by.push(fragment_order(view.order_term(&SortKey::asc(&pk.name), pk)));
    }

    let mut limit = None;
    let mut offset = None;
    let mut next_param = parameters.len();
    if let Some(n) = pushed.limit {
        next_param += 1;
        limit = Some(Expression::Parameter(next_param));
        parameters.push(Value::Int(clamp(n)));
    }
    if pushed.offset > 0 {
        if limit.is_none() {
            limit = dbms
                .descriptor()
                .offset_without_limit()
                .map(|sentinel| Expression::Fragment(sentinel.to_string()));
        }
        next_param += 1;
        offset = Some(Expression::Parameter(next_param));
        parameters.push(Value::Int(clamp(pushed.offset)));
    }

    Ok(SelectQuery {
        projections: entity
            .fields()
            .iter()
            .map(|f| SelectItem::Expression {
                expr: Expression::column(&f.column),
                alias: None,
            })
            .collect(),
        from: vec![from],
        filter,
        order_by,
        limit,
        offset,
    })
}

fn fragment_order(term: String) -> OrderByExpr {
    OrderByExpr {
        expr: Expression::Fragment(term),
        asc: None,
        nulls_first: None,
    }
}

fn count_star() -> SelectItem {
    SelectItem::Expression {
        expr: Expression::Aggregate {
            name: "COUNT".into(),
            args: vec![Expression::Wildcard],
        },
        alias: None,
    }
}

fn clamp(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
